//! Chaos Testing for Catalog Sync
//!
//! This module tests failure scenarios using:
//! 1. **FailingPrimaryStore** - precise error injection on propagation
//! 2. **Slow stores** - propagation timeouts
//! 3. **Catalog outages** - pool closed mid-life
//!
//! # Running Chaos Tests
//! ```bash
//! cargo test --test chaos -- --nocapture
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::watch;

use catalog_sync::{
    CatalogRecord, CatalogStore, CatalogSync, CatalogSyncConfig, CatalogTable, InMemoryPrimaryStore, MetaCell,
    OpType, PrimaryStore, Propagation, StorageError, TsMeta, UidMeta, UidType, WriteOptions,
};

// =============================================================================
// Failing Store Wrapper - Precise Error Injection
// =============================================================================

/// Wraps the in-memory primary store and fails or delays propagation on demand.
struct FailingPrimaryStore {
    inner: InMemoryPrimaryStore,
    failing: AtomicBool,
    delay_ms: AtomicU64,
    delete_delay_ms: AtomicU64,
    calls: AtomicU64,
}

impl FailingPrimaryStore {
    fn new() -> Self {
        Self {
            inner: InMemoryPrimaryStore::new(),
            failing: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
            delete_delay_ms: AtomicU64::new(0),
            calls: AtomicU64::new(0),
        }
    }

    fn fail(&self, on: bool) {
        self.failing.store(on, Ordering::SeqCst);
    }

    fn delay(&self, ms: u64) {
        self.delay_ms.store(ms, Ordering::SeqCst);
    }

    fn delay_deletes(&self, ms: u64) {
        self.delete_delay_ms.store(ms, Ordering::SeqCst);
    }
}

#[async_trait]
impl PrimaryStore for FailingPrimaryStore {
    async fn propagate(&self, change: &Propagation) -> Result<(), StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut delay = self.delay_ms.load(Ordering::SeqCst);
        if matches!(change, Propagation::Delete { .. }) {
            delay += self.delete_delay_ms.load(Ordering::SeqCst);
        }
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("injected: region server unavailable".into()));
        }
        self.inner.propagate(change).await
    }

    async fn scan_meta(&self, after: Option<&MetaCell>, limit: usize) -> Result<Vec<MetaCell>, StorageError> {
        self.inner.scan_meta(after, limit).await
    }

    async fn fetch_tsmeta(&self, tsuid: &str) -> Result<Option<TsMeta>, StorageError> {
        self.inner.fetch_tsmeta(tsuid).await
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn chaos_config(dir: &std::path::Path) -> CatalogSyncConfig {
    CatalogSyncConfig {
        sql_url: Some(format!("sqlite://{}?mode=rwc", dir.join("catalog.db").display())),
        sql_max_connections: 4,
        sync_disabled: true,
        propagate_timeout_ms: 200,
        sequence_increment: 10,
        ..Default::default()
    }
}

async fn start(config: CatalogSyncConfig) -> (CatalogSync, Arc<FailingPrimaryStore>) {
    let primary = Arc::new(FailingPrimaryStore::new());
    let (_tx, rx) = watch::channel(config.clone());
    let mut sync = CatalogSync::new(config, rx, primary.clone());
    sync.start().await.expect("start");
    (sync, primary)
}

async fn write_tagk(sync: &CatalogSync, uid: &str, name: &str) {
    sync.write(CatalogRecord::Uid(UidMeta::new(UidType::Tagk, uid, name)), WriteOptions::catalog())
        .await
        .unwrap();
}

async fn failures(sync: &CatalogSync) -> Vec<catalog_sync::FailureRecord> {
    sync.processor().unwrap().ledger().failures().await.unwrap()
}

// =============================================================================
// Propagation failures
// =============================================================================

#[tokio::test]
async fn test_failed_propagation_is_retried_each_tick_until_it_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let (sync, primary) = start(chaos_config(dir.path())).await;
    write_tagk(&sync, "000001", "host").await;
    primary.fail(true);

    for expected in 1..=3 {
        let report = sync.sync_now().await.unwrap().unwrap();
        assert!(report.aborted.is_none());
        assert_eq!(report.failed(), 1);
        let ledger = failures(&sync).await;
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].table, CatalogTable::Tagk);
        assert_eq!(ledger[0].object_id, "000001");
        assert_eq!(ledger[0].attempts, expected);
        assert!(ledger[0].last_error.as_deref().unwrap_or("").contains("region server unavailable"));
    }
    // The watermark moved on despite the failure
    assert!(sync.processor().unwrap().ledger().watermark(CatalogTable::Tagk).await.unwrap() > 0);

    primary.fail(false);
    let report = sync.sync_now().await.unwrap().unwrap();
    assert_eq!(report.retry.succeeded, 1);
    assert!(failures(&sync).await.is_empty());
    assert_eq!(primary.inner.get_uid(UidType::Tagk, "000001").unwrap().name, "host");
}

#[tokio::test]
async fn test_one_bad_record_does_not_block_the_batch() {
    struct RejectOne(InMemoryPrimaryStore);

    #[async_trait]
    impl PrimaryStore for RejectOne {
        async fn propagate(&self, change: &Propagation) -> Result<(), StorageError> {
            if change.key() == "000002" {
                return Err(StorageError::InvalidRecord("poison".into()));
            }
            self.0.propagate(change).await
        }
        async fn scan_meta(&self, after: Option<&MetaCell>, limit: usize) -> Result<Vec<MetaCell>, StorageError> {
            self.0.scan_meta(after, limit).await
        }
        async fn fetch_tsmeta(&self, tsuid: &str) -> Result<Option<TsMeta>, StorageError> {
            self.0.fetch_tsmeta(tsuid).await
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let config = chaos_config(dir.path());
    let primary = Arc::new(RejectOne(InMemoryPrimaryStore::new()));
    let (_tx, rx) = watch::channel(config.clone());
    let mut sync = CatalogSync::new(config, rx, primary.clone());
    sync.start().await.unwrap();

    for (uid, name) in [("000001", "host"), ("000002", "dc"), ("000003", "rack")] {
        write_tagk(&sync, uid, name).await;
    }
    let report = sync.sync_now().await.unwrap().unwrap();
    assert_eq!(report.tables[0].propagated, 2);
    assert_eq!(report.tables[0].failed, 1);
    assert!(primary.0.get_uid(UidType::Tagk, "000001").is_some());
    assert!(primary.0.get_uid(UidType::Tagk, "000003").is_some());

    let ledger = failures(&sync).await;
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].object_id, "000002");
}

#[tokio::test]
async fn test_failed_insert_of_deleted_row_is_retried_as_delete() {
    let dir = tempfile::tempdir().unwrap();
    let (sync, primary) = start(chaos_config(dir.path())).await;
    write_tagk(&sync, "000001", "host").await;
    primary.fail(true);
    sync.sync_now().await.unwrap();
    assert_eq!(failures(&sync).await.len(), 1);

    sync.delete(CatalogTable::Tagk, "000001", WriteOptions::catalog()).await.unwrap();
    primary.fail(false);
    let report = sync.sync_now().await.unwrap().unwrap();
    assert_eq!(report.retry.succeeded, 1);
    assert_eq!(report.retry.resent, 0);
    // The queued delete was left to the retry
    assert_eq!(report.tables[0].deferred, 1);
    assert_eq!(report.tables[0].propagated, 0);
    assert!(failures(&sync).await.is_empty());
    assert!(primary.inner.get_uid(UidType::Tagk, "000001").is_none());
}

#[tokio::test]
async fn test_failed_delete_is_retried_as_delete() {
    let dir = tempfile::tempdir().unwrap();
    let (sync, primary) = start(chaos_config(dir.path())).await;
    write_tagk(&sync, "000001", "host").await;
    sync.sync_now().await.unwrap();
    assert!(primary.inner.get_uid(UidType::Tagk, "000001").is_some());

    sync.delete(CatalogTable::Tagk, "000001", WriteOptions::catalog()).await.unwrap();
    primary.fail(true);
    sync.sync_now().await.unwrap();
    let ledger = failures(&sync).await;
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].op, OpType::Delete);
    assert_eq!(ledger[0].object_key, "000001");

    primary.fail(false);
    let report = sync.sync_now().await.unwrap().unwrap();
    assert_eq!(report.retry.succeeded, 1);
    assert!(primary.inner.get_uid(UidType::Tagk, "000001").is_none());
    assert!(failures(&sync).await.is_empty());
}

#[tokio::test]
async fn test_reinsert_after_failed_delete_survives_retry() {
    let dir = tempfile::tempdir().unwrap();
    let (sync, primary) = start(chaos_config(dir.path())).await;
    write_tagk(&sync, "000001", "host").await;
    sync.sync_now().await.unwrap();

    sync.delete(CatalogTable::Tagk, "000001", WriteOptions::catalog()).await.unwrap();
    primary.fail(true);
    sync.sync_now().await.unwrap();
    assert_eq!(failures(&sync).await[0].op, OpType::Delete);

    // Same uid comes back before the delete ever reached the primary store
    primary.fail(false);
    primary.delay_deletes(50);
    write_tagk(&sync, "000001", "host2").await;
    let report = sync.sync_now().await.unwrap().unwrap();
    assert!(report.aborted.is_none());
    assert_eq!(report.retry.succeeded, 1);
    assert_eq!(report.tables[0].deferred, 1);
    assert_eq!(report.tables[0].propagated, 0);

    assert!(failures(&sync).await.is_empty());
    assert!(sync.read(CatalogTable::Tagk, "000001").await.unwrap().is_some());
    assert_eq!(primary.inner.get_uid(UidType::Tagk, "000001").unwrap().name, "host2");

    sync.sync_now().await.unwrap();
    assert_eq!(primary.inner.get_uid(UidType::Tagk, "000001").unwrap().name, "host2");
}

#[tokio::test]
async fn test_row_rewritten_during_retry_reaches_primary() {
    /// Renames the row in the catalog while its retry is on the wire.
    struct RewriteDuringRetry {
        inner: InMemoryPrimaryStore,
        failing: AtomicBool,
        catalog: tokio::sync::OnceCell<Arc<CatalogStore>>,
        rewritten: AtomicBool,
    }

    #[async_trait]
    impl PrimaryStore for RewriteDuringRetry {
        async fn propagate(&self, change: &Propagation) -> Result<(), StorageError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StorageError::Backend("injected".into()));
            }
            if let Some(catalog) = self.catalog.get() {
                if !self.rewritten.swap(true, Ordering::SeqCst) {
                    let renamed = CatalogRecord::Uid(UidMeta::new(UidType::Tagk, "000001", "host3"));
                    catalog.write(renamed, WriteOptions::catalog()).await?;
                }
            }
            self.inner.propagate(change).await
        }
        async fn scan_meta(&self, after: Option<&MetaCell>, limit: usize) -> Result<Vec<MetaCell>, StorageError> {
            self.inner.scan_meta(after, limit).await
        }
        async fn fetch_tsmeta(&self, tsuid: &str) -> Result<Option<TsMeta>, StorageError> {
            self.inner.fetch_tsmeta(tsuid).await
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let config = chaos_config(dir.path());
    let primary = Arc::new(RewriteDuringRetry {
        inner: InMemoryPrimaryStore::new(),
        failing: AtomicBool::new(true),
        catalog: tokio::sync::OnceCell::new(),
        rewritten: AtomicBool::new(false),
    });
    let (_tx, rx) = watch::channel(config.clone());
    let mut sync = CatalogSync::new(config, rx, primary.clone());
    sync.start().await.unwrap();

    write_tagk(&sync, "000001", "host").await;
    sync.sync_now().await.unwrap();
    assert_eq!(failures(&sync).await.len(), 1);

    primary.failing.store(false, Ordering::SeqCst);
    primary.catalog.set(Arc::clone(sync.store().unwrap())).ok();
    sync.sync_now().await.unwrap();
    sync.sync_now().await.unwrap();

    assert!(primary.rewritten.load(Ordering::SeqCst));
    assert!(failures(&sync).await.is_empty());
    assert_eq!(primary.inner.get_uid(UidType::Tagk, "000001").unwrap().name, "host3");
}

#[tokio::test]
async fn test_attempt_limit_parks_failures() {
    let dir = tempfile::tempdir().unwrap();
    let config = CatalogSyncConfig {
        max_sync_attempts: Some(2),
        ..chaos_config(dir.path())
    };
    let (sync, primary) = start(config).await;
    write_tagk(&sync, "000001", "host").await;
    primary.fail(true);

    sync.sync_now().await.unwrap();
    sync.sync_now().await.unwrap();
    let calls = primary.calls.load(Ordering::SeqCst);

    let report = sync.sync_now().await.unwrap().unwrap();
    assert_eq!(report.retry.parked, 1);
    assert_eq!(report.retry.attempted, 0);
    assert_eq!(primary.calls.load(Ordering::SeqCst), calls);
    assert_eq!(failures(&sync).await[0].attempts, 2);
}

// =============================================================================
// Timeouts
// =============================================================================

#[tokio::test]
async fn test_slow_primary_store_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let (sync, primary) = start(chaos_config(dir.path())).await;
    write_tagk(&sync, "000001", "host").await;
    primary.delay(1_000);

    let report = sync.sync_now().await.unwrap().unwrap();
    assert_eq!(report.failed(), 1);
    let ledger = failures(&sync).await;
    assert!(ledger[0].last_error.as_deref().unwrap_or("").contains("after"));

    primary.delay(0);
    sync.sync_now().await.unwrap();
    assert!(failures(&sync).await.is_empty());
}

// =============================================================================
// Catalog outage
// =============================================================================

#[tokio::test]
async fn test_catalog_outage_aborts_run_without_losing_work() {
    let dir = tempfile::tempdir().unwrap();
    let (sync, primary) = start(chaos_config(dir.path())).await;
    write_tagk(&sync, "000001", "host").await;

    sync.store().unwrap().pool().close().await;
    let report = sync.sync_now().await.unwrap().unwrap();
    assert!(report.aborted.is_some());
    assert_eq!(report.propagated(), 0);
    assert!(primary.inner.get_uid(UidType::Tagk, "000001").is_none());

    // The processor is free for the next tick
    assert!(!sync.processor().unwrap().is_running());
    assert!(sync.sync_now().await.unwrap().is_some());
}

#[tokio::test]
async fn test_reads_degrade_to_absent_during_outage() {
    let dir = tempfile::tempdir().unwrap();
    let (sync, _primary) = start(chaos_config(dir.path())).await;
    write_tagk(&sync, "000001", "host").await;
    // Cached by the write
    assert_eq!(sync.uid_name(UidType::Tagk, "000001").await.as_deref(), Some("host"));

    sync.store().unwrap().pool().close().await;
    assert_eq!(sync.uid_name(UidType::Tagk, "000001").await.as_deref(), Some("host"));
    assert!(sync.uid(UidType::Tagk, "00000F").await.is_none());
    assert!(sync.tsmeta("000001000001000001").await.is_none());
}
