// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bulk backfill of the catalog from the primary store.
//!
//! Scans the primary store's metadata region in bounded batches, fetches each
//! time series not yet seen and indexes it (metric UID, tag UIDs, then the
//! series) through the catalog write path with capture suppressed. Used for
//! initial population or repair, not the steady-state path.

pub mod pool;

pub use pool::{Submitted, WorkerPool};

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};
use crate::capture::WriteOptions;
use crate::config::CatalogSyncConfig;
use crate::metrics;
use crate::record::{CatalogRecord, TsMeta, UidMeta, UidType};
use crate::storage::sql::CatalogStore;
use crate::storage::traits::{MetaCell, PrimaryStore, StorageError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaSyncReport {
    /// Time series indexed
    pub processed: u64,
    /// Cells whose time series had already been dispatched
    pub already_seen: u64,
    /// Time series the primary store no longer had at fetch time
    pub missing: u64,
    pub errors: u64,
    /// Distinct UIDs indexed
    pub uids: u64,
    pub scan_elapsed: Duration,
    /// Summed over all fetches
    pub fetch_elapsed: Duration,
    pub elapsed: Duration,
    /// Scan error that ended the backfill early
    pub aborted: Option<String>,
}

#[derive(Default)]
struct Progress {
    processed: AtomicU64,
    missing: AtomicU64,
    errors: AtomicU64,
    uids: AtomicU64,
    fetch_micros: AtomicU64,
}

/// Shared by every dispatched task of one run.
struct Indexer {
    primary: Arc<dyn PrimaryStore>,
    store: Arc<CatalogStore>,
    fetch_timeout: Duration,
    // Written at most once per run; concurrent series wait on the same write
    seen_uids: DashMap<(UidType, String), Arc<OnceCell<()>>>,
    progress: Progress,
}

impl Indexer {
    async fn index(&self, tsuid: String) {
        let start = Instant::now();
        let fetched = tokio::time::timeout(self.fetch_timeout, self.primary.fetch_tsmeta(&tsuid)).await;
        self.progress
            .fetch_micros
            .fetch_add(start.elapsed().as_micros() as u64, Ordering::Relaxed);

        let meta = match fetched {
            Ok(Ok(Some(meta))) => meta,
            Ok(Ok(None)) => {
                self.progress.missing.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Ok(Err(e)) => {
                warn!(tsuid = %tsuid, error = %e, "Backfill fetch failed");
                self.progress.errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(_) => {
                warn!(tsuid = %tsuid, timeout_ms = self.fetch_timeout.as_millis() as u64, "Backfill fetch timed out");
                self.progress.errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        match self.write(meta).await {
            Ok(()) => {
                self.progress.processed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(tsuid = %tsuid, error = %e, "Backfill index failed");
                self.progress.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn write(&self, meta: TsMeta) -> Result<(), StorageError> {
        let opts = WriteOptions::propagation();
        let uids: Vec<UidMeta> = std::iter::once(meta.metric.clone())
            .chain(meta.tags.iter().cloned())
            .collect();
        for uid in uids {
            let cell = Arc::clone(&self.seen_uids.entry((uid.uid_type, uid.uid.clone())).or_default());
            // A failed write leaves the cell empty for a later series to retry
            cell.get_or_try_init(|| async move {
                self.store.write(CatalogRecord::Uid(uid), opts).await?;
                self.progress.uids.fetch_add(1, Ordering::Relaxed);
                Ok::<(), StorageError>(())
            })
            .await?;
        }
        self.store.write(CatalogRecord::TsMeta(meta), opts).await?;
        Ok(())
    }
}

pub struct MetaSynchronizer {
    primary: Arc<dyn PrimaryStore>,
    store: Arc<CatalogStore>,
    batch_size: usize,
    scan_timeout: Duration,
    fetch_timeout: Duration,
    workers: usize,
    queue_capacity: usize,
    progress_period: Duration,
    // One backfill at a time
    running: tokio::sync::Mutex<()>,
}

impl MetaSynchronizer {
    pub fn new(primary: Arc<dyn PrimaryStore>, store: Arc<CatalogStore>, config: &CatalogSyncConfig) -> Self {
        Self {
            primary,
            store,
            batch_size: config.metasync_batch_size.max(1),
            scan_timeout: Duration::from_millis(config.metasync_scan_timeout_ms),
            fetch_timeout: Duration::from_millis(config.metasync_fetch_timeout_ms),
            workers: config.metasync_workers,
            queue_capacity: config.metasync_queue_capacity,
            progress_period: Duration::from_secs(config.metasync_progress_secs.max(1)),
            running: tokio::sync::Mutex::new(()),
        }
    }

    /// Scan the whole metadata region and index every time series found.
    /// Returns once all dispatched work has settled.
    #[tracing::instrument(skip(self))]
    pub async fn run(&self) -> MetaSyncReport {
        let _running = self.running.lock().await;
        let start = Instant::now();
        let indexer = Arc::new(Indexer {
            primary: Arc::clone(&self.primary),
            store: Arc::clone(&self.store),
            fetch_timeout: self.fetch_timeout,
            seen_uids: DashMap::new(),
            progress: Progress::default(),
        });
        let pool = WorkerPool::new(self.workers, self.queue_capacity);

        let mut report = MetaSyncReport::default();
        let mut seen: HashSet<String> = HashSet::new();
        let mut after: Option<MetaCell> = None;
        info!(batch_size = self.batch_size, workers = self.workers, "Backfill starting");

        loop {
            let scan_start = Instant::now();
            let batch = tokio::time::timeout(
                self.scan_timeout,
                self.primary.scan_meta(after.as_ref(), self.batch_size),
            )
            .await;
            report.scan_elapsed += scan_start.elapsed();

            let cells = match batch {
                Ok(Ok(cells)) => cells,
                Ok(Err(e)) => {
                    error!(error = %e, "Backfill scan failed");
                    report.aborted = Some(e.to_string());
                    break;
                }
                Err(_) => {
                    let e = StorageError::Timeout(format!("metadata scan after {:?}", self.scan_timeout));
                    error!(error = %e, "Backfill scan timed out");
                    report.aborted = Some(e.to_string());
                    break;
                }
            };
            let Some(last) = cells.last().cloned() else { break };

            for cell in &cells {
                let tsuid = cell.tsuid();
                if !seen.insert(tsuid.clone()) {
                    report.already_seen += 1;
                    continue;
                }
                let indexer = Arc::clone(&indexer);
                pool.submit(async move { indexer.index(tsuid).await }).await;
            }
            debug!(cells = cells.len(), distinct = seen.len(), "Backfill batch dispatched");
            after = Some(last);
        }

        let already_seen = report.already_seen;
        pool.wait_idle(self.progress_period, |outstanding| {
            let p = &indexer.progress;
            let processed = p.processed.load(Ordering::Relaxed);
            let errors = p.errors.load(Ordering::Relaxed);
            metrics::set_metasync_progress(processed, already_seen, errors);
            info!(processed, errors, outstanding, "Backfill in progress");
        })
        .await;
        let inline = pool.ran_inline();
        let panicked = pool.panicked();
        pool.shutdown().await;

        let p = &indexer.progress;
        report.processed = p.processed.load(Ordering::Relaxed);
        report.missing = p.missing.load(Ordering::Relaxed);
        report.errors = p.errors.load(Ordering::Relaxed) + panicked;
        report.uids = p.uids.load(Ordering::Relaxed);
        report.fetch_elapsed = Duration::from_micros(p.fetch_micros.load(Ordering::Relaxed));
        report.elapsed = start.elapsed();

        metrics::set_metasync_progress(report.processed, report.already_seen, report.errors);
        metrics::record_metasync_run(report.aborted.is_none(), report.elapsed);
        info!(
            processed = report.processed,
            already_seen = report.already_seen,
            missing = report.missing,
            errors = report.errors,
            uids = report.uids,
            ran_inline = inline,
            scan_ms = report.scan_elapsed.as_millis() as u64,
            fetch_ms = report.fetch_elapsed.as_millis() as u64,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Backfill complete"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::record::{CatalogTable, Propagation};
    use crate::storage::memory::InMemoryPrimaryStore;
    use crate::storage::sql::testing::{queue_rows, temp_store};

    fn series(metric: (&str, &str), pairs: &[(&str, &str, &str, &str)]) -> TsMeta {
        TsMeta::new(
            UidMeta::new(UidType::Metric, metric.0, metric.1),
            pairs
                .iter()
                .map(|(ku, kn, vu, vn)| {
                    (UidMeta::new(UidType::Tagk, *ku, *kn), UidMeta::new(UidType::Tagv, *vu, *vn))
                })
                .collect(),
        )
    }

    fn primary_with_series() -> Arc<InMemoryPrimaryStore> {
        let primary = Arc::new(InMemoryPrimaryStore::new());
        primary
            .insert_tsmeta(series(("000001", "sys.cpu"), &[("000001", "host", "000001", "web01")]))
            .unwrap();
        primary
            .insert_tsmeta(series(("000001", "sys.cpu"), &[("000001", "host", "000002", "web02")]))
            .unwrap();
        primary
            .insert_tsmeta(series(("000002", "sys.mem"), &[("000001", "host", "000001", "web01")]))
            .unwrap();
        primary
    }

    fn small_config() -> CatalogSyncConfig {
        CatalogSyncConfig {
            metasync_batch_size: 2,
            metasync_workers: 2,
            metasync_queue_capacity: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_backfill_indexes_every_series_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(temp_store(dir.path()).await);
        let primary = primary_with_series();

        let sync = MetaSynchronizer::new(primary.clone(), store.clone(), &small_config());
        let report = sync.run().await;

        assert!(report.aborted.is_none());
        assert_eq!(report.processed, 3);
        // Two cells per series in the metadata region
        assert_eq!(report.already_seen, 3);
        assert_eq!(report.errors, 0);
        assert_eq!(report.uids, 5);

        assert_eq!(store.count(CatalogTable::TsMeta).await.unwrap(), 3);
        assert_eq!(store.count(CatalogTable::Metric).await.unwrap(), 2);
        let indexed = store.get_tsmeta("000002000001000001").await.unwrap().unwrap();
        assert_eq!(indexed.fqn, "sys.mem:host=web01");
    }

    #[tokio::test]
    async fn test_backfill_does_not_queue_changes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(temp_store(dir.path()).await);
        let sync = MetaSynchronizer::new(primary_with_series(), store.clone(), &small_config());

        sync.run().await;
        assert!(queue_rows(&store).await.is_empty());
    }

    #[tokio::test]
    async fn test_second_backfill_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(temp_store(dir.path()).await);
        let sync = MetaSynchronizer::new(primary_with_series(), store.clone(), &small_config());

        sync.run().await;
        let before = store.get_tsmeta("000001000001000001").await.unwrap().unwrap();
        let report = sync.run().await;
        assert_eq!(report.processed, 3);
        let after = store.get_tsmeta("000001000001000001").await.unwrap().unwrap();
        assert_eq!(before.last_update, after.last_update);
        assert_eq!(before.fqnid, after.fqnid);
    }

    struct BrokenScan;

    #[async_trait]
    impl PrimaryStore for BrokenScan {
        async fn propagate(&self, _change: &Propagation) -> Result<(), StorageError> {
            Ok(())
        }

        async fn scan_meta(&self, _after: Option<&MetaCell>, _limit: usize) -> Result<Vec<MetaCell>, StorageError> {
            Err(StorageError::Backend("region offline".into()))
        }

        async fn fetch_tsmeta(&self, _tsuid: &str) -> Result<Option<TsMeta>, StorageError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_scan_failure_aborts_with_report() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(temp_store(dir.path()).await);
        let sync = MetaSynchronizer::new(Arc::new(BrokenScan), store, &small_config());

        let report = sync.run().await;
        assert!(report.aborted.unwrap().contains("region offline"));
        assert_eq!(report.processed, 0);
    }
}
