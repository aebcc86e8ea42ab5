// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Catalog sync coordinator.
//!
//! The [`CatalogSync`] facade ties together all components:
//! - the relational catalog with captured writes
//! - the UID, TSMeta and tag predicate decode caches
//! - the scheduled sync processor that propagates changes to the primary store
//! - the bulk backfill from the primary store
//!
//! # Lifecycle
//!
//! ```text
//! Created → Connecting → WarmingUp → Ready → Running → ShuttingDown
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use catalog_sync::{CatalogSync, CatalogSyncConfig, EngineState, InMemoryPrimaryStore};
//! use tokio::sync::watch;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = CatalogSyncConfig {
//!     sql_url: Some("sqlite:catalog.db?mode=rwc".into()),
//!     ..Default::default()
//! };
//! let (_tx, rx) = watch::channel(config.clone());
//! let mut sync = CatalogSync::new(config, rx, Arc::new(InMemoryPrimaryStore::new()));
//!
//! assert_eq!(sync.state(), EngineState::Created);
//! sync.start().await.expect("Start failed");
//! assert!(sync.is_ready());
//! # }
//! ```

mod lifecycle;
mod types;

pub use types::{CatalogSyncStats, EngineState};

use std::sync::Arc;
use parking_lot::RwLock;
use tokio::sync::{watch, Mutex};
use tracing::debug;

use crate::cache::{TagPredicateCache, TagPredicateSet, TsMetaCache, UidCache};
use crate::capture::WriteOptions;
use crate::config::CatalogSyncConfig;
use crate::metasync::{MetaSyncReport, MetaSynchronizer};
use crate::record::{CatalogRecord, CatalogTable, TsMeta, UidMeta, UidType};
use crate::storage::sql::{CatalogStore, WriteOutcome};
use crate::storage::traits::{PrimaryStore, StorageError};
use crate::syncqueue::{SyncQueueProcessor, SyncRunReport};

/// Everything built by [`CatalogSync::start`].
pub(super) struct Components {
    pub(super) store: Arc<CatalogStore>,
    pub(super) uids: Arc<UidCache>,
    pub(super) tsmeta: Arc<TsMetaCache>,
    pub(super) predicates: Arc<TagPredicateCache>,
    pub(super) processor: Arc<SyncQueueProcessor>,
    pub(super) metasync: MetaSynchronizer,
}

/// Catalog sync facade.
///
/// # Thread Safety
///
/// After [`start`](Self::start) every operation takes `&self`; share the
/// facade behind an `Arc` once started.
pub struct CatalogSync {
    /// Configuration (can be updated at runtime via watch channel)
    pub(super) config: RwLock<CatalogSyncConfig>,

    /// Runtime config updates (Mutex for interior mutability in run loop)
    pub(super) config_rx: Mutex<watch::Receiver<CatalogSyncConfig>>,

    /// Engine state (broadcast to watchers)
    pub(super) state: watch::Sender<EngineState>,

    /// Engine state receiver (for internal use)
    pub(super) state_rx: watch::Receiver<EngineState>,

    /// Where propagated changes land
    pub(super) primary: Arc<dyn PrimaryStore>,

    pub(super) components: Option<Components>,
}

impl CatalogSync {
    /// Create a new facade.
    ///
    /// It starts in `Created` state. Call [`start()`](Self::start) to connect
    /// to the catalog and transition to `Ready`.
    pub fn new(
        config: CatalogSyncConfig,
        config_rx: watch::Receiver<CatalogSyncConfig>,
        primary: Arc<dyn PrimaryStore>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        Self {
            config: RwLock::new(config),
            config_rx: Mutex::new(config_rx),
            state: state_tx,
            state_rx,
            primary,
            components: None,
        }
    }

    /// Get current engine state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Check if ready to accept writes.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.state(), EngineState::Ready | EngineState::Running)
    }

    pub(super) fn parts(&self) -> Result<&Components, StorageError> {
        self.components
            .as_ref()
            .ok_or_else(|| StorageError::Backend(format!("catalog sync not started (state {})", self.state())))
    }

    pub fn store(&self) -> Result<&Arc<CatalogStore>, StorageError> {
        Ok(&self.parts()?.store)
    }

    pub fn processor(&self) -> Result<&Arc<SyncQueueProcessor>, StorageError> {
        Ok(&self.parts()?.processor)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Writes
    // ═══════════════════════════════════════════════════════════════════════

    /// Write a catalog record with change capture, then refresh the caches
    /// it affects.
    #[tracing::instrument(skip(self, record), fields(table = %record.table()))]
    pub async fn write(&self, record: CatalogRecord, opts: WriteOptions) -> Result<WriteOutcome, StorageError> {
        let parts = self.parts()?;
        let outcome = parts.store.write(record, opts).await?;
        if outcome.changed() {
            self.after_write(parts, &outcome);
        }
        Ok(outcome)
    }

    fn after_write(&self, parts: &Components, outcome: &WriteOutcome) {
        match &outcome.record {
            CatalogRecord::Uid(uid) => {
                parts.uids.put(uid.clone());
                if outcome.rename.is_some() {
                    for tsuid in &outcome.cascade.tsuids {
                        parts.tsmeta.invalidate(tsuid);
                    }
                    if !outcome.cascade.tag_pairs.is_empty() {
                        parts.predicates.invalidate_all();
                    }
                    debug!(
                        tsmeta = outcome.cascade.tsuids.len(),
                        tag_pairs = outcome.cascade.tag_pairs.len(),
                        "Caches invalidated after rename"
                    );
                }
            }
            CatalogRecord::TsMeta(meta) => {
                parts.tsmeta.invalidate(&meta.tsuid);
                // New series may create tag pairs that cached predicates would match
                parts.predicates.invalidate_all();
            }
            CatalogRecord::Annotation(_) => {}
        }
    }

    /// Delete a catalog record by natural key with change capture.
    #[tracing::instrument(skip(self))]
    pub async fn delete(
        &self,
        table: CatalogTable,
        key: &str,
        opts: WriteOptions,
    ) -> Result<Option<CatalogRecord>, StorageError> {
        let parts = self.parts()?;
        let removed = parts.store.delete(table, key, opts).await?;
        match &removed {
            Some(CatalogRecord::Uid(uid)) => parts.uids.invalidate(uid.uid_type, &uid.uid),
            Some(CatalogRecord::TsMeta(meta)) => {
                parts.tsmeta.invalidate(&meta.tsuid);
                parts.predicates.invalidate_all();
            }
            _ => {}
        }
        Ok(removed)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Reads
    // ═══════════════════════════════════════════════════════════════════════

    /// UID definition through the cache. Lookup failures read as absent.
    pub async fn uid(&self, uid_type: UidType, uid: &str) -> Option<UidMeta> {
        let parts = self.components.as_ref()?;
        parts.uids.get(uid_type, uid).await
    }

    pub async fn uid_name(&self, uid_type: UidType, uid: &str) -> Option<String> {
        self.uid(uid_type, uid).await.map(|m| m.name)
    }

    /// Fully decoded time-series metadata through the cache.
    pub async fn tsmeta(&self, tsuid: &str) -> Option<TsMeta> {
        let parts = self.components.as_ref()?;
        parts.tsmeta.get(tsuid).await
    }

    /// Tag pair UIDs matching every predicate, through the predicate cache.
    pub async fn resolve_tag_predicates(&self, predicates: &TagPredicateSet) -> Result<Vec<String>, StorageError> {
        self.parts()?.predicates.resolve_set(predicates).await
    }

    /// Uncached read of a catalog row by natural key.
    pub async fn read(&self, table: CatalogTable, key: &str) -> Result<Option<CatalogRecord>, StorageError> {
        self.parts()?.store.read(table, key).await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sync
    // ═══════════════════════════════════════════════════════════════════════

    /// Run the sync processor once, now. `None` when a run is already in progress.
    pub async fn sync_now(&self) -> Result<Option<SyncRunReport>, StorageError> {
        Ok(self.parts()?.processor.run_once().await)
    }

    /// Change the processor period; `<= 1` leaves it unscheduled.
    pub fn set_sync_period(&self, period_secs: u64) -> Result<bool, StorageError> {
        self.config.write().sync_period_secs = period_secs;
        Ok(self.parts()?.processor.set_sync_period(period_secs))
    }

    /// Backfill the catalog from the primary store. Caches are flushed after,
    /// since rows were written underneath them.
    pub async fn metasync(&self) -> Result<MetaSyncReport, StorageError> {
        let parts = self.parts()?;
        let report = parts.metasync.run().await;
        parts.uids.invalidate_all();
        parts.tsmeta.invalidate_all();
        parts.predicates.invalidate_all();
        Ok(report)
    }

    /// Snapshot of cache, trigger, sequence and sync state.
    pub async fn stats(&self) -> Result<CatalogSyncStats, StorageError> {
        let parts = self.parts()?;
        let ledger = parts.processor.ledger();
        Ok(CatalogSyncStats {
            uid_caches: parts.uids.stats(),
            tsmeta_cache: parts.tsmeta.stats(),
            predicate_cache: parts.predicates.stats(),
            trigger: parts.store.trigger_stats(),
            sequences: parts.store.sequence_stats(),
            queue_depth: ledger.queue_depth().await?,
            failures: ledger.failures().await?.len(),
            last_run: parts.processor.last_report(),
            sync_running: parts.processor.is_running(),
        })
    }

    /// Push cache gauges to the metrics recorder.
    pub fn export_metrics(&self) {
        if let Some(parts) = &self.components {
            parts.uids.export_metrics();
            parts.tsmeta.export_metrics();
            parts.predicates.export_metrics();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TagPredicateSet;
    use crate::storage::memory::InMemoryPrimaryStore;

    fn config(dir: &std::path::Path) -> CatalogSyncConfig {
        CatalogSyncConfig {
            sql_url: Some(format!("sqlite://{}?mode=rwc", dir.join("catalog.db").display())),
            sql_max_connections: 4,
            sync_disabled: true,
            sequence_increment: 5,
            ..Default::default()
        }
    }

    async fn started(dir: &std::path::Path) -> (CatalogSync, Arc<InMemoryPrimaryStore>) {
        let config = config(dir);
        let (_tx, rx) = watch::channel(config.clone());
        let primary = Arc::new(InMemoryPrimaryStore::new());
        let mut sync = CatalogSync::new(config, rx, primary.clone());
        sync.start().await.unwrap();
        (sync, primary)
    }

    #[test]
    fn test_created_state() {
        let config = CatalogSyncConfig::default();
        let (_tx, rx) = watch::channel(config.clone());
        let sync = CatalogSync::new(config, rx, Arc::new(InMemoryPrimaryStore::new()));
        assert_eq!(sync.state(), EngineState::Created);
        assert!(!sync.is_ready());
        assert!(sync.store().is_err());
    }

    #[tokio::test]
    async fn test_start_without_url_fails() {
        let config = CatalogSyncConfig::default();
        let (_tx, rx) = watch::channel(config.clone());
        let mut sync = CatalogSync::new(config, rx, Arc::new(InMemoryPrimaryStore::new()));
        assert!(sync.start().await.is_err());
        assert!(!sync.is_ready());
    }

    #[tokio::test]
    async fn test_write_refreshes_uid_cache() {
        let dir = tempfile::tempdir().unwrap();
        let (sync, _primary) = started(dir.path()).await;
        assert!(sync.is_ready());

        let uid = UidMeta::new(UidType::Metric, "000001", "sys.cpu");
        sync.write(CatalogRecord::Uid(uid.clone()), WriteOptions::catalog()).await.unwrap();
        assert_eq!(sync.uid_name(UidType::Metric, "000001").await.as_deref(), Some("sys.cpu"));

        let mut renamed = uid;
        renamed.name = "sys.cpu.user".into();
        sync.write(CatalogRecord::Uid(renamed), WriteOptions::catalog()).await.unwrap();
        assert_eq!(sync.uid_name(UidType::Metric, "000001").await.as_deref(), Some("sys.cpu.user"));

        sync.delete(CatalogTable::Metric, "000001", WriteOptions::catalog()).await.unwrap();
        assert!(sync.uid(UidType::Metric, "000001").await.is_none());
    }

    #[tokio::test]
    async fn test_rename_invalidates_decoded_series() {
        let dir = tempfile::tempdir().unwrap();
        let (sync, _primary) = started(dir.path()).await;
        let series = crate::storage::sql::testing::seed_series(sync.store().unwrap()).await;

        let cached = sync.tsmeta(&series.tsuid).await.unwrap();
        assert_eq!(cached.fqn, "sys.cpu:host=web01,dc=lon");

        let renamed = UidMeta::new(UidType::Tagv, "000001", "web99");
        sync.write(CatalogRecord::Uid(renamed), WriteOptions::catalog()).await.unwrap();
        let decoded = sync.tsmeta(&series.tsuid).await.unwrap();
        assert_eq!(decoded.fqn, "sys.cpu:host=web99,dc=lon");
        assert_eq!(decoded.tags[1].name, "web99");
    }

    #[tokio::test]
    async fn test_predicates_resolve_through_facade() {
        let dir = tempfile::tempdir().unwrap();
        let (sync, _primary) = started(dir.path()).await;
        crate::storage::sql::testing::seed_series(sync.store().unwrap()).await;

        let set = TagPredicateSet::parse([("host", "web*")]).unwrap();
        let pairs = sync.resolve_tag_predicates(&set).await.unwrap();
        assert_eq!(pairs, vec!["000001000001".to_string()]);
    }

    #[tokio::test]
    async fn test_sync_now_and_stats() {
        let dir = tempfile::tempdir().unwrap();
        let (sync, primary) = started(dir.path()).await;
        sync.write(
            CatalogRecord::Uid(UidMeta::new(UidType::Tagk, "000001", "host")),
            WriteOptions::catalog(),
        )
        .await
        .unwrap();

        let before = sync.stats().await.unwrap();
        assert_eq!(before.queue_depth, 1);
        assert!(before.last_run.is_none());

        let report = sync.sync_now().await.unwrap().unwrap();
        assert_eq!(report.propagated(), 1);
        assert_eq!(primary.get_uid(UidType::Tagk, "000001").unwrap().name, "host");

        let after = sync.stats().await.unwrap();
        assert_eq!(after.queue_depth, 0);
        assert_eq!(after.failures, 0);
        assert!(after.last_run.is_some());
        assert_eq!(after.uid_caches.len(), 3);
        assert!(after.trigger.calls >= 1);
    }
}
