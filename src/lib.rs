//! # Catalog Sync
//!
//! Change capture, propagation and decode caching for a relational catalog
//! that mirrors the metadata of a column-family time-series store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Catalog writes                         │
//! │  • CatalogSync::write / delete with WriteOptions            │
//! │  • Trigger: version stamp, validation, suppression          │
//! │  • Sync queue row in the same transaction                   │
//! │  • UID rename cascades into tag pair names and FQNs         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                  (scheduled, single-flight ticks)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Sync queue processor                      │
//! │  • Retry phase: failure ledger, latest first                │
//! │  • New-work phase: LAST_UPDATE > watermark, per table       │
//! │  • Watermark moves only after the batch settles             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Primary store                          │
//! │  • Idempotent upsert / delete per record                    │
//! │  • Metadata scan feeds the bulk backfill (MetaSynchronizer) │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Read paths go through three decode caches (UID, TSMeta, tag predicate),
//! bounded and single-flight, loading from the catalog on miss.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use catalog_sync::{
//!     CatalogRecord, CatalogSync, CatalogSyncConfig, InMemoryPrimaryStore, UidMeta, UidType,
//!     WriteOptions,
//! };
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = CatalogSyncConfig {
//!         sql_url: Some("sqlite:catalog.db?mode=rwc".into()),
//!         ..Default::default()
//!     };
//!
//!     let (_tx, rx) = watch::channel(config.clone());
//!     let mut sync = CatalogSync::new(config, rx, Arc::new(InMemoryPrimaryStore::new()));
//!     sync.start().await.expect("Failed to start");
//!
//!     // A catalog edit: versioned and queued for propagation
//!     let host = UidMeta::new(UidType::Tagk, "000001", "host");
//!     sync.write(CatalogRecord::Uid(host), WriteOptions::catalog()).await.expect("write");
//!
//!     // Propagate without waiting for the next tick
//!     let report = sync.sync_now().await.expect("sync").expect("not already running");
//!     println!("propagated {}", report.propagated());
//!
//!     sync.shutdown().await;
//! }
//! ```
//!
//! ## Configuration
//!
//! See [`CatalogSyncConfig`] for all configuration options.
//!
//! ## Modules
//!
//! - [`coordinator`]: The [`CatalogSync`] facade and its lifecycle
//! - [`capture`]: Write options, the change capture trigger, rename cascade
//! - [`storage`]: Catalog store (SQL), primary store trait, in-memory primary store
//! - [`syncqueue`]: Watermarks, queue, failure ledger and the sync processor
//! - [`cache`]: UID, TSMeta and tag predicate decode caches
//! - [`sequence`]: Batched id allocation over native or counter-table sequences
//! - [`metasync`]: Bulk backfill from the primary store
//! - [`resilience`]: Retry logic

pub mod config;
pub mod record;
pub mod storage;
pub mod capture;
pub mod sequence;
pub mod cache;
pub mod syncqueue;
pub mod metasync;
pub mod resilience;
pub mod coordinator;
pub mod metrics;

pub use config::{CacheConfig, CatalogSyncConfig};
pub use coordinator::{CatalogSync, CatalogSyncStats, EngineState};
pub use record::{
    Annotation, CatalogRecord, CatalogTable, OpType, Propagation, TsMeta, UidMeta, UidType,
};
pub use capture::{
    CascadeReport, Capture, ChangeCaptureTrigger, ChangeOrigin, SyncQueueEntry, TriggerStats,
    UidRename, WriteOptions,
};
pub use storage::traits::{CatalogLookup, MetaCell, PrimaryStore, StorageError};
pub use storage::sql::{CatalogStore, WriteOutcome};
pub use storage::memory::InMemoryPrimaryStore;
pub use cache::{CacheStats, TagPredicateCache, TagPredicateSet, TsMetaCache, UidCache};
pub use sequence::{SequenceAllocator, SequenceStats};
pub use syncqueue::{FailureRecord, SyncLedger, SyncQueueProcessor, SyncRunReport, TableReport, Watermark};
pub use metasync::{MetaSyncReport, MetaSynchronizer};
pub use resilience::retry::RetryConfig;
pub use metrics::LatencyTimer;
