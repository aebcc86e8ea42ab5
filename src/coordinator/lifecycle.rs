// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Lifecycle management: start, config watch loop, shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::cache::{TagPredicateCache, TsMetaCache, UidCache};
use crate::metasync::MetaSynchronizer;
use crate::storage::sql::CatalogStore;
use crate::storage::traits::{CatalogLookup, StorageError};
use crate::syncqueue::SyncQueueProcessor;

use super::{CatalogSync, Components, EngineState};

/// How long shutdown waits for an in-flight sync run.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(30);

impl CatalogSync {
    /// Start the engine.
    ///
    /// Startup flow:
    /// 1. Connect to the catalog and bootstrap the schema and sequences
    /// 2. Create missing watermark rows
    /// 3. Pre-seed the decode caches from a bounded scan
    /// 4. Schedule the sync processor (unless disabled)
    #[tracing::instrument(skip(self))]
    pub async fn start(&mut self) -> Result<(), StorageError> {
        let startup_start = Instant::now();
        info!("Starting catalog sync...");
        let _ = self.state.send(EngineState::Connecting);
        crate::metrics::set_engine_state("Connecting");

        let config = self.config.read().clone();
        let Some(url) = config.sql_url.clone() else {
            crate::metrics::record_error("catalog", "start", "config");
            let _ = self.state.send(EngineState::Created);
            return Err(StorageError::Backend("sql_url is not configured".into()));
        };

        // ========== PHASE 1: Catalog ==========
        let phase_start = Instant::now();
        let store = match CatalogStore::open(
            &url,
            config.sql_max_connections,
            config.sequence_increment,
            config.native_sequences,
        )
        .await
        {
            Ok(store) => Arc::new(store),
            Err(e) => {
                crate::metrics::record_error("catalog", "connect", "backend");
                let _ = self.state.send(EngineState::Created);
                return Err(e);
            }
        };
        crate::metrics::record_startup_phase("catalog_connect", phase_start.elapsed());

        // ========== PHASE 2: Caches and processor ==========
        let lookup: Arc<dyn CatalogLookup> = store.clone();
        let uids = Arc::new(UidCache::new(Arc::clone(&lookup), &config.uid_cache));
        let tsmeta = Arc::new(TsMetaCache::new(Arc::clone(&lookup), Arc::clone(&uids), &config.tsmeta_cache));
        let predicates = Arc::new(TagPredicateCache::new(lookup, &config.predicate_cache));

        let processor = Arc::new(SyncQueueProcessor::new(
            Arc::clone(&store),
            Arc::clone(&self.primary),
            Arc::clone(&uids),
            &config,
        ));
        processor.init().await?;
        let metasync = MetaSynchronizer::new(Arc::clone(&self.primary), Arc::clone(&store), &config);

        // ========== PHASE 3: Warm-up ==========
        let _ = self.state.send(EngineState::WarmingUp);
        crate::metrics::set_engine_state("WarmingUp");
        let phase_start = Instant::now();
        // A failed seed only costs cold misses
        match uids.seed().await {
            Ok(n) => debug!(entries = n, "UID caches warm"),
            Err(e) => warn!(error = %e, "UID cache seed failed"),
        }
        match tsmeta.seed().await {
            Ok(n) => debug!(entries = n, "TSMeta cache warm"),
            Err(e) => warn!(error = %e, "TSMeta cache seed failed"),
        }
        crate::metrics::record_startup_phase("cache_warmup", phase_start.elapsed());

        // ========== PHASE 4: Schedule ==========
        if config.sync_scheduled() {
            processor.schedule(config.sync_initial_delay(), config.sync_period());
        } else {
            info!(
                disabled = config.sync_disabled,
                period_secs = config.sync_period_secs,
                "Sync processor not scheduled"
            );
        }

        self.components = Some(Components {
            store,
            uids,
            tsmeta,
            predicates,
            processor,
            metasync,
        });

        let _ = self.state.send(EngineState::Ready);
        crate::metrics::set_engine_state("Ready");
        crate::metrics::record_startup_phase("total", startup_start.elapsed());
        info!(elapsed_ms = startup_start.elapsed().as_millis() as u64, "Catalog sync ready");
        Ok(())
    }

    /// Watch for config updates until shutdown.
    ///
    /// A changed sync period or `sync_disabled` flag reschedules the processor.
    #[tracing::instrument(skip(self))]
    pub async fn run(&self) {
        let _ = self.state.send(EngineState::Running);
        crate::metrics::set_engine_state("Running");
        info!("Catalog sync running");

        let mut state_rx = self.state_receiver();
        let mut config_rx = self.config_rx.lock().await;
        let mut metrics_interval = tokio::time::interval(Duration::from_secs(10));

        loop {
            tokio::select! {
                changed = config_rx.changed() => {
                    if changed.is_err() {
                        debug!("Config sender dropped, no further updates");
                        break;
                    }
                    let new_config = config_rx.borrow_and_update().clone();
                    self.apply_config(new_config);
                }

                changed = state_rx.changed() => {
                    if changed.is_err() || *state_rx.borrow() == EngineState::ShuttingDown {
                        break;
                    }
                }

                _ = metrics_interval.tick() => {
                    self.export_metrics();
                }
            }
        }
    }

    fn apply_config(&self, new_config: crate::config::CatalogSyncConfig) {
        let reschedule = {
            let current = self.config.read();
            current.sync_period_secs != new_config.sync_period_secs
                || current.sync_disabled != new_config.sync_disabled
        };
        info!(
            sync_period_secs = new_config.sync_period_secs,
            sync_disabled = new_config.sync_disabled,
            "Config updated"
        );

        if reschedule {
            if let Some(parts) = &self.components {
                if new_config.sync_scheduled() {
                    parts.processor.set_sync_period(new_config.sync_period_secs);
                } else {
                    parts.processor.unschedule();
                    info!("Sync processor unscheduled");
                }
            }
        }
        *self.config.write() = new_config;
    }

    /// Initiate graceful shutdown.
    ///
    /// Cancels the schedule, waits for an in-flight run to settle, then closes
    /// the catalog pool.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        let shutdown_start = Instant::now();
        info!("Initiating catalog sync shutdown...");
        let _ = self.state.send(EngineState::ShuttingDown);
        crate::metrics::set_engine_state("ShuttingDown");

        if let Some(parts) = &self.components {
            parts.processor.unschedule();
            let deadline = Instant::now() + SHUTDOWN_DRAIN;
            while parts.processor.is_running() && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            if parts.processor.is_running() {
                warn!("Sync run still in progress at shutdown");
            }
            self.export_metrics();
            parts.store.pool().close().await;
        }

        crate::metrics::record_startup_phase("shutdown", shutdown_start.elapsed());
        info!("Catalog sync shutdown complete");
    }
}
