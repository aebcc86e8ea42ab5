// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the catalog sync coordinator.

use crate::cache::CacheStats;
use crate::capture::TriggerStats;
use crate::sequence::SequenceStats;
use crate::syncqueue::SyncRunReport;

/// Engine lifecycle state.
///
/// The engine progresses through states during startup and shutdown.
/// Use [`super::CatalogSync::state()`] to check current state or
/// [`super::CatalogSync::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Just created, not yet started
    Created,
    /// Connecting to the catalog and bootstrapping the schema
    Connecting,
    /// Pre-seeding the decode caches
    WarmingUp,
    /// Ready to accept writes
    Ready,
    /// Config watch loop running
    Running,
    /// Graceful shutdown in progress
    ShuttingDown,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Connecting => write!(f, "Connecting"),
            Self::WarmingUp => write!(f, "WarmingUp"),
            Self::Ready => write!(f, "Ready"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
        }
    }
}

/// Point-in-time view of every component, for a management surface.
#[derive(Debug, Clone, Default)]
pub struct CatalogSyncStats {
    /// Metric, tagk and tagv caches in that order
    pub uid_caches: Vec<CacheStats>,
    pub tsmeta_cache: CacheStats,
    pub predicate_cache: CacheStats,
    pub trigger: TriggerStats,
    pub sequences: Vec<SequenceStats>,
    pub queue_depth: i64,
    pub failures: usize,
    pub last_run: Option<SyncRunReport>,
    pub sync_running: bool,
}
