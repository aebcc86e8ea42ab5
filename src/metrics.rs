// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for catalog-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `catalog_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `table`: TSD_TAGK, TSD_TAGV, TSD_METRIC, TSD_TSMETA, TSD_ANNOTATION
//! - `op`: I, U, D
//! - `cache`: uid_metric, uid_tagk, uid_tagv, tsmeta, tag_predicate
//! - `status`: success, failure, timeout

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

// =============================================================================
// Change capture
// =============================================================================

/// Record a change capture decision (queued, suppressed, noop)
pub fn record_trigger(table: &str, op: &str, outcome: &str) {
    counter!(
        "catalog_sync_trigger_fires_total",
        "table" => table.to_string(),
        "op" => op.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record time spent inside a trigger
pub fn record_trigger_latency(trigger: &str, duration: Duration) {
    histogram!(
        "catalog_sync_trigger_seconds",
        "trigger" => trigger.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record rows touched by a rename cascade
pub fn record_rename_cascade(uid_type: &str, tag_pairs: u64, tsmetas: u64) {
    counter!(
        "catalog_sync_rename_cascades_total",
        "uid_type" => uid_type.to_string()
    )
    .increment(1);
    counter!("catalog_sync_rename_tagpairs_total").increment(tag_pairs);
    counter!("catalog_sync_rename_tsmetas_total").increment(tsmetas);
}

// =============================================================================
// Sync processor
// =============================================================================

/// Record one propagation outcome
pub fn record_propagation(table: &str, status: &str) {
    counter!(
        "catalog_sync_propagations_total",
        "table" => table.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record propagation latency
pub fn record_propagation_latency(table: &str, duration: Duration) {
    histogram!(
        "catalog_sync_propagation_seconds",
        "table" => table.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Set current number of failure ledger rows
pub fn set_failure_ledger_size(count: usize) {
    gauge!("catalog_sync_failure_ledger_entries").set(count as f64);
}

/// Record a failure parked after exhausting attempts
pub fn record_failure_parked(table: &str) {
    counter!(
        "catalog_sync_failures_parked_total",
        "table" => table.to_string()
    )
    .increment(1);
}

/// Record a completed (or aborted) sync run
pub fn record_sync_run(status: &str, duration: Duration) {
    counter!(
        "catalog_sync_runs_total",
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("catalog_sync_run_seconds").record(duration.as_secs_f64());
}

/// Record a tick rejected by the single-flight guard
pub fn record_sync_run_rejected() {
    counter!("catalog_sync_runs_rejected_total").increment(1);
}

/// Set a table watermark (epoch millis)
pub fn set_watermark(table: &str, last_sync: i64) {
    gauge!(
        "catalog_sync_watermark_millis",
        "table" => table.to_string()
    )
    .set(last_sync as f64);
}

// =============================================================================
// Decode caches
// =============================================================================

/// Export a cache statistics snapshot
pub fn set_cache_stats(cache: &str, hits: u64, misses: u64, evictions: u64, size: usize) {
    gauge!("catalog_sync_cache_hits", "cache" => cache.to_string()).set(hits as f64);
    gauge!("catalog_sync_cache_misses", "cache" => cache.to_string()).set(misses as f64);
    gauge!("catalog_sync_cache_evictions", "cache" => cache.to_string()).set(evictions as f64);
    gauge!("catalog_sync_cache_entries", "cache" => cache.to_string()).set(size as f64);
}

/// Record a cache load from the catalog
pub fn record_cache_load(cache: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "catalog_sync_cache_loads_total",
        "cache" => cache.to_string(),
        "status" => status
    )
    .increment(1);
    histogram!(
        "catalog_sync_cache_load_seconds",
        "cache" => cache.to_string()
    )
    .record(duration.as_secs_f64());
}

// =============================================================================
// Sequences
// =============================================================================

/// Record a sequence range refresh
pub fn record_sequence_refresh(sequence: &str, duration: Duration) {
    counter!(
        "catalog_sync_sequence_refreshes_total",
        "sequence" => sequence.to_string()
    )
    .increment(1);
    histogram!(
        "catalog_sync_sequence_refresh_seconds",
        "sequence" => sequence.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Set the freshly published range of a sequence
pub fn set_sequence_range(sequence: &str, current: i64, ceiling: i64) {
    gauge!("catalog_sync_sequence_current", "sequence" => sequence.to_string()).set(current as f64);
    gauge!("catalog_sync_sequence_ceiling", "sequence" => sequence.to_string()).set(ceiling as f64);
}

// =============================================================================
// Backfill
// =============================================================================

/// Record backfill progress counters
pub fn set_metasync_progress(processed: u64, already_seen: u64, errors: u64) {
    gauge!("catalog_sync_metasync_processed").set(processed as f64);
    gauge!("catalog_sync_metasync_already_seen").set(already_seen as f64);
    gauge!("catalog_sync_metasync_errors").set(errors as f64);
}

/// Record a finished backfill run
pub fn record_metasync_run(success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("catalog_sync_metasync_runs_total", "status" => status).increment(1);
    histogram!("catalog_sync_metasync_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Engine
// =============================================================================

/// Record an error by component and type
pub fn record_error(component: &str, operation: &str, error_type: &str) {
    counter!(
        "catalog_sync_errors_total",
        "component" => component.to_string(),
        "operation" => operation.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(component: &str, operation: &str, duration: Duration) {
    histogram!(
        "catalog_sync_operation_seconds",
        "component" => component.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a startup phase duration
pub fn record_startup_phase(phase: &str, duration: Duration) {
    histogram!(
        "catalog_sync_startup_phase_seconds",
        "phase" => phase.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Set the engine lifecycle state as a labelled gauge
pub fn set_engine_state(state: &str) {
    for s in ["Created", "Connecting", "WarmingUp", "Ready", "Running", "ShuttingDown"] {
        let value = if s == state { 1.0 } else { 0.0 };
        gauge!("catalog_sync_engine_state", "state" => s).set(value);
    }
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    component: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(component: &'static str, operation: &'static str) -> Self {
        Self {
            component,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.component, self.operation, self.start.elapsed());
    }
}

/// Convenience macro for timing operations
#[macro_export]
macro_rules! time_operation {
    ($component:expr, $op:expr) => {
        $crate::metrics::LatencyTimer::new($component, $op)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    // These verify the API doesn't panic without an installed recorder.

    #[test]
    fn test_trigger_metrics() {
        record_trigger("TSD_TAGK", "I", "queued");
        record_trigger("TSD_TSMETA", "U", "suppressed");
        record_trigger_latency("sync_queue", Duration::from_micros(40));
        record_rename_cascade("TAGK", 3, 12);
    }

    #[test]
    fn test_processor_metrics() {
        record_propagation("TSD_METRIC", "success");
        record_propagation("TSD_METRIC", "timeout");
        record_propagation_latency("TSD_METRIC", Duration::from_millis(3));
        set_failure_ledger_size(4);
        record_failure_parked("TSD_ANNOTATION");
        record_sync_run("success", Duration::from_millis(120));
        record_sync_run_rejected();
        set_watermark("TSD_TAGV", 1_700_000_000_000);
    }

    #[test]
    fn test_cache_and_sequence_metrics() {
        set_cache_stats("tsmeta", 10, 2, 0, 8);
        record_cache_load("tag_predicate", false, Duration::from_millis(1));
        record_sequence_refresh("FQN_SEQ", Duration::from_micros(300));
        set_sequence_range("FQN_SEQ", 50, 100);
    }

    #[test]
    fn test_latency_timer() {
        {
            let _timer = LatencyTimer::new("catalog", "write");
            std::thread::sleep(Duration::from_micros(10));
        }
        // Timer recorded on drop
    }

    #[test]
    fn test_engine_state_tracking() {
        set_engine_state("Created");
        set_engine_state("WarmingUp");
        set_engine_state("Running");
        record_startup_phase("catalog_connect", Duration::from_millis(5));
        set_metasync_progress(10, 3, 0);
        record_metasync_run(true, Duration::from_secs(1));
        record_error("processor", "scan", "backend");
    }
}
