// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Scheduled propagation of catalog changes to the primary store.
//!
//! # Run
//!
//! ```text
//!              ┌─► retry phase:    failures (latest first) ─► propagate ─┐
//! run_once ────┤                                                          ├─► report
//!              └─► new-work phase: per table, in order:                   │
//!                    queue snapshot ─► scan LAST_UPDATE > watermark ──────┘
//!                    ─► propagate batch ─► settle ledger ─► consume queue
//!                    ─► advance watermark
//! ```
//!
//! Each row belongs to one phase per run. Rows in the failure ledger are
//! re-read and sent by the retry phase; the new-work phase only notes that it
//! saw them. After both phases join, a noted row whose retry succeeded is
//! read once more and re-sent if it changed in the meantime, so a newer
//! state always lands after an older one.
//!
//! A watermark only moves after every row of its batch has either succeeded
//! or been durably recorded as a failure. A scan or ledger error aborts the
//! rest of the run with watermarks untouched; the next tick starts over from
//! the same point. Propagation is an idempotent upsert, so re-sending rows
//! after an abort is harmless.
//!
//! Failed propagations are never retried within the tick that saw them. The
//! next tick's retry phase picks them up, so the tick period is the backoff.

use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use crate::cache::UidCache;
use crate::capture::SyncQueueEntry;
use crate::config::CatalogSyncConfig;
use crate::metrics;
use crate::record::{now_millis, CatalogRecord, CatalogTable, OpType, Propagation};
use crate::storage::sql::CatalogStore;
use crate::storage::traits::{PrimaryStore, StorageError};
use super::ledger::{FailureRecord, SyncLedger};

/// In-flight propagations per batch.
const PROPAGATE_CONCURRENCY: usize = 64;

/// Outcome of one table's new-work batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableReport {
    pub table: Option<CatalogTable>,
    /// Rows found by the watermark scan
    pub scanned: usize,
    /// Queue entries consumed
    pub queued: usize,
    pub propagated: usize,
    pub failed: usize,
    pub deletes: usize,
    /// Rows with a pending retry, left to the retry phase
    pub deferred: usize,
    /// Watermark after the batch
    pub watermark: i64,
}

/// Outcome of the retry phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Rows that changed again while their retry was in flight, sent after it
    pub resent: usize,
    /// Failures at the attempt limit, left in the ledger
    pub parked: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncRunReport {
    pub run: u64,
    pub started_at: i64,
    pub elapsed: Duration,
    pub retry: RetryReport,
    pub tables: Vec<TableReport>,
    /// Error that stopped the run early
    pub aborted: Option<String>,
}

impl SyncRunReport {
    #[must_use]
    pub fn propagated(&self) -> usize {
        self.retry.succeeded + self.tables.iter().map(|t| t.propagated).sum::<usize>()
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.retry.failed + self.tables.iter().map(|t| t.failed).sum::<usize>()
    }
}

type RowId = (CatalogTable, String);

/// A retried row as it was read and sent; `None` when a delete was sent.
struct Retried {
    key: String,
    sent: Option<CatalogRecord>,
}

/// One change to push, with the keys the ledger needs.
struct Pending {
    table: CatalogTable,
    pk: String,
    key: String,
    op: OpType,
    change: Propagation,
}

struct Schedule {
    cancel: watch::Sender<bool>,
    _handle: JoinHandle<()>,
    period: Duration,
}

/// Clears the running flag however the run ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncQueueProcessor {
    store: Arc<CatalogStore>,
    ledger: SyncLedger,
    primary: Arc<dyn PrimaryStore>,
    uids: Arc<UidCache>,
    propagate_timeout: Duration,
    max_attempts: Option<u32>,
    running: AtomicBool,
    runs: AtomicU64,
    last_report: parking_lot::Mutex<Option<SyncRunReport>>,
    ticker: parking_lot::Mutex<Option<Schedule>>,
}

impl SyncQueueProcessor {
    pub fn new(
        store: Arc<CatalogStore>,
        primary: Arc<dyn PrimaryStore>,
        uids: Arc<UidCache>,
        config: &CatalogSyncConfig,
    ) -> Self {
        Self {
            ledger: SyncLedger::new(store.pool(), store.is_sqlite()),
            store,
            primary,
            uids,
            propagate_timeout: config.propagate_timeout(),
            max_attempts: config.max_sync_attempts,
            running: AtomicBool::new(false),
            runs: AtomicU64::new(0),
            last_report: parking_lot::Mutex::new(None),
            ticker: parking_lot::Mutex::new(None),
        }
    }

    /// Create missing watermark rows.
    pub async fn init(&self) -> Result<(), StorageError> {
        self.ledger.init_watermarks().await
    }

    #[must_use]
    pub fn ledger(&self) -> &SyncLedger {
        &self.ledger
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn last_report(&self) -> Option<SyncRunReport> {
        self.last_report.lock().clone()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Run
    // ═══════════════════════════════════════════════════════════════════════

    /// Run both phases once. Returns `None` when a run is already in progress.
    #[tracing::instrument(skip(self))]
    pub async fn run_once(&self) -> Option<SyncRunReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Sync run already in progress, tick rejected");
            metrics::record_sync_run_rejected();
            return None;
        }
        let _guard = RunGuard(&self.running);

        let start = Instant::now();
        let mut report = SyncRunReport {
            run: self.runs.fetch_add(1, Ordering::Relaxed) + 1,
            started_at: now_millis(),
            ..SyncRunReport::default()
        };

        match self.ledger.failures().await {
            Ok(failures) => {
                let (parked, active): (Vec<FailureRecord>, Vec<FailureRecord>) =
                    failures.into_iter().partition(|f| {
                        self.max_attempts.is_some_and(|max| f.attempts >= i64::from(max))
                    });
                for failure in &parked {
                    metrics::record_failure_parked(failure.table.name());
                }
                let parked: HashSet<RowId> = parked.into_iter().map(|f| (f.table, f.object_id)).collect();
                // The retry phase owns these rows for the whole run
                let owned: HashSet<RowId> = active.iter().map(|f| (f.table, f.object_id.clone())).collect();

                let mut deferred = HashSet::new();
                let (retry, fresh) = tokio::join!(
                    self.retry_phase(active),
                    self.new_work_phase(&owned, &parked, &mut report.tables, &mut deferred)
                );
                match retry {
                    Ok((mut retry, succeeded)) => {
                        retry.parked = parked.len();
                        if let Err(e) = self.settle_retried(succeeded, &deferred, &mut retry).await {
                            report.aborted = Some(format!("retry settle: {}", e));
                        }
                        report.retry = retry;
                    }
                    Err(e) => report.aborted = Some(format!("retry phase: {}", e)),
                }
                if let Err(e) = fresh {
                    report.aborted = Some(format!("new-work phase: {}", e));
                }
            }
            Err(e) => report.aborted = Some(format!("failure ledger: {}", e)),
        }

        report.elapsed = start.elapsed();
        match &report.aborted {
            Some(reason) => {
                error!(run = report.run, reason = %reason, "Sync run aborted");
                metrics::record_sync_run("aborted", report.elapsed);
            }
            None => {
                if report.propagated() + report.failed() > 0 {
                    info!(
                        run = report.run,
                        propagated = report.propagated(),
                        failed = report.failed(),
                        retried = report.retry.attempted,
                        elapsed_ms = report.elapsed.as_millis() as u64,
                        "Sync run complete"
                    );
                } else {
                    debug!(run = report.run, "Sync run found nothing to do");
                }
                metrics::record_sync_run("success", report.elapsed);
            }
        }
        if let Ok(failures) = self.ledger.failures().await {
            metrics::set_failure_ledger_size(failures.len());
        }

        *self.last_report.lock() = Some(report.clone());
        Some(report)
    }

    /// Re-send every failed row as it stands now. Successes are returned
    /// uncleared; `settle_retried` clears them once the new-work phase is done.
    async fn retry_phase(
        &self,
        failures: Vec<FailureRecord>,
    ) -> Result<(RetryReport, HashMap<RowId, Retried>), StorageError> {
        let mut report = RetryReport::default();
        let mut batch = Vec::with_capacity(failures.len());
        let mut sent: HashMap<RowId, Option<CatalogRecord>> = HashMap::with_capacity(failures.len());

        for failure in failures {
            // Current state wins over the op that failed
            let current = self.store.read_by_pk(failure.table, &failure.object_id).await?;
            sent.insert((failure.table, failure.object_id.clone()), current.clone());
            batch.push(
                self.current_change(failure.table, failure.object_id, failure.object_key, current)
                    .await,
            );
        }

        report.attempted = batch.len();
        let mut succeeded = HashMap::with_capacity(batch.len());
        for (item, result) in self.propagate_all(batch).await {
            let id = (item.table, item.pk.clone());
            match result {
                Ok(()) => {
                    report.succeeded += 1;
                    if let Some(row) = sent.remove(&id) {
                        succeeded.insert(id, Retried { key: item.key, sent: row });
                    }
                }
                Err(e) => {
                    let attempts = self
                        .ledger
                        .record_failure(item.table, &item.pk, &item.key, item.op, &e.to_string(), now_millis())
                        .await?;
                    warn!(table = %item.table, pk = %item.pk, attempts, error = %e, "Retry propagation failed");
                    report.failed += 1;
                }
            }
        }
        Ok((report, succeeded))
    }

    /// Clear retried rows, re-sending those the new-work phase saw change
    /// while the retry was in flight.
    async fn settle_retried(
        &self,
        succeeded: HashMap<RowId, Retried>,
        deferred: &HashSet<RowId>,
        report: &mut RetryReport,
    ) -> Result<(), StorageError> {
        let mut resend = Vec::new();
        for ((table, pk), retried) in succeeded {
            if deferred.contains(&(table, pk.clone())) {
                let current = self.store.read_by_pk(table, &pk).await?;
                if current != retried.sent {
                    resend.push(self.current_change(table, pk, retried.key, current).await);
                    continue;
                }
            }
            self.ledger.clear_failure(table, &pk).await?;
        }

        report.resent = resend.len();
        for (item, result) in self.propagate_all(resend).await {
            match result {
                Ok(()) => {
                    self.ledger.clear_failure(item.table, &item.pk).await?;
                }
                Err(e) => {
                    let attempts = self
                        .ledger
                        .record_failure(item.table, &item.pk, &item.key, item.op, &e.to_string(), now_millis())
                        .await?;
                    warn!(table = %item.table, pk = %item.pk, attempts, error = %e, "Re-send after retry failed");
                    report.failed += 1;
                }
            }
        }
        Ok(())
    }

    /// Upsert of the row as read, or a delete of `key` when it is gone.
    async fn current_change(
        &self,
        table: CatalogTable,
        pk: String,
        key: String,
        current: Option<CatalogRecord>,
    ) -> Pending {
        match current {
            Some(record) => Pending {
                table,
                pk,
                key: record.natural_key(),
                op: OpType::Update,
                change: Propagation::Upsert(self.hydrate(record).await),
            },
            None => Pending {
                table,
                pk,
                key: key.clone(),
                op: OpType::Delete,
                change: Propagation::Delete { table, key },
            },
        }
    }

    async fn new_work_phase(
        &self,
        owned: &HashSet<RowId>,
        parked: &HashSet<RowId>,
        reports: &mut Vec<TableReport>,
        deferred: &mut HashSet<RowId>,
    ) -> Result<(), StorageError> {
        for table in CatalogTable::WATCHED {
            let report = self.process_table(table, owned, parked, deferred).await?;
            reports.push(report);
        }
        Ok(())
    }

    async fn process_table(
        &self,
        table: CatalogTable,
        owned: &HashSet<RowId>,
        parked: &HashSet<RowId>,
        deferred: &mut HashSet<RowId>,
    ) -> Result<TableReport, StorageError> {
        let watermark = self.ledger.watermark(table).await?;
        // Queue snapshot first: anything queued after it stays for next tick
        let queued = self.ledger.pending(table).await?;
        let scan_start = now_millis();
        let rows = self.store.scan_changed(table, watermark).await?;

        let mut report = TableReport {
            table: Some(table),
            scanned: rows.len(),
            queued: queued.len(),
            watermark,
            ..TableReport::default()
        };

        let mut seen: HashSet<String> = HashSet::with_capacity(rows.len());
        let mut batch = Vec::with_capacity(rows.len() + queued.len());
        for record in rows {
            let Some(pk) = record.pk() else { continue };
            seen.insert(pk.clone());
            if owned.contains(&(table, pk.clone())) {
                if deferred.insert((table, pk)) {
                    report.deferred += 1;
                }
                continue;
            }
            let key = record.natural_key();
            batch.push(Pending {
                table,
                pk,
                key,
                op: OpType::Update,
                change: Propagation::Upsert(self.hydrate(record).await),
            });
        }

        // Latest captured op per row the scan did not already cover
        let mut latest: Vec<&SyncQueueEntry> = Vec::new();
        let mut slot: HashMap<&str, usize> = HashMap::new();
        for entry in &queued {
            if seen.contains(&entry.pk) {
                continue;
            }
            if owned.contains(&(table, entry.pk.clone())) {
                if deferred.insert((table, entry.pk.clone())) {
                    report.deferred += 1;
                }
                continue;
            }
            match slot.get(entry.pk.as_str()) {
                Some(&i) => latest[i] = entry,
                None => {
                    slot.insert(entry.pk.as_str(), latest.len());
                    latest.push(entry);
                }
            }
        }

        for entry in latest {
            match entry.op {
                OpType::Delete => {
                    report.deletes += 1;
                    batch.push(Pending {
                        table,
                        pk: entry.pk.clone(),
                        key: entry.object_key.clone(),
                        op: OpType::Delete,
                        change: Propagation::Delete {
                            table,
                            key: entry.object_key.clone(),
                        },
                    });
                }
                OpType::Insert | OpType::Update => {
                    // Committed after an earlier scan passed it by
                    if let Some(record) = self.store.read_by_pk(table, &entry.pk).await? {
                        batch.push(Pending {
                            table,
                            pk: entry.pk.clone(),
                            key: record.natural_key(),
                            op: entry.op,
                            change: Propagation::Upsert(self.hydrate(record).await),
                        });
                    }
                }
            }
        }

        // A delete and a re-insert under the same key must land in that order
        let (deletes, upserts): (Vec<Pending>, Vec<Pending>) =
            batch.into_iter().partition(|p| p.op == OpType::Delete);
        for group in [deletes, upserts] {
            for (item, result) in self.propagate_all(group).await {
                match result {
                    Ok(()) => {
                        report.propagated += 1;
                        if parked.contains(&(item.table, item.pk.clone())) {
                            self.ledger.clear_failure(item.table, &item.pk).await?;
                        }
                    }
                    Err(e) => {
                        report.failed += 1;
                        let attempts = self
                            .ledger
                            .record_failure(item.table, &item.pk, &item.key, item.op, &e.to_string(), now_millis())
                            .await?;
                        warn!(table = %table, pk = %item.pk, attempts, error = %e, "Propagation failed");
                    }
                }
            }
        }

        let qids: Vec<i64> = queued.iter().map(|e| e.qid).collect();
        self.ledger.consume(&qids).await?;
        self.ledger.advance_watermark(table, scan_start).await?;
        report.watermark = report.watermark.max(scan_start);

        if report.propagated + report.failed > 0 {
            debug!(
                table = %table,
                scanned = report.scanned,
                queued = report.queued,
                propagated = report.propagated,
                failed = report.failed,
                "Table batch settled"
            );
        }
        Ok(report)
    }

    /// Resolve uid references of time-series metadata through the UID cache.
    async fn hydrate(&self, record: CatalogRecord) -> CatalogRecord {
        match record {
            CatalogRecord::TsMeta(meta) => CatalogRecord::TsMeta(self.uids.hydrate(meta).await),
            other => other,
        }
    }

    /// Propagate a batch concurrently and wait for all of it to settle.
    async fn propagate_all(&self, batch: Vec<Pending>) -> Vec<(Pending, Result<(), StorageError>)> {
        let primary = &self.primary;
        let timeout = self.propagate_timeout;
        stream::iter(batch)
            .map(|item| async move {
                let start = Instant::now();
                let result = match tokio::time::timeout(timeout, primary.propagate(&item.change)).await {
                    Ok(r) => r,
                    Err(_) => Err(StorageError::Timeout(format!(
                        "propagate {} {} after {:?}",
                        item.table, item.key, timeout
                    ))),
                };
                let status = match &result {
                    Ok(()) => "success",
                    Err(StorageError::Timeout(_)) => "timeout",
                    Err(_) => "error",
                };
                metrics::record_propagation(item.table.name(), status);
                metrics::record_propagation_latency(item.table.name(), start.elapsed());
                (item, result)
            })
            .buffered(PROPAGATE_CONCURRENCY)
            .collect()
            .await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Schedule
    // ═══════════════════════════════════════════════════════════════════════

    /// Run on a fixed delay: first after `initial_delay`, then `period` after
    /// each run completes. A period of one second or less leaves it unscheduled.
    pub fn schedule(self: &Arc<Self>, initial_delay: Duration, period: Duration) -> bool {
        self.unschedule();
        if period <= Duration::from_secs(1) {
            info!(period_secs = period.as_secs(), "Sync processor scheduling disabled");
            return false;
        }

        let (cancel, mut cancelled) = watch::channel(false);
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(initial_delay) => {}
                _ = cancelled.changed() => return,
            }
            loop {
                let Some(processor) = weak.upgrade() else { break };
                // An in-flight run is never interrupted
                processor.run_once().await;
                drop(processor);
                tokio::select! {
                    _ = tokio::time::sleep(period) => {}
                    _ = cancelled.changed() => break,
                }
            }
            debug!("Sync schedule stopped");
        });

        *self.ticker.lock() = Some(Schedule {
            cancel,
            _handle: handle,
            period,
        });
        info!(
            initial_delay_ms = initial_delay.as_millis() as u64,
            period_secs = period.as_secs(),
            "Sync processor scheduled"
        );
        true
    }

    /// Change the tick period. The next tick comes one new period from now.
    pub fn set_sync_period(self: &Arc<Self>, period_secs: u64) -> bool {
        let period = Duration::from_secs(period_secs);
        self.schedule(period, period)
    }

    /// Cancel the schedule. A run in progress completes.
    pub fn unschedule(&self) {
        if let Some(schedule) = self.ticker.lock().take() {
            let _ = schedule.cancel.send(true);
        }
    }

    #[must_use]
    pub fn scheduled_period(&self) -> Option<Duration> {
        self.ticker.lock().as_ref().map(|s| s.period)
    }
}

impl Drop for SyncQueueProcessor {
    fn drop(&mut self) {
        self.unschedule();
    }
}
