// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change capture for watched catalog tables.
//!
//! Runs inside the catalog write transaction, before the row is persisted:
//!
//! 1. Field-equal update -> [`Capture::Unchanged`], nothing is written.
//! 2. Write suppressed by [`WriteOptions`] -> [`Capture::Suppressed`].
//! 3. Otherwise bump `version` (catalog origin only), mirror it into the
//!    custom map, and return [`Capture::Queued`]; the caller then appends
//!    the [`SyncQueueEntry`] with [`ChangeCaptureTrigger::enqueue`] on the
//!    same transaction.
//!
//! Any error aborts the enclosing transaction.

use sqlx::AnyConnection;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use crate::metrics;
use crate::record::{CatalogRecord, CatalogTable, OpType};
use crate::storage::traits::StorageError;
use super::options::WriteOptions;

/// A pending propagation event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncQueueEntry {
    pub qid: i64,
    pub table: CatalogTable,
    /// Catalog primary key as text
    pub pk: String,
    /// Primary store key, kept so deletes can still be addressed
    pub object_key: String,
    pub op: OpType,
    pub event_time: i64,
}

/// Change capture decision for one row mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capture {
    /// Field-equal update, skip the write entirely
    Unchanged,
    /// Persist, but record nothing
    Suppressed,
    /// Persist and queue with this op
    Queued(OpType),
}

/// Trigger call statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerStats {
    pub calls: u64,
    pub queued: u64,
    pub suppressed: u64,
    pub unchanged: u64,
    pub rejected: u64,
    pub total_micros: u64,
}

impl TriggerStats {
    #[must_use]
    pub fn average_micros(&self) -> u64 {
        if self.calls == 0 { 0 } else { self.total_micros / self.calls }
    }
}

#[derive(Default)]
pub struct ChangeCaptureTrigger {
    calls: AtomicU64,
    queued: AtomicU64,
    suppressed: AtomicU64,
    unchanged: AtomicU64,
    rejected: AtomicU64,
    total_micros: AtomicU64,
}

impl ChangeCaptureTrigger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify a mutation of `table` and stamp the version on `new`.
    ///
    /// `old` is absent on insert, `new` is absent on delete.
    pub fn fire(
        &self,
        table: CatalogTable,
        old: Option<&CatalogRecord>,
        new: Option<&mut CatalogRecord>,
        opts: &WriteOptions,
    ) -> Result<Capture, StorageError> {
        let start = Instant::now();
        self.calls.fetch_add(1, Ordering::Relaxed);
        let result = self.classify(table, old, new, opts);
        let elapsed = start.elapsed();
        self.total_micros.fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        metrics::record_trigger_latency("sync_queue", elapsed);

        let (counter, outcome, op) = match &result {
            Ok(Capture::Queued(op)) => (&self.queued, "queued", op.code()),
            Ok(Capture::Suppressed) => (&self.suppressed, "suppressed", "-"),
            Ok(Capture::Unchanged) => (&self.unchanged, "unchanged", "U"),
            Err(_) => (&self.rejected, "rejected", "-"),
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::record_trigger(table.name(), op, outcome);
        result
    }

    fn classify(
        &self,
        table: CatalogTable,
        old: Option<&CatalogRecord>,
        new: Option<&mut CatalogRecord>,
        opts: &WriteOptions,
    ) -> Result<Capture, StorageError> {
        let op = match (old, new.is_some()) {
            (None, true) => OpType::Insert,
            (Some(_), true) => OpType::Update,
            (Some(_), false) => OpType::Delete,
            (None, false) => {
                return Err(StorageError::Trigger(format!(
                    "{}: neither old nor new row image",
                    table
                )))
            }
        };

        let Some(new) = new else {
            return Ok(if opts.suppresses_capture() {
                Capture::Suppressed
            } else {
                Capture::Queued(OpType::Delete)
            });
        };

        validate(table, new)?;

        if let Some(old) = old {
            if old.content_eq(new) {
                return Ok(Capture::Unchanged);
            }
        }

        let version = match (old, opts.bumps_version()) {
            (Some(old), true) => old.version() + 1,
            (Some(old), false) => old.version(),
            (None, true) => new.version().max(0) + 1,
            (None, false) => new.version().max(0),
        };
        new.set_version(version);

        if opts.suppresses_capture() {
            Ok(Capture::Suppressed)
        } else {
            Ok(Capture::Queued(op))
        }
    }

    /// Append a sync queue entry on the caller's transaction.
    pub async fn enqueue(
        &self,
        conn: &mut AnyConnection,
        entry: &SyncQueueEntry,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO SYNC_QUEUE (QID, EVENT_TYPE, EVENT, OBJECT_KEY, OP_TYPE, EVENT_TIME) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.qid)
        .bind(entry.table.name())
        .bind(&entry.pk)
        .bind(&entry.object_key)
        .bind(entry.op.code())
        .bind(entry.event_time)
        .execute(&mut *conn)
        .await
        .map_err(|e| StorageError::Trigger(format!("enqueue {} {}: {}", entry.table, entry.pk, e)))?;
        Ok(())
    }

    #[must_use]
    pub fn stats(&self) -> TriggerStats {
        TriggerStats {
            calls: self.calls.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            total_micros: self.total_micros.load(Ordering::Relaxed),
        }
    }
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.len() % 2 == 0 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Reject rows that cannot be captured.
fn validate(table: CatalogTable, record: &CatalogRecord) -> Result<(), StorageError> {
    if record.table() != table {
        return Err(StorageError::Trigger(format!(
            "{} row fired on {}",
            record.table(),
            table
        )));
    }
    match record {
        CatalogRecord::Uid(u) => {
            if !is_hex(&u.uid) {
                return Err(StorageError::Trigger(format!("{}: malformed uid '{}'", table, u.uid)));
            }
            if u.name.is_empty() {
                return Err(StorageError::Trigger(format!("{}: uid {} has no name", table, u.uid)));
            }
        }
        CatalogRecord::TsMeta(t) => {
            if !is_hex(&t.tsuid) {
                return Err(StorageError::Trigger(format!("{}: malformed tsuid '{}'", table, t.tsuid)));
            }
            if t.tags.is_empty() || t.tags.len() % 2 != 0 {
                return Err(StorageError::Trigger(format!(
                    "{}: tsuid {} has {} tag uids, expected non-empty pairs",
                    table,
                    t.tsuid,
                    t.tags.len()
                )));
            }
        }
        CatalogRecord::Annotation(a) => {
            if a.start_time <= 0 {
                return Err(StorageError::Trigger(format!(
                    "{}: annotation start time {} must be positive",
                    table, a.start_time
                )));
            }
            if let Some(tsuid) = &a.tsuid {
                if !is_hex(tsuid) {
                    return Err(StorageError::Trigger(format!("{}: malformed tsuid '{}'", table, tsuid)));
                }
            }
        }
    }
    Ok(())
}
