// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable sync bookkeeping: per-table watermarks, the sync queue and the
//! failure ledger.
//!
//! Every call is one short statement on a pooled connection; nothing holds
//! a connection across a sync run.

use sqlx::{AnyPool, Row};
use tracing::debug;
use crate::capture::SyncQueueEntry;
use crate::metrics;
use crate::record::{CatalogTable, OpType};
use crate::storage::sql::{backend, text};
use crate::storage::traits::StorageError;

/// Progress of one watched table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watermark {
    pub table: CatalogTable,
    pub ordering: i64,
    /// Rows with `LAST_UPDATE` at or below this have been attempted
    pub last_sync: i64,
}

/// A propagation that failed and awaits retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub table: CatalogTable,
    /// Catalog primary key
    pub object_id: String,
    /// Primary store key
    pub object_key: String,
    pub op: OpType,
    pub attempts: i64,
    pub last_attempt: i64,
    pub last_error: Option<String>,
}

pub struct SyncLedger {
    pool: AnyPool,
    is_sqlite: bool,
}

fn table_of(row: &sqlx::any::AnyRow, column: &str) -> Result<CatalogTable, StorageError> {
    let name = text(row, column).unwrap_or_default();
    CatalogTable::from_name(&name)
        .ok_or_else(|| StorageError::InvalidRecord(format!("unknown table '{}' in sync ledger", name)))
}

fn op_of(row: &sqlx::any::AnyRow, column: &str) -> Result<OpType, StorageError> {
    let code = text(row, column).unwrap_or_default();
    OpType::from_code(&code)
        .ok_or_else(|| StorageError::InvalidRecord(format!("unknown op type '{}' in sync ledger", code)))
}

impl SyncLedger {
    #[must_use]
    pub fn new(pool: AnyPool, is_sqlite: bool) -> Self {
        Self { pool, is_sqlite }
    }

    /// Insert a zero watermark for every watched table that has none.
    pub async fn init_watermarks(&self) -> Result<(), StorageError> {
        let sql = if self.is_sqlite {
            "INSERT OR IGNORE INTO TSD_LASTSYNC (TABLE_NAME, ORDERING, LAST_SYNC) VALUES (?, ?, 0)"
        } else {
            "INSERT IGNORE INTO TSD_LASTSYNC (TABLE_NAME, ORDERING, LAST_SYNC) VALUES (?, ?, 0)"
        };
        for table in CatalogTable::WATCHED {
            sqlx::query(sql)
                .bind(table.name())
                .bind(table.ordering())
                .execute(&self.pool)
                .await
                .map_err(backend)?;
        }
        Ok(())
    }

    /// All watermarks in processing order.
    pub async fn watermarks(&self) -> Result<Vec<Watermark>, StorageError> {
        let rows = sqlx::query("SELECT TABLE_NAME, ORDERING, LAST_SYNC FROM TSD_LASTSYNC ORDER BY ORDERING")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter()
            .map(|r| {
                Ok(Watermark {
                    table: table_of(r, "TABLE_NAME")?,
                    ordering: r.try_get("ORDERING").map_err(backend)?,
                    last_sync: r.try_get("LAST_SYNC").map_err(backend)?,
                })
            })
            .collect()
    }

    pub async fn watermark(&self, table: CatalogTable) -> Result<i64, StorageError> {
        let row = sqlx::query("SELECT LAST_SYNC FROM TSD_LASTSYNC WHERE TABLE_NAME = ?")
            .bind(table.name())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        match row {
            Some(r) => r.try_get("LAST_SYNC").map_err(backend),
            None => Ok(0),
        }
    }

    /// Move the watermark forward to `to`. Never moves it back.
    pub async fn advance_watermark(&self, table: CatalogTable, to: i64) -> Result<(), StorageError> {
        sqlx::query("UPDATE TSD_LASTSYNC SET LAST_SYNC = ? WHERE TABLE_NAME = ? AND LAST_SYNC < ?")
            .bind(to)
            .bind(table.name())
            .bind(to)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        metrics::set_watermark(table.name(), to);
        Ok(())
    }

    // ─── queue ─────────────────────────────────────────────────────────────

    /// Queued events for `table`, oldest first.
    pub async fn pending(&self, table: CatalogTable) -> Result<Vec<SyncQueueEntry>, StorageError> {
        let rows = sqlx::query(
            "SELECT QID, EVENT, OBJECT_KEY, OP_TYPE, EVENT_TIME FROM SYNC_QUEUE WHERE EVENT_TYPE = ? ORDER BY QID",
        )
        .bind(table.name())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter()
            .map(|r| {
                Ok(SyncQueueEntry {
                    qid: r.try_get("QID").map_err(backend)?,
                    table,
                    pk: text(r, "EVENT").unwrap_or_default(),
                    object_key: text(r, "OBJECT_KEY").unwrap_or_default(),
                    op: op_of(r, "OP_TYPE")?,
                    event_time: r.try_get("EVENT_TIME").map_err(backend)?,
                })
            })
            .collect()
    }

    pub async fn queue_depth(&self) -> Result<i64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS CNT FROM SYNC_QUEUE")
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        row.try_get("CNT").map_err(backend)
    }

    /// Delete settled queue entries.
    pub async fn consume(&self, qids: &[i64]) -> Result<u64, StorageError> {
        let mut removed = 0;
        for chunk in qids.chunks(500) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!("DELETE FROM SYNC_QUEUE WHERE QID IN ({})", placeholders);
            let mut query = sqlx::query(&sql);
            for qid in chunk {
                query = query.bind(*qid);
            }
            removed += query.execute(&self.pool).await.map_err(backend)?.rows_affected();
        }
        Ok(removed)
    }

    // ─── failures ──────────────────────────────────────────────────────────

    /// Every failure, most recent attempt first.
    pub async fn failures(&self) -> Result<Vec<FailureRecord>, StorageError> {
        let rows = sqlx::query(
            "SELECT TABLE_NAME, OBJECT_ID, OBJECT_KEY, OP_TYPE, ATTEMPTS, LAST_ATTEMPT, LAST_ERROR \
             FROM TSD_LASTSYNC_FAILS ORDER BY LAST_ATTEMPT DESC, TABLE_NAME, OBJECT_ID",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        let failures: Vec<FailureRecord> = rows
            .iter()
            .map(|r| {
                Ok(FailureRecord {
                    table: table_of(r, "TABLE_NAME")?,
                    object_id: text(r, "OBJECT_ID").unwrap_or_default(),
                    object_key: text(r, "OBJECT_KEY").unwrap_or_default(),
                    op: op_of(r, "OP_TYPE")?,
                    attempts: r.try_get("ATTEMPTS").map_err(backend)?,
                    last_attempt: r.try_get("LAST_ATTEMPT").map_err(backend)?,
                    last_error: text(r, "LAST_ERROR"),
                })
            })
            .collect::<Result<_, StorageError>>()?;
        metrics::set_failure_ledger_size(failures.len());
        Ok(failures)
    }

    pub async fn failure(&self, table: CatalogTable, object_id: &str) -> Result<Option<FailureRecord>, StorageError> {
        Ok(self
            .failures()
            .await?
            .into_iter()
            .find(|f| f.table == table && f.object_id == object_id))
    }

    /// Record a failed attempt: insert with one attempt, or bump the count.
    /// Returns the attempt count now on record.
    pub async fn record_failure(
        &self,
        table: CatalogTable,
        object_id: &str,
        object_key: &str,
        op: OpType,
        error: &str,
        now: i64,
    ) -> Result<i64, StorageError> {
        let sql = if self.is_sqlite {
            "INSERT INTO TSD_LASTSYNC_FAILS (TABLE_NAME, OBJECT_ID, OBJECT_KEY, OP_TYPE, ATTEMPTS, LAST_ATTEMPT, LAST_ERROR) \
             VALUES (?, ?, ?, ?, 1, ?, ?) \
             ON CONFLICT(TABLE_NAME, OBJECT_ID) DO UPDATE SET \
                ATTEMPTS = ATTEMPTS + 1, \
                OBJECT_KEY = excluded.OBJECT_KEY, \
                OP_TYPE = excluded.OP_TYPE, \
                LAST_ATTEMPT = excluded.LAST_ATTEMPT, \
                LAST_ERROR = excluded.LAST_ERROR"
        } else {
            "INSERT INTO TSD_LASTSYNC_FAILS (TABLE_NAME, OBJECT_ID, OBJECT_KEY, OP_TYPE, ATTEMPTS, LAST_ATTEMPT, LAST_ERROR) \
             VALUES (?, ?, ?, ?, 1, ?, ?) \
             ON DUPLICATE KEY UPDATE \
                ATTEMPTS = ATTEMPTS + 1, \
                OBJECT_KEY = VALUES(OBJECT_KEY), \
                OP_TYPE = VALUES(OP_TYPE), \
                LAST_ATTEMPT = VALUES(LAST_ATTEMPT), \
                LAST_ERROR = VALUES(LAST_ERROR)"
        };
        sqlx::query(sql)
            .bind(table.name())
            .bind(object_id)
            .bind(object_key)
            .bind(op.code())
            .bind(now)
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        let row = sqlx::query("SELECT ATTEMPTS FROM TSD_LASTSYNC_FAILS WHERE TABLE_NAME = ? AND OBJECT_ID = ?")
            .bind(table.name())
            .bind(object_id)
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        let attempts: i64 = row.try_get("ATTEMPTS").map_err(backend)?;
        debug!(table = %table, object_id, attempts, error, "Propagation failure recorded");
        Ok(attempts)
    }

    /// Drop the failure record after a successful propagation.
    pub async fn clear_failure(&self, table: CatalogTable, object_id: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM TSD_LASTSYNC_FAILS WHERE TABLE_NAME = ? AND OBJECT_ID = ?")
            .bind(table.name())
            .bind(object_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sql::testing::temp_store;

    #[tokio::test]
    async fn test_watermarks_start_at_zero_in_table_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(dir.path()).await;
        let ledger = SyncLedger::new(store.pool(), true);
        ledger.init_watermarks().await.unwrap();
        ledger.init_watermarks().await.unwrap();

        let marks = ledger.watermarks().await.unwrap();
        let tables: Vec<_> = marks.iter().map(|w| w.table).collect();
        assert_eq!(tables, CatalogTable::WATCHED.to_vec());
        assert!(marks.iter().all(|w| w.last_sync == 0));
    }

    #[tokio::test]
    async fn test_watermark_only_moves_forward() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(dir.path()).await;
        let ledger = SyncLedger::new(store.pool(), true);
        ledger.init_watermarks().await.unwrap();

        ledger.advance_watermark(CatalogTable::Tagv, 500).await.unwrap();
        ledger.advance_watermark(CatalogTable::Tagv, 200).await.unwrap();
        assert_eq!(ledger.watermark(CatalogTable::Tagv).await.unwrap(), 500);
        assert_eq!(ledger.watermark(CatalogTable::Tagk).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failure_attempts_accumulate_then_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(dir.path()).await;
        let ledger = SyncLedger::new(store.pool(), true);

        for expected in 1..=3 {
            let attempts = ledger
                .record_failure(CatalogTable::Tagk, "000001", "000001", OpType::Insert, "down", expected * 10)
                .await
                .unwrap();
            assert_eq!(attempts, expected);
        }
        let record = ledger.failure(CatalogTable::Tagk, "000001").await.unwrap().unwrap();
        assert_eq!(record.attempts, 3);
        assert_eq!(record.last_attempt, 30);
        assert_eq!(record.last_error.as_deref(), Some("down"));

        assert!(ledger.clear_failure(CatalogTable::Tagk, "000001").await.unwrap());
        assert!(!ledger.clear_failure(CatalogTable::Tagk, "000001").await.unwrap());
        assert!(ledger.failures().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failures_most_recent_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(dir.path()).await;
        let ledger = SyncLedger::new(store.pool(), true);

        ledger.record_failure(CatalogTable::Tagk, "A", "A", OpType::Insert, "x", 100).await.unwrap();
        ledger.record_failure(CatalogTable::Metric, "B", "B", OpType::Delete, "y", 300).await.unwrap();
        ledger.record_failure(CatalogTable::Tagv, "C", "C", OpType::Update, "z", 200).await.unwrap();

        let ids: Vec<_> = ledger.failures().await.unwrap().into_iter().map(|f| f.object_id).collect();
        assert_eq!(ids, vec!["B", "C", "A"]);
    }

    #[tokio::test]
    async fn test_pending_and_consume() {
        use crate::capture::WriteOptions;
        use crate::record::{CatalogRecord, UidMeta, UidType};

        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(dir.path()).await;
        let ledger = SyncLedger::new(store.pool(), true);
        for (uid, name) in [("000001", "host"), ("000002", "dc")] {
            store
                .write(CatalogRecord::Uid(UidMeta::new(UidType::Tagk, uid, name)), WriteOptions::catalog())
                .await
                .unwrap();
        }
        store
            .write(CatalogRecord::Uid(UidMeta::new(UidType::Tagv, "000001", "web01")), WriteOptions::catalog())
            .await
            .unwrap();

        let pending = ledger.pending(CatalogTable::Tagk).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending[0].qid < pending[1].qid);
        assert_eq!(pending[0].op, OpType::Insert);

        let qids: Vec<i64> = pending.iter().map(|e| e.qid).collect();
        assert_eq!(ledger.consume(&qids).await.unwrap(), 2);
        assert_eq!(ledger.queue_depth().await.unwrap(), 1);
    }
}
