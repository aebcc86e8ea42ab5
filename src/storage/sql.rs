// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Relational catalog on SQLite or MySQL.
//!
//! [`CatalogStore`] owns the catalog schema and its only write path. Every
//! write runs in one transaction:
//!
//! ```text
//! read old row ─► ChangeCaptureTrigger ─► LastUpdateStamp ─► persist
//!                     │                                        │
//!                     └── Queued(op) ─► SYNC_QUEUE insert ◄────┘
//!                                              │
//!                    UID name changed ─► RenameCascade ─► commit
//! ```
//!
//! A trigger error rolls the whole transaction back, so a change is never
//! committed without its queue entry.
//!
//! ## sqlx Any Driver Quirks
//!
//! MySQL `TEXT` columns come back as BLOB through the `Any` driver, so text
//! is read as `String` first and then as UTF-8 bytes (see [`text`]). `CUSTOM`
//! maps are stored as JSON text for the same reason.

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyConnection, AnyPool, Row};
use std::sync::{Arc, Once};
use std::time::Duration;
use tracing::{debug, info};
use crate::cache::predicate::TagPredicateSet;
use crate::capture::{
    CascadeReport, Capture, ChangeCaptureTrigger, LastUpdateStamp, RenameCascade, SyncQueueEntry,
    TriggerStats, UidRename, WriteOptions,
};
use crate::metrics::LatencyTimer;
use crate::record::{
    fqn, now_millis, tag_pair_name, tag_pair_uid, Annotation, CatalogRecord,
    CatalogTable, CustomMap, OpType, TsMeta, UidMeta, UidType,
};
use crate::resilience::retry::{retry, retry_transient, RetryConfig};
use crate::sequence::{
    CounterTableSequence, NativeSequence, SequenceAllocator, SequenceSource, SequenceStats,
    ANN_SEQ, FQN_SEQ, FQN_TP_SEQ, QID_SEQ,
};
use super::traits::{CatalogLookup, StorageError};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

pub(crate) fn backend(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// Text column as `String` (SQLite) or UTF-8 bytes (MySQL). `None` for NULL.
pub(crate) fn text(row: &AnyRow, column: &str) -> Option<String> {
    row.try_get::<String, _>(column).ok().or_else(|| {
        row.try_get::<Vec<u8>, _>(column)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    })
}

#[must_use]
pub fn is_sqlite_url(url: &str) -> bool {
    url.starts_with("sqlite:")
}

/// Open a pool with startup retry. SQLite pools are switched to WAL.
pub async fn connect_pool(url: &str, max_connections: u32) -> Result<AnyPool, StorageError> {
    install_drivers();

    let pool = retry("sql_connect", &RetryConfig::startup(), || async {
        AnyPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(300))
            .connect(url)
            .await
            .map_err(backend)
    })
    .await?;

    if is_sqlite_url(url) {
        // Readers don't block the single writer
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;
    }
    Ok(pool)
}

// ═══════════════════════════════════════════════════════════════════════════
// Schema
// ═══════════════════════════════════════════════════════════════════════════

const SQLITE_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS TSD_METRIC (XUID TEXT PRIMARY KEY, VERSION INTEGER NOT NULL, NAME TEXT NOT NULL, \
     CREATED INTEGER NOT NULL, LAST_UPDATE INTEGER NOT NULL, DESCRIPTION TEXT, DISPLAY_NAME TEXT, NOTES TEXT, CUSTOM TEXT)",
    "CREATE TABLE IF NOT EXISTS TSD_TAGK (XUID TEXT PRIMARY KEY, VERSION INTEGER NOT NULL, NAME TEXT NOT NULL, \
     CREATED INTEGER NOT NULL, LAST_UPDATE INTEGER NOT NULL, DESCRIPTION TEXT, DISPLAY_NAME TEXT, NOTES TEXT, CUSTOM TEXT)",
    "CREATE TABLE IF NOT EXISTS TSD_TAGV (XUID TEXT PRIMARY KEY, VERSION INTEGER NOT NULL, NAME TEXT NOT NULL, \
     CREATED INTEGER NOT NULL, LAST_UPDATE INTEGER NOT NULL, DESCRIPTION TEXT, DISPLAY_NAME TEXT, NOTES TEXT, CUSTOM TEXT)",
    "CREATE TABLE IF NOT EXISTS TSD_TAGPAIR (XUID TEXT PRIMARY KEY, TAGK TEXT NOT NULL, TAGV TEXT NOT NULL, \
     NAME TEXT NOT NULL, LAST_UPDATE INTEGER NOT NULL)",
    "CREATE TABLE IF NOT EXISTS TSD_TSMETA (FQNID INTEGER PRIMARY KEY, VERSION INTEGER NOT NULL, METRIC_UID TEXT NOT NULL, \
     FQN TEXT NOT NULL, TSUID TEXT NOT NULL UNIQUE, CREATED INTEGER NOT NULL, LAST_UPDATE INTEGER NOT NULL, \
     DESCRIPTION TEXT, DISPLAY_NAME TEXT, NOTES TEXT, UNITS TEXT, DATA_TYPE TEXT, RETENTION INTEGER NOT NULL DEFAULT 0, \
     MIN_VALUE REAL, MAX_VALUE REAL, CUSTOM TEXT)",
    "CREATE TABLE IF NOT EXISTS TSD_FQN_TAGPAIR (FQN_TP_ID INTEGER PRIMARY KEY, FQNID INTEGER NOT NULL, XUID TEXT NOT NULL, \
     PORDER INTEGER NOT NULL, NODE TEXT NOT NULL)",
    "CREATE TABLE IF NOT EXISTS TSD_ANNOTATION (ANNID INTEGER PRIMARY KEY, VERSION INTEGER NOT NULL, START_TIME INTEGER NOT NULL, \
     END_TIME INTEGER, FQNID INTEGER, DESCRIPTION TEXT, NOTES TEXT, CUSTOM TEXT, CREATED INTEGER NOT NULL, \
     LAST_UPDATE INTEGER NOT NULL, UNIQUE (START_TIME, FQNID))",
    "CREATE TABLE IF NOT EXISTS SYNC_QUEUE (QID INTEGER PRIMARY KEY, EVENT_TYPE TEXT NOT NULL, EVENT TEXT NOT NULL, \
     OBJECT_KEY TEXT NOT NULL, OP_TYPE TEXT NOT NULL, EVENT_TIME INTEGER NOT NULL)",
    "CREATE TABLE IF NOT EXISTS TSD_LASTSYNC (TABLE_NAME TEXT PRIMARY KEY, ORDERING INTEGER NOT NULL, LAST_SYNC INTEGER NOT NULL)",
    "CREATE TABLE IF NOT EXISTS TSD_LASTSYNC_FAILS (TABLE_NAME TEXT NOT NULL, OBJECT_ID TEXT NOT NULL, OBJECT_KEY TEXT NOT NULL, \
     OP_TYPE TEXT NOT NULL, ATTEMPTS INTEGER NOT NULL, LAST_ATTEMPT INTEGER NOT NULL, LAST_ERROR TEXT, \
     PRIMARY KEY (TABLE_NAME, OBJECT_ID))",
    "CREATE INDEX IF NOT EXISTS IDX_METRIC_LAST_UPDATE ON TSD_METRIC (LAST_UPDATE)",
    "CREATE INDEX IF NOT EXISTS IDX_TAGK_LAST_UPDATE ON TSD_TAGK (LAST_UPDATE)",
    "CREATE INDEX IF NOT EXISTS IDX_TAGV_LAST_UPDATE ON TSD_TAGV (LAST_UPDATE)",
    "CREATE INDEX IF NOT EXISTS IDX_TSMETA_LAST_UPDATE ON TSD_TSMETA (LAST_UPDATE)",
    "CREATE INDEX IF NOT EXISTS IDX_ANNOTATION_LAST_UPDATE ON TSD_ANNOTATION (LAST_UPDATE)",
    "CREATE INDEX IF NOT EXISTS IDX_TAGPAIR_TAGK ON TSD_TAGPAIR (TAGK)",
    "CREATE INDEX IF NOT EXISTS IDX_TAGPAIR_TAGV ON TSD_TAGPAIR (TAGV)",
    "CREATE INDEX IF NOT EXISTS IDX_FQN_TAGPAIR_FQNID ON TSD_FQN_TAGPAIR (FQNID)",
    "CREATE INDEX IF NOT EXISTS IDX_FQN_TAGPAIR_XUID ON TSD_FQN_TAGPAIR (XUID)",
    "CREATE INDEX IF NOT EXISTS IDX_SYNC_QUEUE_EVENT_TYPE ON SYNC_QUEUE (EVENT_TYPE)",
];

// MySQL - TEXT for CUSTOM (sqlx Any driver doesn't map the JSON type)
const MYSQL_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS TSD_METRIC (XUID VARCHAR(32) PRIMARY KEY, VERSION BIGINT NOT NULL, NAME VARCHAR(255) NOT NULL, \
     CREATED BIGINT NOT NULL, LAST_UPDATE BIGINT NOT NULL, DESCRIPTION TEXT, DISPLAY_NAME VARCHAR(255), NOTES TEXT, CUSTOM TEXT, \
     INDEX IDX_METRIC_LAST_UPDATE (LAST_UPDATE))",
    "CREATE TABLE IF NOT EXISTS TSD_TAGK (XUID VARCHAR(32) PRIMARY KEY, VERSION BIGINT NOT NULL, NAME VARCHAR(255) NOT NULL, \
     CREATED BIGINT NOT NULL, LAST_UPDATE BIGINT NOT NULL, DESCRIPTION TEXT, DISPLAY_NAME VARCHAR(255), NOTES TEXT, CUSTOM TEXT, \
     INDEX IDX_TAGK_LAST_UPDATE (LAST_UPDATE))",
    "CREATE TABLE IF NOT EXISTS TSD_TAGV (XUID VARCHAR(32) PRIMARY KEY, VERSION BIGINT NOT NULL, NAME VARCHAR(255) NOT NULL, \
     CREATED BIGINT NOT NULL, LAST_UPDATE BIGINT NOT NULL, DESCRIPTION TEXT, DISPLAY_NAME VARCHAR(255), NOTES TEXT, CUSTOM TEXT, \
     INDEX IDX_TAGV_LAST_UPDATE (LAST_UPDATE))",
    "CREATE TABLE IF NOT EXISTS TSD_TAGPAIR (XUID VARCHAR(64) PRIMARY KEY, TAGK VARCHAR(32) NOT NULL, TAGV VARCHAR(32) NOT NULL, \
     NAME VARCHAR(511) NOT NULL, LAST_UPDATE BIGINT NOT NULL, INDEX IDX_TAGPAIR_TAGK (TAGK), INDEX IDX_TAGPAIR_TAGV (TAGV))",
    "CREATE TABLE IF NOT EXISTS TSD_TSMETA (FQNID BIGINT PRIMARY KEY, VERSION BIGINT NOT NULL, METRIC_UID VARCHAR(32) NOT NULL, \
     FQN VARCHAR(4000) NOT NULL, TSUID VARCHAR(255) NOT NULL UNIQUE, CREATED BIGINT NOT NULL, LAST_UPDATE BIGINT NOT NULL, \
     DESCRIPTION TEXT, DISPLAY_NAME VARCHAR(255), NOTES TEXT, UNITS VARCHAR(64), DATA_TYPE VARCHAR(64), \
     RETENTION BIGINT NOT NULL DEFAULT 0, MIN_VALUE DOUBLE, MAX_VALUE DOUBLE, CUSTOM TEXT, \
     INDEX IDX_TSMETA_LAST_UPDATE (LAST_UPDATE))",
    "CREATE TABLE IF NOT EXISTS TSD_FQN_TAGPAIR (FQN_TP_ID BIGINT PRIMARY KEY, FQNID BIGINT NOT NULL, XUID VARCHAR(64) NOT NULL, \
     PORDER INT NOT NULL, NODE CHAR(1) NOT NULL, INDEX IDX_FQN_TAGPAIR_FQNID (FQNID), INDEX IDX_FQN_TAGPAIR_XUID (XUID))",
    "CREATE TABLE IF NOT EXISTS TSD_ANNOTATION (ANNID BIGINT PRIMARY KEY, VERSION BIGINT NOT NULL, START_TIME BIGINT NOT NULL, \
     END_TIME BIGINT, FQNID BIGINT, DESCRIPTION TEXT, NOTES TEXT, CUSTOM TEXT, CREATED BIGINT NOT NULL, \
     LAST_UPDATE BIGINT NOT NULL, UNIQUE KEY UQ_ANNOTATION (START_TIME, FQNID), \
     INDEX IDX_ANNOTATION_LAST_UPDATE (LAST_UPDATE))",
    "CREATE TABLE IF NOT EXISTS SYNC_QUEUE (QID BIGINT PRIMARY KEY, EVENT_TYPE VARCHAR(32) NOT NULL, EVENT VARCHAR(255) NOT NULL, \
     OBJECT_KEY VARCHAR(255) NOT NULL, OP_TYPE CHAR(1) NOT NULL, EVENT_TIME BIGINT NOT NULL, \
     INDEX IDX_SYNC_QUEUE_EVENT_TYPE (EVENT_TYPE))",
    "CREATE TABLE IF NOT EXISTS TSD_LASTSYNC (TABLE_NAME VARCHAR(32) PRIMARY KEY, ORDERING INT NOT NULL, LAST_SYNC BIGINT NOT NULL)",
    "CREATE TABLE IF NOT EXISTS TSD_LASTSYNC_FAILS (TABLE_NAME VARCHAR(32) NOT NULL, OBJECT_ID VARCHAR(255) NOT NULL, \
     OBJECT_KEY VARCHAR(255) NOT NULL, OP_TYPE CHAR(1) NOT NULL, ATTEMPTS INT NOT NULL, LAST_ATTEMPT BIGINT NOT NULL, \
     LAST_ERROR TEXT, PRIMARY KEY (TABLE_NAME, OBJECT_ID))",
];

/// Tables emptied by [`CatalogStore::purge`], dependents first.
const PURGED_TABLES: [&str; 9] = [
    "TSD_FQN_TAGPAIR",
    "TSD_ANNOTATION",
    "TSD_TSMETA",
    "TSD_TAGPAIR",
    "TSD_TAGK",
    "TSD_TAGV",
    "TSD_METRIC",
    "SYNC_QUEUE",
    "TSD_LASTSYNC_FAILS",
];

const UID_COLUMNS: &str = "XUID, VERSION, NAME, CREATED, LAST_UPDATE, DESCRIPTION, DISPLAY_NAME, NOTES, CUSTOM";

const TSMETA_SELECT: &str = "SELECT T.FQNID, T.VERSION, T.METRIC_UID, M.NAME AS MNAME, T.FQN, T.TSUID, T.CREATED, \
     T.LAST_UPDATE, T.DESCRIPTION, T.DISPLAY_NAME, T.NOTES, T.UNITS, T.DATA_TYPE, T.RETENTION, T.MIN_VALUE, \
     T.MAX_VALUE, T.CUSTOM FROM TSD_TSMETA T LEFT JOIN TSD_METRIC M ON M.XUID = T.METRIC_UID";

const ANNOTATION_SELECT: &str = "SELECT A.ANNID, A.VERSION, A.START_TIME, A.END_TIME, T.TSUID, A.DESCRIPTION, \
     A.NOTES, A.CUSTOM, A.CREATED, A.LAST_UPDATE FROM TSD_ANNOTATION A LEFT JOIN TSD_TSMETA T ON T.FQNID = A.FQNID";

// ═══════════════════════════════════════════════════════════════════════════
// Row mapping
// ═══════════════════════════════════════════════════════════════════════════

fn custom_json(custom: &CustomMap) -> Result<String, StorageError> {
    serde_json::to_string(custom).map_err(|e| StorageError::InvalidRecord(e.to_string()))
}

fn parse_custom(raw: Option<String>) -> Result<CustomMap, StorageError> {
    match raw {
        Some(s) if !s.trim().is_empty() => serde_json::from_str(&s)
            .map_err(|e| StorageError::InvalidRecord(format!("CUSTOM is not a string map: {}", e))),
        _ => Ok(CustomMap::new()),
    }
}

fn uid_from_row(row: &AnyRow, uid_type: UidType) -> Result<UidMeta, StorageError> {
    let mut meta = UidMeta::new(
        uid_type,
        text(row, "XUID").unwrap_or_default(),
        text(row, "NAME").unwrap_or_default(),
    );
    meta.version = row.try_get("VERSION").map_err(backend)?;
    meta.created = row.try_get("CREATED").map_err(backend)?;
    meta.last_update = row.try_get("LAST_UPDATE").map_err(backend)?;
    meta.description = text(row, "DESCRIPTION").unwrap_or_default();
    meta.display_name = text(row, "DISPLAY_NAME").unwrap_or_default();
    meta.notes = text(row, "NOTES").unwrap_or_default();
    meta.custom = parse_custom(text(row, "CUSTOM"))?;
    Ok(meta)
}

/// TSMeta row without its tags.
fn tsmeta_from_row(row: &AnyRow) -> Result<TsMeta, StorageError> {
    let metric = UidMeta::new(
        UidType::Metric,
        text(row, "METRIC_UID").unwrap_or_default(),
        text(row, "MNAME").unwrap_or_default(),
    );
    let mut meta = TsMeta::new(metric, Vec::new());
    meta.fqnid = Some(row.try_get("FQNID").map_err(backend)?);
    meta.tsuid = text(row, "TSUID").unwrap_or_default();
    meta.fqn = text(row, "FQN").unwrap_or_default();
    meta.version = row.try_get("VERSION").map_err(backend)?;
    meta.created = row.try_get("CREATED").map_err(backend)?;
    meta.last_update = row.try_get("LAST_UPDATE").map_err(backend)?;
    meta.description = text(row, "DESCRIPTION").unwrap_or_default();
    meta.display_name = text(row, "DISPLAY_NAME").unwrap_or_default();
    meta.notes = text(row, "NOTES").unwrap_or_default();
    meta.units = text(row, "UNITS").unwrap_or_default();
    meta.data_type = text(row, "DATA_TYPE").unwrap_or_default();
    meta.retention = row.try_get("RETENTION").unwrap_or(0);
    meta.min_value = row.try_get::<Option<f64>, _>("MIN_VALUE").unwrap_or(None);
    meta.max_value = row.try_get::<Option<f64>, _>("MAX_VALUE").unwrap_or(None);
    meta.custom = parse_custom(text(row, "CUSTOM"))?;
    Ok(meta)
}

fn annotation_from_row(row: &AnyRow) -> Result<Annotation, StorageError> {
    let start_time: i64 = row.try_get("START_TIME").map_err(backend)?;
    let mut ann = Annotation::new(
        text(row, "TSUID"),
        start_time,
        text(row, "DESCRIPTION").unwrap_or_default(),
    );
    ann.annid = Some(row.try_get("ANNID").map_err(backend)?);
    ann.end_time = row.try_get::<Option<i64>, _>("END_TIME").unwrap_or(None);
    ann.notes = text(row, "NOTES").unwrap_or_default();
    ann.custom = parse_custom(text(row, "CUSTOM"))?;
    ann.version = row.try_get("VERSION").map_err(backend)?;
    ann.created = row.try_get("CREATED").map_err(backend)?;
    ann.last_update = row.try_get("LAST_UPDATE").map_err(backend)?;
    Ok(ann)
}

fn uid_type_of(table: CatalogTable) -> Result<UidType, StorageError> {
    table
        .uid_type()
        .ok_or_else(|| StorageError::InvalidRecord(format!("{} is not a UID table", table)))
}

// ═══════════════════════════════════════════════════════════════════════════
// Connection-level readers (shared by pool reads and write transactions)
// ═══════════════════════════════════════════════════════════════════════════

async fn read_uid(
    conn: &mut AnyConnection,
    uid_type: UidType,
    uid: &str,
) -> Result<Option<UidMeta>, StorageError> {
    let sql = format!("SELECT {} FROM {} WHERE XUID = ?", UID_COLUMNS, uid_type.table());
    let row = sqlx::query(&sql)
        .bind(uid.to_ascii_uppercase())
        .fetch_optional(&mut *conn)
        .await
        .map_err(backend)?;
    row.map(|r| uid_from_row(&r, uid_type)).transpose()
}

async fn read_tags(conn: &mut AnyConnection, fqnid: i64) -> Result<Vec<UidMeta>, StorageError> {
    let rows = sqlx::query(
        "SELECT P.TAGK, P.TAGV, K.NAME AS KNAME, V.NAME AS VNAME FROM TSD_FQN_TAGPAIR F \
         JOIN TSD_TAGPAIR P ON P.XUID = F.XUID \
         LEFT JOIN TSD_TAGK K ON K.XUID = P.TAGK \
         LEFT JOIN TSD_TAGV V ON V.XUID = P.TAGV \
         WHERE F.FQNID = ? ORDER BY F.PORDER",
    )
    .bind(fqnid)
    .fetch_all(&mut *conn)
    .await
    .map_err(backend)?;

    let mut tags = Vec::with_capacity(rows.len() * 2);
    for row in rows {
        tags.push(UidMeta::new(
            UidType::Tagk,
            text(&row, "TAGK").unwrap_or_default(),
            text(&row, "KNAME").unwrap_or_default(),
        ));
        tags.push(UidMeta::new(
            UidType::Tagv,
            text(&row, "TAGV").unwrap_or_default(),
            text(&row, "VNAME").unwrap_or_default(),
        ));
    }
    Ok(tags)
}

async fn read_tsmeta_where(
    conn: &mut AnyConnection,
    clause: &str,
    bind: TsMetaKey<'_>,
) -> Result<Option<TsMeta>, StorageError> {
    let sql = format!("{} WHERE {}", TSMETA_SELECT, clause);
    let query = sqlx::query(&sql);
    let query = match bind {
        TsMetaKey::Tsuid(tsuid) => query.bind(tsuid.to_ascii_uppercase()),
        TsMetaKey::Fqnid(id) => query.bind(id),
    };
    let Some(row) = query.fetch_optional(&mut *conn).await.map_err(backend)? else {
        return Ok(None);
    };
    let mut meta = tsmeta_from_row(&row)?;
    if let Some(fqnid) = meta.fqnid {
        meta.tags = read_tags(conn, fqnid).await?;
    }
    Ok(Some(meta))
}

#[derive(Clone, Copy)]
enum TsMetaKey<'a> {
    Tsuid(&'a str),
    Fqnid(i64),
}

async fn fqnid_for(conn: &mut AnyConnection, tsuid: &str) -> Result<Option<i64>, StorageError> {
    let row = sqlx::query("SELECT FQNID FROM TSD_TSMETA WHERE TSUID = ?")
        .bind(tsuid.to_ascii_uppercase())
        .fetch_optional(&mut *conn)
        .await
        .map_err(backend)?;
    row.map(|r| r.try_get::<i64, _>("FQNID").map_err(backend)).transpose()
}

async fn read_annotation(
    conn: &mut AnyConnection,
    start_time: i64,
    tsuid: Option<&str>,
) -> Result<Option<Annotation>, StorageError> {
    let row = match tsuid {
        None => {
            let sql = format!("{} WHERE A.START_TIME = ? AND A.FQNID IS NULL", ANNOTATION_SELECT);
            sqlx::query(&sql)
                .bind(start_time)
                .fetch_optional(&mut *conn)
                .await
                .map_err(backend)?
        }
        Some(tsuid) => {
            let Some(fqnid) = fqnid_for(conn, tsuid).await? else {
                return Ok(None);
            };
            let sql = format!("{} WHERE A.START_TIME = ? AND A.FQNID = ?", ANNOTATION_SELECT);
            sqlx::query(&sql)
                .bind(start_time)
                .bind(fqnid)
                .fetch_optional(&mut *conn)
                .await
                .map_err(backend)?
        }
    };
    row.map(|r| annotation_from_row(&r)).transpose()
}

fn parse_annotation_key(key: &str) -> Result<(i64, Option<&str>), StorageError> {
    let (start, tsuid) = key
        .split_once(':')
        .ok_or_else(|| StorageError::InvalidRecord(format!("annotation key '{}' has no ':'", key)))?;
    let start: i64 = start
        .parse()
        .map_err(|_| StorageError::InvalidRecord(format!("annotation key '{}' has a bad start time", key)))?;
    Ok((start, if tsuid.is_empty() { None } else { Some(tsuid) }))
}

/// Row of `table` addressed by its natural (primary store) key.
async fn read_record(
    conn: &mut AnyConnection,
    table: CatalogTable,
    key: &str,
) -> Result<Option<CatalogRecord>, StorageError> {
    match table {
        CatalogTable::Tagk | CatalogTable::Tagv | CatalogTable::Metric => {
            Ok(read_uid(conn, uid_type_of(table)?, key).await?.map(CatalogRecord::Uid))
        }
        CatalogTable::TsMeta => Ok(read_tsmeta_where(conn, "T.TSUID = ?", TsMetaKey::Tsuid(key))
            .await?
            .map(CatalogRecord::TsMeta)),
        CatalogTable::Annotation => {
            let (start, tsuid) = parse_annotation_key(key)?;
            Ok(read_annotation(conn, start, tsuid).await?.map(CatalogRecord::Annotation))
        }
    }
}

/// Row of `table` addressed by its catalog primary key.
async fn read_record_by_pk(
    conn: &mut AnyConnection,
    table: CatalogTable,
    pk: &str,
) -> Result<Option<CatalogRecord>, StorageError> {
    let numeric = |pk: &str| {
        pk.parse::<i64>()
            .map_err(|_| StorageError::InvalidRecord(format!("{} pk '{}' is not numeric", table, pk)))
    };
    match table {
        CatalogTable::Tagk | CatalogTable::Tagv | CatalogTable::Metric => {
            read_record(conn, table, pk).await
        }
        CatalogTable::TsMeta => {
            let id = numeric(pk)?;
            Ok(read_tsmeta_where(conn, "T.FQNID = ?", TsMetaKey::Fqnid(id))
                .await?
                .map(CatalogRecord::TsMeta))
        }
        CatalogTable::Annotation => {
            let id = numeric(pk)?;
            let sql = format!("{} WHERE A.ANNID = ?", ANNOTATION_SELECT);
            let row = sqlx::query(&sql)
                .bind(id)
                .fetch_optional(&mut *conn)
                .await
                .map_err(backend)?;
            Ok(row
                .map(|r| annotation_from_row(&r))
                .transpose()?
                .map(CatalogRecord::Annotation))
        }
    }
}

async fn uid_name(
    conn: &mut AnyConnection,
    uid_type: UidType,
    uid: &str,
) -> Result<Option<String>, StorageError> {
    let sql = format!("SELECT NAME FROM {} WHERE XUID = ?", uid_type.table());
    let row = sqlx::query(&sql)
        .bind(uid)
        .fetch_optional(&mut *conn)
        .await
        .map_err(backend)?;
    Ok(row.and_then(|r| text(&r, "NAME")))
}

/// Create the tag pair if missing and return its name.
async fn ensure_tag_pair(
    conn: &mut AnyConnection,
    tagk: &str,
    tagv: &str,
    now: i64,
) -> Result<String, StorageError> {
    let xuid = tag_pair_uid(tagk, tagv);
    let existing = sqlx::query("SELECT NAME FROM TSD_TAGPAIR WHERE XUID = ?")
        .bind(&xuid)
        .fetch_optional(&mut *conn)
        .await
        .map_err(backend)?;
    if let Some(name) = existing.and_then(|r| text(&r, "NAME")) {
        return Ok(name);
    }

    let k = uid_name(conn, UidType::Tagk, tagk)
        .await?
        .ok_or_else(|| StorageError::InvalidRecord(format!("unknown TAGK uid {}", tagk)))?;
    let v = uid_name(conn, UidType::Tagv, tagv)
        .await?
        .ok_or_else(|| StorageError::InvalidRecord(format!("unknown TAGV uid {}", tagv)))?;
    let name = tag_pair_name(&k, &v);

    sqlx::query("INSERT INTO TSD_TAGPAIR (XUID, TAGK, TAGV, NAME, LAST_UPDATE) VALUES (?, ?, ?, ?, ?)")
        .bind(&xuid)
        .bind(tagk)
        .bind(tagv)
        .bind(&name)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(backend)?;
    Ok(name)
}

// ═══════════════════════════════════════════════════════════════════════════
// Catalog store
// ═══════════════════════════════════════════════════════════════════════════

/// Result of one captured catalog write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    /// The row as persisted (or the untouched stored row when unchanged)
    pub record: CatalogRecord,
    pub capture: Capture,
    /// Sync queue id, when an entry was queued
    pub qid: Option<i64>,
    /// Set when a UID `NAME` changed
    pub rename: Option<UidRename>,
    pub cascade: CascadeReport,
}

impl WriteOutcome {
    #[must_use]
    pub fn changed(&self) -> bool {
        self.capture != Capture::Unchanged
    }

    #[must_use]
    pub fn queued(&self) -> bool {
        self.qid.is_some()
    }
}

/// Ids drawn before the transaction opens.
#[derive(Default)]
struct Reserved {
    qid: Option<i64>,
    pk: Option<i64>,
    tag_pair_ids: Vec<i64>,
}

pub struct CatalogStore {
    pool: AnyPool,
    is_sqlite: bool,
    trigger: ChangeCaptureTrigger,
    qid_seq: SequenceAllocator,
    fqn_seq: SequenceAllocator,
    fqn_tp_seq: SequenceAllocator,
    ann_seq: SequenceAllocator,
    // SQLite has one writer; keep catalog transactions from racing each other
    // into SQLITE_BUSY on lock upgrade.
    write_gate: Option<tokio::sync::Mutex<()>>,
}

impl CatalogStore {
    /// Connect, bootstrap the schema and create the id sequences.
    pub async fn open(
        url: &str,
        max_connections: u32,
        increment: i64,
        native_sequences: bool,
    ) -> Result<Self, StorageError> {
        let pool = connect_pool(url, max_connections).await?;
        Self::with_pool(pool, is_sqlite_url(url), increment, native_sequences).await
    }

    pub async fn with_pool(
        pool: AnyPool,
        is_sqlite: bool,
        increment: i64,
        native_sequences: bool,
    ) -> Result<Self, StorageError> {
        Self::init_schema(&pool, is_sqlite).await?;

        let store = Self {
            qid_seq: open_sequence(&pool, is_sqlite, native_sequences, QID_SEQ, increment).await?,
            fqn_seq: open_sequence(&pool, is_sqlite, native_sequences, FQN_SEQ, increment).await?,
            fqn_tp_seq: open_sequence(&pool, is_sqlite, native_sequences, FQN_TP_SEQ, increment).await?,
            ann_seq: open_sequence(&pool, is_sqlite, native_sequences, ANN_SEQ, increment).await?,
            pool,
            is_sqlite,
            trigger: ChangeCaptureTrigger::new(),
            write_gate: is_sqlite.then(|| tokio::sync::Mutex::new(())),
        };
        info!(sqlite = is_sqlite, native_sequences, increment, "Catalog store ready");
        Ok(store)
    }

    async fn init_schema(pool: &AnyPool, is_sqlite: bool) -> Result<(), StorageError> {
        let statements = if is_sqlite { SQLITE_SCHEMA } else { MYSQL_SCHEMA };
        for sql in statements {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql).execute(pool).await.map_err(backend)
            })
            .await?;
        }
        Ok(())
    }

    /// Get a clone of the connection pool for sharing with the sync ledger.
    #[must_use]
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    #[must_use]
    pub fn is_sqlite(&self) -> bool {
        self.is_sqlite
    }

    #[must_use]
    pub fn trigger_stats(&self) -> TriggerStats {
        self.trigger.stats()
    }

    #[must_use]
    pub fn sequence_stats(&self) -> Vec<SequenceStats> {
        vec![
            self.qid_seq.stats(),
            self.fqn_seq.stats(),
            self.fqn_tp_seq.stats(),
            self.ann_seq.stats(),
        ]
    }

    async fn reserve(
        &self,
        record: &CatalogRecord,
        exists: bool,
        opts: &WriteOptions,
    ) -> Result<Reserved, StorageError> {
        let mut reserved = Reserved::default();
        if !opts.suppresses_capture() {
            reserved.qid = Some(self.qid_seq.next().await?);
        }
        if exists {
            return Ok(reserved);
        }
        match record {
            CatalogRecord::TsMeta(t) => {
                if t.fqnid.is_none() {
                    reserved.pk = Some(self.fqn_seq.next().await?);
                }
                reserved.tag_pair_ids = self.fqn_tp_seq.next_n(t.tags.len() / 2).await?;
            }
            CatalogRecord::Annotation(a) if a.annid.is_none() => {
                reserved.pk = Some(self.ann_seq.next().await?);
            }
            _ => {}
        }
        Ok(reserved)
    }

    /// Insert or update one catalog row with change capture.
    #[tracing::instrument(skip(self, record), fields(table = %record.table(), key = %record.natural_key()))]
    pub async fn write(
        &self,
        record: CatalogRecord,
        opts: WriteOptions,
    ) -> Result<WriteOutcome, StorageError> {
        let _timer = LatencyTimer::new("catalog", "write");
        let _gate = match &self.write_gate {
            Some(gate) => Some(gate.lock().await),
            None => None,
        };

        // Ids come from their own transactions, so draw them before ours opens
        let exists = {
            let mut conn = self.pool.acquire().await.map_err(backend)?;
            read_record(&mut conn, record.table(), &record.natural_key())
                .await?
                .is_some()
        };
        let reserved = self.reserve(&record, exists, &opts).await?;

        let mut tx = self.pool.begin().await.map_err(backend)?;
        match self.write_in(&mut tx, record, &opts, reserved).await {
            Ok(outcome) => {
                tx.commit().await.map_err(backend)?;
                Ok(outcome)
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    debug!(error = %rb, "Rollback after failed write also failed");
                }
                crate::metrics::record_error("catalog", "write", error_kind(&e));
                Err(e)
            }
        }
    }

    async fn write_in(
        &self,
        conn: &mut AnyConnection,
        mut new: CatalogRecord,
        opts: &WriteOptions,
        reserved: Reserved,
    ) -> Result<WriteOutcome, StorageError> {
        let table = new.table();
        let key = new.natural_key();
        let now = now_millis();
        let old = read_record(conn, table, &key).await?;

        // Assigned keys are owned by the catalog
        match (&old, &mut new) {
            (Some(CatalogRecord::TsMeta(o)), CatalogRecord::TsMeta(n)) => {
                n.fqnid = o.fqnid;
                n.fqn = o.fqn.clone();
            }
            (Some(CatalogRecord::Annotation(o)), CatalogRecord::Annotation(n)) => n.annid = o.annid,
            (None, CatalogRecord::TsMeta(n)) if n.fqnid.is_none() => n.fqnid = Some(reserved.pk.ok_or_else(concurrent)?),
            (None, CatalogRecord::Annotation(n)) if n.annid.is_none() => n.annid = Some(reserved.pk.ok_or_else(concurrent)?),
            _ => {}
        }

        let capture = self.trigger.fire(table, old.as_ref(), Some(&mut new), opts)?;
        if capture == Capture::Unchanged {
            let stored = old.ok_or_else(concurrent)?;
            return Ok(WriteOutcome {
                record: stored,
                capture,
                qid: None,
                rename: None,
                cascade: CascadeReport::default(),
            });
        }

        LastUpdateStamp::stamp(old.as_ref(), &mut new, now);
        new.echo_pk();

        match (&old, &mut new) {
            (None, CatalogRecord::Uid(u)) => insert_uid(conn, u).await?,
            (Some(_), CatalogRecord::Uid(u)) => update_uid(conn, u).await?,
            (None, CatalogRecord::TsMeta(t)) => insert_tsmeta(conn, t, &reserved.tag_pair_ids, now).await?,
            (Some(_), CatalogRecord::TsMeta(t)) => update_tsmeta(conn, t).await?,
            (None, CatalogRecord::Annotation(a)) => insert_annotation(conn, a).await?,
            (Some(_), CatalogRecord::Annotation(a)) => update_annotation(conn, a).await?,
        }

        let mut qid = None;
        if let Capture::Queued(op) = capture {
            let entry = SyncQueueEntry {
                qid: reserved.qid.ok_or_else(concurrent)?,
                table,
                pk: new.pk().ok_or_else(concurrent)?,
                object_key: key,
                op,
                event_time: now,
            };
            self.trigger.enqueue(conn, &entry).await?;
            qid = Some(entry.qid);
        }

        let rename = match (&old, &new) {
            (Some(CatalogRecord::Uid(o)), CatalogRecord::Uid(n)) if o.name != n.name => Some(UidRename {
                uid_type: n.uid_type,
                uid: n.uid.clone(),
                old_name: o.name.clone(),
                new_name: n.name.clone(),
            }),
            _ => None,
        };
        let cascade = match &rename {
            Some(r) => RenameCascade::apply(conn, r, now).await?,
            None => CascadeReport::default(),
        };

        Ok(WriteOutcome {
            record: new,
            capture,
            qid,
            rename,
            cascade,
        })
    }

    /// Delete a row by natural key. Returns the removed row, if there was one.
    #[tracing::instrument(skip(self))]
    pub async fn delete(
        &self,
        table: CatalogTable,
        key: &str,
        opts: WriteOptions,
    ) -> Result<Option<CatalogRecord>, StorageError> {
        let _timer = LatencyTimer::new("catalog", "delete");
        let _gate = match &self.write_gate {
            Some(gate) => Some(gate.lock().await),
            None => None,
        };
        let qid = if opts.suppresses_capture() {
            None
        } else {
            Some(self.qid_seq.next().await?)
        };

        let mut tx = self.pool.begin().await.map_err(backend)?;
        match self.delete_in(&mut tx, table, key, &opts, qid).await {
            Ok(removed) => {
                tx.commit().await.map_err(backend)?;
                Ok(removed)
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    debug!(error = %rb, "Rollback after failed delete also failed");
                }
                Err(e)
            }
        }
    }

    async fn delete_in(
        &self,
        conn: &mut AnyConnection,
        table: CatalogTable,
        key: &str,
        opts: &WriteOptions,
        qid: Option<i64>,
    ) -> Result<Option<CatalogRecord>, StorageError> {
        let Some(old) = read_record(conn, table, key).await? else {
            return Ok(None);
        };
        let capture = self.trigger.fire(table, Some(&old), None, opts)?;
        let pk = old.pk().ok_or_else(concurrent)?;

        match &old {
            CatalogRecord::Uid(u) => {
                let sql = format!("DELETE FROM {} WHERE XUID = ?", table);
                sqlx::query(&sql).bind(&u.uid).execute(&mut *conn).await.map_err(backend)?;
            }
            CatalogRecord::TsMeta(t) => {
                let fqnid = t.fqnid.ok_or_else(concurrent)?;
                sqlx::query("DELETE FROM TSD_FQN_TAGPAIR WHERE FQNID = ?")
                    .bind(fqnid)
                    .execute(&mut *conn)
                    .await
                    .map_err(backend)?;
                sqlx::query("DELETE FROM TSD_TSMETA WHERE FQNID = ?")
                    .bind(fqnid)
                    .execute(&mut *conn)
                    .await
                    .map_err(backend)?;
            }
            CatalogRecord::Annotation(a) => {
                sqlx::query("DELETE FROM TSD_ANNOTATION WHERE ANNID = ?")
                    .bind(a.annid)
                    .execute(&mut *conn)
                    .await
                    .map_err(backend)?;
            }
        }

        if capture == Capture::Queued(OpType::Delete) {
            let entry = SyncQueueEntry {
                qid: qid.ok_or_else(concurrent)?,
                table,
                pk,
                object_key: key.to_string(),
                op: OpType::Delete,
                event_time: now_millis(),
            };
            self.trigger.enqueue(conn, &entry).await?;
        }
        Ok(Some(old))
    }

    // ─── reads ─────────────────────────────────────────────────────────────

    /// Row by natural key: UID, TSUID, or `start:tsuid` for annotations.
    pub async fn read(&self, table: CatalogTable, key: &str) -> Result<Option<CatalogRecord>, StorageError> {
        retry_transient("sql_read", &RetryConfig::query(), || async {
            let mut conn = self.pool.acquire().await.map_err(backend)?;
            read_record(&mut conn, table, key).await
        })
        .await
    }

    /// Row by catalog primary key, as recorded in the sync queue.
    pub async fn read_by_pk(&self, table: CatalogTable, pk: &str) -> Result<Option<CatalogRecord>, StorageError> {
        retry_transient("sql_read_pk", &RetryConfig::query(), || async {
            let mut conn = self.pool.acquire().await.map_err(backend)?;
            read_record_by_pk(&mut conn, table, pk).await
        })
        .await
    }

    pub async fn get_uid(&self, uid_type: UidType, uid: &str) -> Result<Option<UidMeta>, StorageError> {
        let mut conn = self.pool.acquire().await.map_err(backend)?;
        read_uid(&mut conn, uid_type, uid).await
    }

    pub async fn get_tsmeta(&self, tsuid: &str) -> Result<Option<TsMeta>, StorageError> {
        let mut conn = self.pool.acquire().await.map_err(backend)?;
        read_tsmeta_where(&mut conn, "T.TSUID = ?", TsMetaKey::Tsuid(tsuid)).await
    }

    pub async fn get_annotation(&self, start_time: i64, tsuid: Option<&str>) -> Result<Option<Annotation>, StorageError> {
        let mut conn = self.pool.acquire().await.map_err(backend)?;
        read_annotation(&mut conn, start_time, tsuid).await
    }

    /// Denormalized `tagk=tagv` name of a tag pair.
    pub async fn tag_pair_name(&self, tagk: &str, tagv: &str) -> Result<Option<String>, StorageError> {
        let row = sqlx::query("SELECT NAME FROM TSD_TAGPAIR WHERE XUID = ?")
            .bind(tag_pair_uid(&tagk.to_ascii_uppercase(), &tagv.to_ascii_uppercase()))
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Ok(row.and_then(|r| text(&r, "NAME")))
    }

    /// Rows changed strictly after `since`, oldest first.
    pub async fn scan_changed(&self, table: CatalogTable, since: i64) -> Result<Vec<CatalogRecord>, StorageError> {
        let mut conn = self.pool.acquire().await.map_err(backend)?;
        match table {
            CatalogTable::Tagk | CatalogTable::Tagv | CatalogTable::Metric => {
                let uid_type = uid_type_of(table)?;
                let sql = format!(
                    "SELECT {} FROM {} WHERE LAST_UPDATE > ? ORDER BY LAST_UPDATE, XUID",
                    UID_COLUMNS, table
                );
                let rows = sqlx::query(&sql)
                    .bind(since)
                    .fetch_all(&mut *conn)
                    .await
                    .map_err(backend)?;
                rows.iter()
                    .map(|r| uid_from_row(r, uid_type).map(CatalogRecord::Uid))
                    .collect()
            }
            CatalogTable::TsMeta => {
                let rows = sqlx::query(
                    "SELECT FQNID FROM TSD_TSMETA WHERE LAST_UPDATE > ? ORDER BY LAST_UPDATE, FQNID",
                )
                .bind(since)
                .fetch_all(&mut *conn)
                .await
                .map_err(backend)?;
                let mut out = Vec::with_capacity(rows.len());
                for row in rows {
                    let fqnid: i64 = row.try_get("FQNID").map_err(backend)?;
                    if let Some(meta) = read_tsmeta_where(&mut conn, "T.FQNID = ?", TsMetaKey::Fqnid(fqnid)).await? {
                        out.push(CatalogRecord::TsMeta(meta));
                    }
                }
                Ok(out)
            }
            CatalogTable::Annotation => {
                let sql = format!(
                    "{} WHERE A.LAST_UPDATE > ? ORDER BY A.LAST_UPDATE, A.ANNID",
                    ANNOTATION_SELECT
                );
                let rows = sqlx::query(&sql)
                    .bind(since)
                    .fetch_all(&mut *conn)
                    .await
                    .map_err(backend)?;
                rows.iter()
                    .map(|r| annotation_from_row(r).map(CatalogRecord::Annotation))
                    .collect()
            }
        }
    }

    pub async fn count(&self, table: CatalogTable) -> Result<i64, StorageError> {
        let sql = format!("SELECT COUNT(*) AS CNT FROM {}", table);
        let row = sqlx::query(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        row.try_get("CNT").map_err(backend)
    }

    /// Empty every catalog table and rewind the watermarks.
    pub async fn purge(&self) -> Result<(), StorageError> {
        let _gate = match &self.write_gate {
            Some(gate) => Some(gate.lock().await),
            None => None,
        };
        let mut tx = self.pool.begin().await.map_err(backend)?;
        for table in PURGED_TABLES {
            let sql = format!("DELETE FROM {}", table);
            sqlx::query(&sql).execute(&mut *tx).await.map_err(backend)?;
        }
        sqlx::query("UPDATE TSD_LASTSYNC SET LAST_SYNC = 0")
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        tx.commit().await.map_err(backend)?;
        info!("Catalog purged");
        Ok(())
    }
}

async fn open_sequence(
    pool: &AnyPool,
    is_sqlite: bool,
    native: bool,
    name: &str,
    increment: i64,
) -> Result<SequenceAllocator, StorageError> {
    let source: Arc<dyn SequenceSource> = if native {
        Arc::new(NativeSequence::create(pool.clone(), name, increment).await?)
    } else {
        Arc::new(CounterTableSequence::create(pool.clone(), is_sqlite, name, increment).await?)
    };
    SequenceAllocator::new(source, increment)
}

fn concurrent() -> StorageError {
    StorageError::Backend("row changed concurrently, retry the write".to_string())
}

fn error_kind(e: &StorageError) -> &'static str {
    match e {
        StorageError::NotFound => "not_found",
        StorageError::Backend(_) => "backend",
        StorageError::Timeout(_) => "timeout",
        StorageError::InvalidRecord(_) => "invalid_record",
        StorageError::Trigger(_) => "trigger",
        StorageError::Sequence(_) => "sequence",
        StorageError::Predicate(_) => "predicate",
    }
}

// ─── row writers ────────────────────────────────────────────────────────────

async fn insert_uid(conn: &mut AnyConnection, u: &UidMeta) -> Result<(), StorageError> {
    let sql = format!(
        "INSERT INTO {} ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        u.uid_type.table(),
        UID_COLUMNS
    );
    sqlx::query(&sql)
        .bind(&u.uid)
        .bind(u.version)
        .bind(&u.name)
        .bind(u.created)
        .bind(u.last_update)
        .bind(&u.description)
        .bind(&u.display_name)
        .bind(&u.notes)
        .bind(custom_json(&u.custom)?)
        .execute(&mut *conn)
        .await
        .map_err(backend)?;
    Ok(())
}

async fn update_uid(conn: &mut AnyConnection, u: &UidMeta) -> Result<(), StorageError> {
    let sql = format!(
        "UPDATE {} SET VERSION = ?, NAME = ?, CREATED = ?, LAST_UPDATE = ?, DESCRIPTION = ?, \
         DISPLAY_NAME = ?, NOTES = ?, CUSTOM = ? WHERE XUID = ?",
        u.uid_type.table()
    );
    sqlx::query(&sql)
        .bind(u.version)
        .bind(&u.name)
        .bind(u.created)
        .bind(u.last_update)
        .bind(&u.description)
        .bind(&u.display_name)
        .bind(&u.notes)
        .bind(custom_json(&u.custom)?)
        .bind(&u.uid)
        .execute(&mut *conn)
        .await
        .map_err(backend)?;
    Ok(())
}

async fn insert_tsmeta(
    conn: &mut AnyConnection,
    t: &mut TsMeta,
    tag_pair_ids: &[i64],
    now: i64,
) -> Result<(), StorageError> {
    let fqnid = t.fqnid.ok_or_else(concurrent)?;
    let pairs: Vec<(String, String)> = t
        .tag_pairs()
        .map(|(k, v)| (k.uid.clone(), v.uid.clone()))
        .collect();
    if tag_pair_ids.len() < pairs.len() {
        return Err(concurrent());
    }

    let metric_name = uid_name(conn, UidType::Metric, &t.metric.uid)
        .await?
        .ok_or_else(|| StorageError::InvalidRecord(format!("unknown METRIC uid {}", t.metric.uid)))?;
    let mut pair_names = Vec::with_capacity(pairs.len());
    for (k, v) in &pairs {
        pair_names.push(ensure_tag_pair(conn, k, v, now).await?);
    }
    t.fqn = fqn(&metric_name, &pair_names);
    if t.metric.name.is_empty() {
        t.metric.name = metric_name;
    }

    sqlx::query(
        "INSERT INTO TSD_TSMETA (FQNID, VERSION, METRIC_UID, FQN, TSUID, CREATED, LAST_UPDATE, DESCRIPTION, \
         DISPLAY_NAME, NOTES, UNITS, DATA_TYPE, RETENTION, MIN_VALUE, MAX_VALUE, CUSTOM) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(fqnid)
    .bind(t.version)
    .bind(&t.metric.uid)
    .bind(&t.fqn)
    .bind(&t.tsuid)
    .bind(t.created)
    .bind(t.last_update)
    .bind(&t.description)
    .bind(&t.display_name)
    .bind(&t.notes)
    .bind(&t.units)
    .bind(&t.data_type)
    .bind(t.retention)
    .bind(t.min_value)
    .bind(t.max_value)
    .bind(custom_json(&t.custom)?)
    .execute(&mut *conn)
    .await
    .map_err(backend)?;

    let last = pairs.len().saturating_sub(1);
    for (i, ((k, v), id)) in pairs.iter().zip(tag_pair_ids).enumerate() {
        sqlx::query("INSERT INTO TSD_FQN_TAGPAIR (FQN_TP_ID, FQNID, XUID, PORDER, NODE) VALUES (?, ?, ?, ?, ?)")
            .bind(*id)
            .bind(fqnid)
            .bind(tag_pair_uid(k, v))
            .bind(i as i64)
            .bind(if i == last { "L" } else { "B" })
            .execute(&mut *conn)
            .await
            .map_err(backend)?;
    }
    Ok(())
}

/// Identity columns (TSUID, metric, tags, FQN) are immutable once inserted.
async fn update_tsmeta(conn: &mut AnyConnection, t: &TsMeta) -> Result<(), StorageError> {
    sqlx::query(
        "UPDATE TSD_TSMETA SET VERSION = ?, CREATED = ?, LAST_UPDATE = ?, DESCRIPTION = ?, DISPLAY_NAME = ?, \
         NOTES = ?, UNITS = ?, DATA_TYPE = ?, RETENTION = ?, MIN_VALUE = ?, MAX_VALUE = ?, CUSTOM = ? \
         WHERE FQNID = ?",
    )
    .bind(t.version)
    .bind(t.created)
    .bind(t.last_update)
    .bind(&t.description)
    .bind(&t.display_name)
    .bind(&t.notes)
    .bind(&t.units)
    .bind(&t.data_type)
    .bind(t.retention)
    .bind(t.min_value)
    .bind(t.max_value)
    .bind(custom_json(&t.custom)?)
    .bind(t.fqnid.ok_or_else(concurrent)?)
    .execute(&mut *conn)
    .await
    .map_err(backend)?;
    Ok(())
}

async fn annotation_fqnid(conn: &mut AnyConnection, a: &Annotation) -> Result<Option<i64>, StorageError> {
    match &a.tsuid {
        None => Ok(None),
        Some(tsuid) => fqnid_for(conn, tsuid)
            .await?
            .map(Some)
            .ok_or_else(|| StorageError::InvalidRecord(format!("annotation for unknown tsuid {}", tsuid))),
    }
}

async fn insert_annotation(conn: &mut AnyConnection, a: &Annotation) -> Result<(), StorageError> {
    let fqnid = annotation_fqnid(conn, a).await?;
    sqlx::query(
        "INSERT INTO TSD_ANNOTATION (ANNID, VERSION, START_TIME, END_TIME, FQNID, DESCRIPTION, NOTES, CUSTOM, \
         CREATED, LAST_UPDATE) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(a.annid.ok_or_else(concurrent)?)
    .bind(a.version)
    .bind(a.start_time)
    .bind(a.end_time)
    .bind(fqnid)
    .bind(&a.description)
    .bind(&a.notes)
    .bind(custom_json(&a.custom)?)
    .bind(a.created)
    .bind(a.last_update)
    .execute(&mut *conn)
    .await
    .map_err(backend)?;
    Ok(())
}

async fn update_annotation(conn: &mut AnyConnection, a: &Annotation) -> Result<(), StorageError> {
    sqlx::query(
        "UPDATE TSD_ANNOTATION SET VERSION = ?, END_TIME = ?, DESCRIPTION = ?, NOTES = ?, CUSTOM = ?, \
         CREATED = ?, LAST_UPDATE = ? WHERE ANNID = ?",
    )
    .bind(a.version)
    .bind(a.end_time)
    .bind(&a.description)
    .bind(&a.notes)
    .bind(custom_json(&a.custom)?)
    .bind(a.created)
    .bind(a.last_update)
    .bind(a.annid.ok_or_else(concurrent)?)
    .execute(&mut *conn)
    .await
    .map_err(backend)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Decode cache loaders
// ═══════════════════════════════════════════════════════════════════════════

#[async_trait]
impl CatalogLookup for CatalogStore {
    async fn load_uid(&self, uid_type: UidType, uid: &str) -> Result<Option<UidMeta>, StorageError> {
        retry_transient("sql_load_uid", &RetryConfig::query(), || self.get_uid(uid_type, uid)).await
    }

    async fn scan_uids(&self, uid_type: UidType, limit: usize) -> Result<Vec<UidMeta>, StorageError> {
        let sql = format!("SELECT {} FROM {} ORDER BY XUID LIMIT ?", UID_COLUMNS, uid_type.table());
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(|r| uid_from_row(r, uid_type)).collect()
    }

    async fn load_tsmeta(&self, tsuid: &str) -> Result<Option<TsMeta>, StorageError> {
        retry_transient("sql_load_tsmeta", &RetryConfig::query(), || self.get_tsmeta(tsuid)).await
    }

    async fn scan_tsmeta(&self, limit: usize) -> Result<Vec<TsMeta>, StorageError> {
        let mut conn = self.pool.acquire().await.map_err(backend)?;
        let rows = sqlx::query("SELECT FQNID FROM TSD_TSMETA ORDER BY FQNID LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&mut *conn)
            .await
            .map_err(backend)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let fqnid: i64 = row.try_get("FQNID").map_err(backend)?;
            if let Some(meta) = read_tsmeta_where(&mut conn, "T.FQNID = ?", TsMetaKey::Fqnid(fqnid)).await? {
                out.push(meta);
            }
        }
        Ok(out)
    }

    async fn resolve_tag_pairs(&self, predicates: &TagPredicateSet) -> Result<Vec<String>, StorageError> {
        let sql = predicates.sql();
        let mut query = sqlx::query(&sql);
        for bind in predicates.binds() {
            query = query.bind(bind);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(|e| {
            StorageError::Predicate(format!("{}: {}", predicates.render_sql(), e))
        })?;
        Ok(rows.iter().filter_map(|r| text(r, "XUID")).collect())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{queue_rows, seed_series, temp_store};
    use super::*;
    use crate::record::{annotation_key, PK_KEY, VERSION_KEY};

    fn tagk(uid: &str, name: &str) -> CatalogRecord {
        CatalogRecord::Uid(UidMeta::new(UidType::Tagk, uid, name))
    }

    #[tokio::test]
    async fn test_insert_stamps_versions_and_queues() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(dir.path()).await;

        let out = store.write(tagk("000001", "host"), WriteOptions::catalog()).await.unwrap();
        assert_eq!(out.capture, Capture::Queued(OpType::Insert));
        assert!(out.queued());
        assert_eq!(out.record.version(), 1);
        assert_eq!(out.record.created(), out.record.last_update());
        assert_eq!(out.record.custom().get(VERSION_KEY).map(String::as_str), Some("1"));
        assert_eq!(out.record.custom().get(PK_KEY).map(String::as_str), Some("000001"));

        let stored = store.get_uid(UidType::Tagk, "000001").await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.custom.get(VERSION_KEY).map(String::as_str), Some("1"));

        assert_eq!(
            queue_rows(&store).await,
            vec![("TSD_TAGK".into(), "000001".into(), "000001".into(), "I".into())]
        );
    }

    #[tokio::test]
    async fn test_update_bumps_version_and_advances_last_update() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(dir.path()).await;
        let first = store.write(tagk("000001", "host"), WriteOptions::catalog()).await.unwrap();

        let mut edited = UidMeta::new(UidType::Tagk, "000001", "host");
        edited.description = "machine name".into();
        let second = store.write(CatalogRecord::Uid(edited), WriteOptions::catalog()).await.unwrap();

        assert_eq!(second.capture, Capture::Queued(OpType::Update));
        assert_eq!(second.record.version(), 2);
        assert_eq!(second.record.created(), first.record.created());
        assert!(second.record.last_update() > first.record.last_update());
        assert_eq!(queue_rows(&store).await.len(), 2);
    }

    #[tokio::test]
    async fn test_field_equal_write_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(dir.path()).await;
        let first = store.write(tagk("000001", "host"), WriteOptions::catalog()).await.unwrap();

        let again = store.write(tagk("000001", "host"), WriteOptions::catalog()).await.unwrap();
        assert!(!again.changed());
        assert_eq!(again.record, first.record);
        assert_eq!(queue_rows(&store).await.len(), 1);
    }

    #[tokio::test]
    async fn test_propagation_write_neither_versions_nor_queues() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(dir.path()).await;
        store.write(tagk("000001", "host"), WriteOptions::catalog()).await.unwrap();

        let mut pushed = UidMeta::new(UidType::Tagk, "000001", "host");
        pushed.notes = "from primary".into();
        let out = store.write(CatalogRecord::Uid(pushed), WriteOptions::propagation()).await.unwrap();

        assert_eq!(out.capture, Capture::Suppressed);
        assert!(!out.queued());
        assert_eq!(out.record.version(), 1);
        assert_eq!(queue_rows(&store).await.len(), 1);
        let stored = store.get_uid(UidType::Tagk, "000001").await.unwrap().unwrap();
        assert_eq!(stored.notes, "from primary");
    }

    #[tokio::test]
    async fn test_event_queue_write_queues_without_bump() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(dir.path()).await;
        store.write(tagk("000001", "host"), WriteOptions::catalog()).await.unwrap();

        let mut relayed = UidMeta::new(UidType::Tagk, "000001", "host");
        relayed.notes = "relayed".into();
        let out = store.write(CatalogRecord::Uid(relayed), WriteOptions::event_queue()).await.unwrap();
        assert_eq!(out.record.version(), 1);
        assert!(out.queued());
    }

    #[tokio::test]
    async fn test_rejected_row_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(dir.path()).await;

        let err = store.write(tagk("000001", ""), WriteOptions::catalog()).await.unwrap_err();
        assert!(matches!(err, StorageError::Trigger(_)));
        assert_eq!(store.count(CatalogTable::Tagk).await.unwrap(), 0);
        assert!(queue_rows(&store).await.is_empty());
    }

    #[tokio::test]
    async fn test_tsmeta_insert_builds_pairs_and_fqn() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(dir.path()).await;
        let series = seed_series(&store).await;

        assert_eq!(series.tsuid, "000001000001000001000002000002");
        assert_eq!(series.fqn, "sys.cpu:host=web01,dc=lon");
        assert!(series.fqnid.is_some());
        assert_eq!(store.tag_pair_name("000001", "000001").await.unwrap().as_deref(), Some("host=web01"));

        let loaded = store.get_tsmeta(&series.tsuid).await.unwrap().unwrap();
        assert_eq!(loaded.fqn, series.fqn);
        assert_eq!(loaded.tags.len(), 4);
        assert_eq!(loaded.tags[0].name, "host");
        assert_eq!(loaded.tags[3].name, "lon");
        assert_eq!(loaded.metric.name, "sys.cpu");
    }

    #[tokio::test]
    async fn test_tsmeta_with_unknown_uid_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(dir.path()).await;
        let series = TsMeta::new(
            UidMeta::reference(UidType::Metric, "0000FF"),
            vec![(UidMeta::reference(UidType::Tagk, "000001"), UidMeta::reference(UidType::Tagv, "000001"))],
        );
        let err = store.write(CatalogRecord::TsMeta(series), WriteOptions::catalog()).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidRecord(_)));
        assert_eq!(store.count(CatalogTable::TsMeta).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rename_cascades_without_requeueing_dependents() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(dir.path()).await;
        let series = seed_series(&store).await;
        let queued_before = queue_rows(&store).await.len();

        let out = store.write(tagk("000001", "hostname"), WriteOptions::catalog()).await.unwrap();
        assert_eq!(out.rename.as_ref().map(|r| r.old_name.as_str()), Some("host"));
        assert_eq!(out.cascade.tag_pairs, vec!["000001000001".to_string()]);
        assert_eq!(out.cascade.tsuids, vec![series.tsuid.clone()]);

        assert_eq!(
            store.tag_pair_name("000001", "000001").await.unwrap().as_deref(),
            Some("hostname=web01")
        );
        let after = store.get_tsmeta(&series.tsuid).await.unwrap().unwrap();
        assert_eq!(after.fqn, "sys.cpu:hostname=web01,dc=lon");
        assert_eq!(after.version, series.version);
        assert_eq!(after.last_update, series.last_update);

        let queue = queue_rows(&store).await;
        assert_eq!(queue.len(), queued_before + 1);
        assert_eq!(queue.last().map(|q| q.0.as_str()), Some("TSD_TAGK"));
    }

    #[tokio::test]
    async fn test_metric_rename_rewrites_fqn() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(dir.path()).await;
        let series = seed_series(&store).await;

        store
            .write(
                CatalogRecord::Uid(UidMeta::new(UidType::Metric, "000001", "sys.cpu.user")),
                WriteOptions::propagation(),
            )
            .await
            .unwrap();
        let after = store.get_tsmeta(&series.tsuid).await.unwrap().unwrap();
        assert_eq!(after.fqn, "sys.cpu.user:host=web01,dc=lon");
    }

    #[tokio::test]
    async fn test_delete_queues_with_object_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(dir.path()).await;
        let series = seed_series(&store).await;

        let removed = store
            .delete(CatalogTable::TsMeta, &series.tsuid, WriteOptions::catalog())
            .await
            .unwrap();
        assert!(removed.is_some());
        assert!(store.get_tsmeta(&series.tsuid).await.unwrap().is_none());

        let last = queue_rows(&store).await.pop().unwrap();
        assert_eq!(last.0, "TSD_TSMETA");
        assert_eq!(last.1, series.fqnid.unwrap().to_string());
        assert_eq!(last.2, series.tsuid);
        assert_eq!(last.3, "D");

        let missing = store.delete(CatalogTable::TsMeta, &series.tsuid, WriteOptions::catalog()).await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_annotations_global_and_attached() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(dir.path()).await;
        let series = seed_series(&store).await;

        let global = Annotation::new(None, 1_000, "deploy");
        let attached = Annotation::new(Some(series.tsuid.clone()), 1_000, "restart");
        store.write(CatalogRecord::Annotation(global), WriteOptions::catalog()).await.unwrap();
        let out = store.write(CatalogRecord::Annotation(attached), WriteOptions::catalog()).await.unwrap();
        assert_eq!(out.record.natural_key(), annotation_key(1_000, Some(&series.tsuid)));

        assert_eq!(store.get_annotation(1_000, None).await.unwrap().unwrap().description, "deploy");
        let read = store
            .read(CatalogTable::Annotation, &annotation_key(1_000, Some(&series.tsuid)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.pk(), out.record.pk());

        let orphan = Annotation::new(Some("0000AA".into()), 5, "nope");
        assert!(store.write(CatalogRecord::Annotation(orphan), WriteOptions::catalog()).await.is_err());
    }

    #[tokio::test]
    async fn test_scan_changed_respects_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(dir.path()).await;
        let first = store.write(tagk("000001", "host"), WriteOptions::catalog()).await.unwrap();
        store.write(tagk("000002", "dc"), WriteOptions::catalog()).await.unwrap();

        assert_eq!(store.scan_changed(CatalogTable::Tagk, 0).await.unwrap().len(), 2);
        let later = store.scan_changed(CatalogTable::Tagk, first.record.last_update()).await.unwrap();
        assert!(later.iter().all(|r| r.last_update() > first.record.last_update()));
    }

    #[tokio::test]
    async fn test_read_by_pk_per_table() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(dir.path()).await;
        let series = seed_series(&store).await;
        let pk = series.fqnid.unwrap().to_string();

        let by_pk = store.read_by_pk(CatalogTable::TsMeta, &pk).await.unwrap().unwrap();
        assert_eq!(by_pk.natural_key(), series.tsuid);
        assert!(store.read_by_pk(CatalogTable::TsMeta, "abc").await.is_err());
        assert!(store.read_by_pk(CatalogTable::Metric, "000001").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_resolve_tag_pairs_intersects_predicates() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(dir.path()).await;
        seed_series(&store).await;

        let exact = TagPredicateSet::parse([("host", "web01")]).unwrap();
        assert_eq!(store.resolve_tag_pairs(&exact).await.unwrap(), vec!["000001000001".to_string()]);

        let wildcard = TagPredicateSet::parse([("*", "web*|lon")]).unwrap();
        let mut hits = store.resolve_tag_pairs(&wildcard).await.unwrap();
        hits.sort();
        assert_eq!(hits, vec!["000001000001".to_string(), "000002000002".to_string()]);

        let disjoint = TagPredicateSet::parse([("host", "web01"), ("dc", "lon")]).unwrap();
        assert!(store.resolve_tag_pairs(&disjoint).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_purge_empties_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(dir.path()).await;
        seed_series(&store).await;

        store.purge().await.unwrap();
        for table in CatalogTable::WATCHED {
            assert_eq!(store.count(table).await.unwrap(), 0);
        }
        assert!(queue_rows(&store).await.is_empty());
    }

    #[tokio::test]
    async fn test_ids_come_from_sequences() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(dir.path()).await;
        seed_series(&store).await;

        let stats = store.sequence_stats();
        assert_eq!(stats.len(), 4);
        assert!(stats.iter().any(|s| s.name == QID_SEQ && s.current >= 6));
        assert!(stats.iter().any(|s| s.name == FQN_SEQ && s.current >= 1));
    }
}
