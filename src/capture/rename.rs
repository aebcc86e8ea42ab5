// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Denormalized name maintenance after a UID rename.
//!
//! A UID name appears in two derived places: `TSD_TAGPAIR.NAME` (`k=v`) and
//! `TSD_TSMETA.FQN` (`metric:k1=v1,...`). Both are re-derived by joining back
//! through `TSD_TAGPAIR` / `TSD_FQN_TAGPAIR` on the same transaction as the
//! rename. Dependent rows are not versioned and not queued; the primary
//! store addresses them by UID, so only the renamed UID itself propagates.

use sqlx::{AnyConnection, Row};
use std::time::Instant;
use tracing::debug;
use crate::metrics;
use crate::record::{fqn, tag_pair_name, UidType};
use crate::storage::sql::text;
use crate::storage::traits::StorageError;

/// A UID whose `NAME` changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UidRename {
    pub uid_type: UidType,
    pub uid: String,
    pub old_name: String,
    pub new_name: String,
}

/// Rows re-derived by a cascade.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CascadeReport {
    /// Tag pair UIDs whose `NAME` was rewritten
    pub tag_pairs: Vec<String>,
    /// TSUIDs whose `FQN` was rewritten
    pub tsuids: Vec<String>,
}

impl CascadeReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tag_pairs.is_empty() && self.tsuids.is_empty()
    }
}

fn backend(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

pub struct RenameCascade;

impl RenameCascade {
    /// Re-derive every name that embeds `rename.uid`.
    pub async fn apply(
        conn: &mut AnyConnection,
        rename: &UidRename,
        now: i64,
    ) -> Result<CascadeReport, StorageError> {
        let start = Instant::now();
        let mut report = CascadeReport::default();

        // Metrics only appear in FQNs
        let pair_column = match rename.uid_type {
            UidType::Metric => None,
            UidType::Tagk => Some("TAGK"),
            UidType::Tagv => Some("TAGV"),
        };

        if let Some(column) = pair_column {
            let sql = format!(
                "SELECT P.XUID, K.NAME AS KNAME, V.NAME AS VNAME FROM TSD_TAGPAIR P \
                 JOIN TSD_TAGK K ON K.XUID = P.TAGK \
                 JOIN TSD_TAGV V ON V.XUID = P.TAGV \
                 WHERE P.{} = ? ORDER BY P.XUID",
                column
            );
            let rows = sqlx::query(&sql)
                .bind(&rename.uid)
                .fetch_all(&mut *conn)
                .await
                .map_err(backend)?;

            for row in rows {
                let xuid = text(&row, "XUID").unwrap_or_default();
                let name = tag_pair_name(
                    &text(&row, "KNAME").unwrap_or_default(),
                    &text(&row, "VNAME").unwrap_or_default(),
                );
                sqlx::query("UPDATE TSD_TAGPAIR SET NAME = ?, LAST_UPDATE = ? WHERE XUID = ?")
                    .bind(&name)
                    .bind(now)
                    .bind(&xuid)
                    .execute(&mut *conn)
                    .await
                    .map_err(backend)?;
                report.tag_pairs.push(xuid);
            }
        }

        let affected_sql = match pair_column {
            None => "SELECT FQNID, TSUID FROM TSD_TSMETA WHERE METRIC_UID = ? ORDER BY FQNID".to_string(),
            Some(column) => format!(
                "SELECT DISTINCT T.FQNID, T.TSUID FROM TSD_TSMETA T \
                 JOIN TSD_FQN_TAGPAIR F ON F.FQNID = T.FQNID \
                 JOIN TSD_TAGPAIR P ON P.XUID = F.XUID \
                 WHERE P.{} = ? ORDER BY T.FQNID",
                column
            ),
        };
        let affected = sqlx::query(&affected_sql)
            .bind(&rename.uid)
            .fetch_all(&mut *conn)
            .await
            .map_err(backend)?;

        for row in affected {
            let fqnid: i64 = row.try_get("FQNID").map_err(backend)?;
            if let Some(name) = derive_fqn(conn, fqnid).await? {
                // Denormalization only: LAST_UPDATE and VERSION stay put
                sqlx::query("UPDATE TSD_TSMETA SET FQN = ? WHERE FQNID = ?")
                    .bind(&name)
                    .bind(fqnid)
                    .execute(&mut *conn)
                    .await
                    .map_err(backend)?;
            }
            report.tsuids.push(text(&row, "TSUID").unwrap_or_default());
        }

        debug!(
            uid_type = %rename.uid_type,
            uid = %rename.uid,
            from = %rename.old_name,
            to = %rename.new_name,
            tag_pairs = report.tag_pairs.len(),
            tsmetas = report.tsuids.len(),
            "Rename cascaded"
        );
        metrics::record_rename_cascade(
            rename.uid_type.as_str(),
            report.tag_pairs.len() as u64,
            report.tsuids.len() as u64,
        );
        metrics::record_trigger_latency("rename_cascade", start.elapsed());
        Ok(report)
    }
}

/// FQN of `fqnid` from the current metric and tag pair names, in pair order.
pub async fn derive_fqn(conn: &mut AnyConnection, fqnid: i64) -> Result<Option<String>, StorageError> {
    let metric = sqlx::query(
        "SELECT M.NAME FROM TSD_TSMETA T JOIN TSD_METRIC M ON M.XUID = T.METRIC_UID WHERE T.FQNID = ?",
    )
    .bind(fqnid)
    .fetch_optional(&mut *conn)
    .await
    .map_err(backend)?;
    let Some(metric) = metric else {
        return Ok(None);
    };
    let metric_name = text(&metric, "NAME").unwrap_or_default();

    let pairs = sqlx::query(
        "SELECT P.NAME FROM TSD_FQN_TAGPAIR F JOIN TSD_TAGPAIR P ON P.XUID = F.XUID \
         WHERE F.FQNID = ? ORDER BY F.PORDER",
    )
    .bind(fqnid)
    .fetch_all(&mut *conn)
    .await
    .map_err(backend)?;
    let names: Vec<String> = pairs
        .iter()
        .map(|r| text(r, "NAME").unwrap_or_default())
        .collect();

    Ok(Some(fqn(&metric_name, &names)))
}
