// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable sequence primitives backing [`super::SequenceAllocator`].
//!
//! - [`NativeSequence`]: a database sequence object (`NEXTVAL`)
//! - [`CounterTableSequence`]: a single-row `<NAME>_TAB_` counter table,
//!   for catalogs without native sequences (SQLite, MySQL)
//!
//! Both step by the allocator increment, so every returned value is the
//! ceiling of a disjoint range `(value - increment, value]`.

use async_trait::async_trait;
use sqlx::{AnyPool, Row};
use tracing::debug;
use crate::storage::traits::StorageError;

#[async_trait]
pub trait SequenceSource: Send + Sync {
    fn name(&self) -> &str;

    /// Advance the durable sequence one step and return its new value.
    async fn next_value(&self) -> Result<i64, StorageError>;
}

/// Sequence names end up in DDL, so only identifier characters are allowed.
pub(crate) fn validate_name(name: &str) -> Result<(), StorageError> {
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(StorageError::Sequence(format!("invalid sequence name '{}'", name)))
    }
}

// =============================================================================
// Native sequence
// =============================================================================

pub struct NativeSequence {
    pool: AnyPool,
    name: String,
    increment: i64,
}

impl NativeSequence {
    /// Create the sequence if missing. Requires a catalog with
    /// `CREATE SEQUENCE` support (MariaDB 10.3+).
    pub async fn create(pool: AnyPool, name: &str, increment: i64) -> Result<Self, StorageError> {
        validate_name(name)?;
        let ddl = format!(
            "CREATE SEQUENCE IF NOT EXISTS {} START WITH {} INCREMENT BY {}",
            name, increment, increment
        );
        sqlx::query(&ddl)
            .execute(&pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(Self {
            pool,
            name: name.to_string(),
            increment,
        })
    }

    #[must_use]
    pub fn increment(&self) -> i64 {
        self.increment
    }
}

#[async_trait]
impl SequenceSource for NativeSequence {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next_value(&self) -> Result<i64, StorageError> {
        let sql = format!("SELECT NEXTVAL({})", self.name);
        let row = sqlx::query(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.try_get::<i64, _>(0)
            .map_err(|e| StorageError::Sequence(format!("{}: {}", self.name, e)))
    }
}

// =============================================================================
// Counter table sequence
// =============================================================================

pub struct CounterTableSequence {
    pool: AnyPool,
    name: String,
    table: String,
    increment: i64,
}

impl CounterTableSequence {
    /// Create `<name>_TAB_` with its single row if missing.
    pub async fn create(
        pool: AnyPool,
        is_sqlite: bool,
        name: &str,
        increment: i64,
    ) -> Result<Self, StorageError> {
        validate_name(name)?;
        let table = format!("{}_TAB_", name);

        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (S INTEGER NOT NULL PRIMARY KEY, Q BIGINT NOT NULL)",
            table
        );
        sqlx::query(&ddl)
            .execute(&pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let seed = if is_sqlite {
            format!("INSERT OR IGNORE INTO {} (S, Q) VALUES (1, 0)", table)
        } else {
            format!("INSERT IGNORE INTO {} (S, Q) VALUES (1, 0)", table)
        };
        sqlx::query(&seed)
            .execute(&pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        debug!(sequence = %name, table = %table, "Counter table sequence ready");
        Ok(Self {
            pool,
            name: name.to_string(),
            table,
            increment,
        })
    }
}

#[async_trait]
impl SequenceSource for CounterTableSequence {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next_value(&self) -> Result<i64, StorageError> {
        // Write first so the row lock is taken before the read
        let mut tx = self.pool.begin().await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let bump = format!("UPDATE {} SET Q = Q + ? WHERE S = 1", self.table);
        let updated = sqlx::query(&bump)
            .bind(self.increment)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        if updated.rows_affected() != 1 {
            return Err(StorageError::Sequence(format!(
                "counter row missing from {}", self.table
            )));
        }

        let read = format!("SELECT Q FROM {} WHERE S = 1", self.table);
        let row = sqlx::query(&read)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let value: i64 = row.try_get("Q")
            .map_err(|e| StorageError::Sequence(format!("{}: {}", self.name, e)))?;

        tx.commit().await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sql::connect_pool;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("FQN_SEQ").is_ok());
        assert!(validate_name("qid_seq2").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("1SEQ").is_err());
        assert!(validate_name("SEQ; DROP TABLE X").is_err());
    }

    #[tokio::test]
    async fn test_counter_table_steps_by_increment() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("seq.db").display());
        let pool = connect_pool(&url, 2).await.unwrap();

        let seq = CounterTableSequence::create(pool.clone(), true, "TEST_SEQ", 10).await.unwrap();
        assert_eq!(seq.next_value().await.unwrap(), 10);
        assert_eq!(seq.next_value().await.unwrap(), 20);

        // Re-creating keeps the persisted counter
        let again = CounterTableSequence::create(pool, true, "TEST_SEQ", 10).await.unwrap();
        assert_eq!(again.next_value().await.unwrap(), 30);
    }
}
