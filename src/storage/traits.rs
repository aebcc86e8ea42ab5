// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use crate::cache::predicate::TagPredicateSet;
use crate::record::{Propagation, TsMeta, UidMeta, UidType};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("Item not found")]
    NotFound,
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Operation timed out: {0}")]
    Timeout(String),
    #[error("Invalid record: {0}")]
    InvalidRecord(String),
    #[error("Change capture rejected write: {0}")]
    Trigger(String),
    #[error("Sequence allocation failed: {0}")]
    Sequence(String),
    #[error("Invalid tag predicate: {0}")]
    Predicate(String),
}

/// One cell of the primary store's metadata region.
///
/// A time series can own several cells (metadata, counter), so scans see
/// the same TSUID more than once.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MetaCell {
    pub row_key: Vec<u8>,
    pub qualifier: String,
}

impl MetaCell {
    pub fn new(row_key: Vec<u8>, qualifier: impl Into<String>) -> Self {
        Self {
            row_key,
            qualifier: qualifier.into(),
        }
    }

    /// TSUID as upper-case hex of the row key.
    #[must_use]
    pub fn tsuid(&self) -> String {
        hex::encode_upper(&self.row_key)
    }
}

/// The authoritative time-series store the catalog mirrors.
#[async_trait]
pub trait PrimaryStore: Send + Sync {
    /// Idempotently apply one catalog change.
    async fn propagate(&self, change: &Propagation) -> Result<(), StorageError>;

    /// Scan the metadata region in key order, strictly after `after`.
    /// Returns an empty vec once the region is exhausted.
    async fn scan_meta(
        &self,
        after: Option<&MetaCell>,
        limit: usize,
    ) -> Result<Vec<MetaCell>, StorageError>;

    /// Fetch fully resolved metadata for one time series.
    async fn fetch_tsmeta(&self, tsuid: &str) -> Result<Option<TsMeta>, StorageError>;
}

/// Read paths of the relational catalog used by the decode caches.
#[async_trait]
pub trait CatalogLookup: Send + Sync {
    async fn load_uid(&self, uid_type: UidType, uid: &str) -> Result<Option<UidMeta>, StorageError>;

    /// Up to `limit` UID definitions, for cache pre-seeding.
    async fn scan_uids(&self, uid_type: UidType, limit: usize) -> Result<Vec<UidMeta>, StorageError>;

    /// Time-series metadata; metric and tag references carry uid and name only.
    async fn load_tsmeta(&self, tsuid: &str) -> Result<Option<TsMeta>, StorageError>;

    /// Up to `limit` time-series metadata rows, for cache pre-seeding.
    async fn scan_tsmeta(&self, limit: usize) -> Result<Vec<TsMeta>, StorageError>;

    /// Tag pair UIDs matching every predicate of the set.
    async fn resolve_tag_pairs(&self, predicates: &TagPredicateSet) -> Result<Vec<String>, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_cell_tsuid_is_upper_hex() {
        let cell = MetaCell::new(vec![0x00, 0x00, 0x01, 0xab], "ts_meta");
        assert_eq!(cell.tsuid(), "000001AB");
    }

    #[test]
    fn test_meta_cells_order_by_key_then_qualifier() {
        let a = MetaCell::new(vec![1], "ts_ctr");
        let b = MetaCell::new(vec![1], "ts_meta");
        let c = MetaCell::new(vec![2], "ts_ctr");
        assert!(a < b);
        assert!(b < c);
    }
}
