// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use crate::record::{Annotation, CatalogRecord, CatalogTable, Propagation, TsMeta, UidMeta, UidType};
use super::traits::{MetaCell, PrimaryStore, StorageError};

/// Qualifier of the metadata cell of a time series row.
pub const META_QUALIFIER: &str = "ts_meta";
/// Qualifier of the datapoint counter cell of a time series row.
pub const COUNTER_QUALIFIER: &str = "ts_ctr";

/// Primary store held entirely in memory.
///
/// UID definitions and annotations live in DashMaps; time-series metadata
/// lives in an ordered map keyed by raw TSUID bytes so the metadata region
/// can be scanned in key order.
pub struct InMemoryPrimaryStore {
    uids: DashMap<(UidType, String), UidMeta>,
    annotations: DashMap<String, Annotation>,
    meta: RwLock<BTreeMap<Vec<u8>, TsMeta>>,
    propagations: AtomicU64,
}

impl InMemoryPrimaryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            uids: DashMap::new(),
            annotations: DashMap::new(),
            meta: RwLock::new(BTreeMap::new()),
            propagations: AtomicU64::new(0),
        }
    }

    /// Seed a time series directly (as if written by the ingest path).
    pub fn insert_tsmeta(&self, meta: TsMeta) -> Result<(), StorageError> {
        let key = row_key(&meta.tsuid)?;
        for uid in std::iter::once(&meta.metric).chain(meta.tags.iter()) {
            self.uids
                .entry((uid.uid_type, uid.uid.clone()))
                .or_insert_with(|| uid.clone());
        }
        self.meta.write().insert(key, meta);
        Ok(())
    }

    #[must_use]
    pub fn get_uid(&self, uid_type: UidType, uid: &str) -> Option<UidMeta> {
        self.uids
            .get(&(uid_type, uid.to_ascii_uppercase()))
            .map(|r| r.value().clone())
    }

    #[must_use]
    pub fn get_tsmeta(&self, tsuid: &str) -> Option<TsMeta> {
        let key = row_key(tsuid).ok()?;
        self.meta.read().get(&key).cloned()
    }

    #[must_use]
    pub fn get_annotation(&self, key: &str) -> Option<Annotation> {
        self.annotations.get(key).map(|r| r.value().clone())
    }

    /// Number of successful `propagate` calls
    #[must_use]
    pub fn propagation_count(&self) -> u64 {
        self.propagations.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn uid_count(&self) -> usize {
        self.uids.len()
    }

    #[must_use]
    pub fn tsmeta_count(&self) -> usize {
        self.meta.read().len()
    }

    #[must_use]
    pub fn annotation_count(&self) -> usize {
        self.annotations.len()
    }

    /// Clear all items
    pub fn clear(&self) {
        self.uids.clear();
        self.annotations.clear();
        self.meta.write().clear();
    }
}

impl Default for InMemoryPrimaryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn row_key(tsuid: &str) -> Result<Vec<u8>, StorageError> {
    hex::decode(tsuid)
        .map_err(|e| StorageError::InvalidRecord(format!("TSUID '{}' is not hex: {}", tsuid, e)))
}

#[async_trait]
impl PrimaryStore for InMemoryPrimaryStore {
    async fn propagate(&self, change: &Propagation) -> Result<(), StorageError> {
        match change {
            Propagation::Upsert(CatalogRecord::Uid(uid)) => {
                self.uids.insert((uid.uid_type, uid.uid.clone()), uid.clone());
            }
            Propagation::Upsert(CatalogRecord::TsMeta(meta)) => {
                let key = row_key(&meta.tsuid)?;
                self.meta.write().insert(key, meta.clone());
            }
            Propagation::Upsert(CatalogRecord::Annotation(ann)) => {
                self.annotations.insert(ann.natural_key(), ann.clone());
            }
            Propagation::Delete { table, key } => match table.uid_type() {
                Some(uid_type) => {
                    self.uids.remove(&(uid_type, key.clone()));
                }
                None if *table == CatalogTable::TsMeta => {
                    let key = row_key(key)?;
                    self.meta.write().remove(&key);
                }
                None => {
                    self.annotations.remove(key);
                }
            },
        }
        self.propagations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn scan_meta(
        &self,
        after: Option<&MetaCell>,
        limit: usize,
    ) -> Result<Vec<MetaCell>, StorageError> {
        let meta = self.meta.read();
        let cells = meta
            .keys()
            .flat_map(|key| {
                [
                    MetaCell::new(key.clone(), COUNTER_QUALIFIER),
                    MetaCell::new(key.clone(), META_QUALIFIER),
                ]
            })
            .filter(|cell| after.map_or(true, |a| cell > a))
            .take(limit)
            .collect();
        Ok(cells)
    }

    async fn fetch_tsmeta(&self, tsuid: &str) -> Result<Option<TsMeta>, StorageError> {
        Ok(self.get_tsmeta(tsuid))
    }
}
