// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! TSUID -> fully decoded [`TsMeta`] cache.

use std::sync::Arc;
use tracing::{info, warn};
use crate::config::CacheConfig;
use crate::record::TsMeta;
use crate::storage::traits::{CatalogLookup, StorageError};
use super::decode_cache::{CacheStats, DecodeCache};
use super::uid::UidCache;

/// Lookup failures are logged and reported as absent.
pub struct TsMetaCache {
    cache: DecodeCache<String, TsMeta>,
    lookup: Arc<dyn CatalogLookup>,
    uids: Arc<UidCache>,
    seed_limit: usize,
}

impl TsMetaCache {
    pub fn new(lookup: Arc<dyn CatalogLookup>, uids: Arc<UidCache>, config: &CacheConfig) -> Self {
        Self {
            cache: DecodeCache::new("tsmeta", config),
            lookup,
            uids,
            seed_limit: config.max_size,
        }
    }

    /// Pre-load up to `max_size` rows.
    pub async fn seed(&self) -> Result<usize, StorageError> {
        let rows = self.lookup.scan_tsmeta(self.seed_limit).await?;
        let mut decoded = Vec::with_capacity(rows.len());
        for row in rows {
            decoded.push(self.uids.hydrate(row).await);
        }
        let n = self.cache.seed(decoded.into_iter().map(|m| (m.tsuid.clone(), m)));
        info!(entries = n, "TSMeta cache seeded");
        Ok(n)
    }

    pub async fn get(&self, tsuid: &str) -> Option<TsMeta> {
        let key = tsuid.to_ascii_uppercase();
        let load_key = key.clone();
        let lookup = self.lookup.clone();
        let uids = self.uids.clone();
        let result = self
            .cache
            .get_with(&key, || async move {
                match lookup.load_tsmeta(&load_key).await? {
                    Some(row) => Ok(Some(uids.hydrate(row).await)),
                    None => Ok(None),
                }
            })
            .await;
        match result {
            Ok(meta) => meta,
            Err(e) => {
                warn!(tsuid = %tsuid, error = %e, "TSMeta lookup failed");
                None
            }
        }
    }

    pub fn put(&self, meta: TsMeta) {
        self.cache.put(meta.tsuid.clone(), meta);
    }

    pub fn invalidate(&self, tsuid: &str) {
        self.cache.invalidate(&tsuid.to_ascii_uppercase());
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn export_metrics(&self) {
        self.cache.export_metrics();
    }
}
