// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! UID -> definition cache, one [`DecodeCache`] per UID type.

use std::sync::Arc;
use tracing::{info, warn};
use crate::config::CacheConfig;
use crate::record::{TsMeta, UidMeta, UidType};
use crate::storage::traits::{CatalogLookup, StorageError};
use super::decode_cache::{CacheStats, DecodeCache};

/// Reverse lookups from UID to name for metrics, tag keys and tag values.
///
/// Lookup failures are logged and reported as absent.
pub struct UidCache {
    metric: DecodeCache<String, UidMeta>,
    tagk: DecodeCache<String, UidMeta>,
    tagv: DecodeCache<String, UidMeta>,
    lookup: Arc<dyn CatalogLookup>,
    seed_limit: usize,
}

impl UidCache {
    pub fn new(lookup: Arc<dyn CatalogLookup>, config: &CacheConfig) -> Self {
        Self {
            metric: DecodeCache::new("uid_metric", config),
            tagk: DecodeCache::new("uid_tagk", config),
            tagv: DecodeCache::new("uid_tagv", config),
            lookup,
            seed_limit: config.max_size,
        }
    }

    fn cache(&self, uid_type: UidType) -> &DecodeCache<String, UidMeta> {
        match uid_type {
            UidType::Metric => &self.metric,
            UidType::Tagk => &self.tagk,
            UidType::Tagv => &self.tagv,
        }
    }

    /// Pre-load up to `max_size` definitions of each type.
    pub async fn seed(&self) -> Result<usize, StorageError> {
        let mut total = 0;
        for uid_type in UidType::ALL {
            let rows = self.lookup.scan_uids(uid_type, self.seed_limit).await?;
            total += self
                .cache(uid_type)
                .seed(rows.into_iter().map(|m| (m.uid.clone(), m)));
        }
        info!(entries = total, "UID caches seeded");
        Ok(total)
    }

    pub async fn get(&self, uid_type: UidType, uid: &str) -> Option<UidMeta> {
        let key = uid.to_ascii_uppercase();
        let lookup = self.lookup.clone();
        let load_key = key.clone();
        let result = self
            .cache(uid_type)
            .get_with(&key, || async move { lookup.load_uid(uid_type, &load_key).await })
            .await;
        match result {
            Ok(meta) => meta,
            Err(e) => {
                warn!(uid_type = %uid_type, uid = %uid, error = %e, "UID lookup failed");
                None
            }
        }
    }

    pub async fn name(&self, uid_type: UidType, uid: &str) -> Option<String> {
        self.get(uid_type, uid).await.map(|m| m.name)
    }

    pub fn put(&self, meta: UidMeta) {
        self.cache(meta.uid_type).put(meta.uid.clone(), meta);
    }

    pub fn invalidate(&self, uid_type: UidType, uid: &str) {
        self.cache(uid_type).invalidate(&uid.to_ascii_uppercase());
    }

    pub fn invalidate_all(&self) {
        for uid_type in UidType::ALL {
            self.cache(uid_type).invalidate_all();
        }
    }

    /// Replace uid-only references inside a TSMeta with cached definitions.
    /// Unknown UIDs stay as references.
    pub async fn hydrate(&self, mut meta: TsMeta) -> TsMeta {
        if let Some(full) = self.get(UidType::Metric, &meta.metric.uid).await {
            meta.metric = full;
        }
        for tag in meta.tags.iter_mut() {
            if let Some(full) = self.get(tag.uid_type, &tag.uid).await {
                *tag = full;
            }
        }
        if meta.fqn.is_empty() {
            meta.fqn = meta.compute_fqn();
        }
        meta
    }

    #[must_use]
    pub fn stats(&self) -> Vec<CacheStats> {
        UidType::ALL.iter().map(|t| self.cache(*t).stats()).collect()
    }

    pub fn export_metrics(&self) {
        for uid_type in UidType::ALL {
            self.cache(uid_type).export_metrics();
        }
    }
}
