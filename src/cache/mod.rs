// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Decode caches over the relational catalog.
//!
//! | Cache | Key | Value | Load error |
//! |-------|-----|-------|------------|
//! | [`UidCache`] | UID (per type) | [`crate::record::UidMeta`] | logged, `None` |
//! | [`TsMetaCache`] | TSUID | decoded [`crate::record::TsMeta`] | logged, `None` |
//! | [`TagPredicateCache`] | hash of normalized predicates | tag pair UIDs | returned |
//!
//! All three share [`DecodeCache`]: bounded, recency evicted, single-flight
//! loads, optional hit/miss/eviction statistics.

pub mod decode_cache;
pub mod predicate;
pub mod tsmeta;
pub mod uid;

pub use decode_cache::{CacheStats, DecodeCache};
pub use predicate::{MatchExpr, TagPredicate, TagPredicateCache, TagPredicateSet};
pub use tsmeta::TsMetaCache;
pub use uid::UidCache;
