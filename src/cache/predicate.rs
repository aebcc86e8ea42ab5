// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tag predicate resolution: `{tagk expr: tagv expr}` -> matching tag pair UIDs.
//!
//! An expression is a `|`-separated list of segments; `*` is a wildcard.
//! Spaces are ignored. Each segment compiles to `NAME = ?` or, when it
//! contains a wildcard, `NAME LIKE ?`; segments are OR'ed together.
//!
//! | Expression | SQL |
//! |------------|-----|
//! | `web01` | `(K.NAME = ?)` |
//! | `web*` | `(K.NAME LIKE ?)` bound to `web%` |
//! | `web01 \| db*` | `(K.NAME LIKE ? OR K.NAME = ?)` (segments sorted) |
//!
//! Each `(tagk, tagv)` predicate becomes one `SELECT DISTINCT P.XUID ...`
//! over the tag pair table; the predicates of a set are combined with
//! `INTERSECT`.
//!
//! # Example
//!
//! ```
//! use catalog_sync::cache::TagPredicateSet;
//!
//! let a = TagPredicateSet::parse([("host", "web*"), ("dc", "east | west")]).unwrap();
//! let b = TagPredicateSet::parse([("dc", "west|east"), ("host", "web *")]).unwrap();
//! assert_eq!(a.key(), b.key());
//! assert_eq!(a.binds(), vec!["dc", "east", "west", "host", "web%"]);
//! ```

use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;
use crate::config::CacheConfig;
use crate::storage::traits::{CatalogLookup, StorageError};
use super::decode_cache::{CacheStats, DecodeCache};

const TAG_PAIR_SUBQUERY: &str = "SELECT DISTINCT P.XUID FROM TSD_TAGPAIR P, TSD_TAGK K, TSD_TAGV V \
     WHERE P.TAGK = K.XUID AND P.TAGV = V.XUID";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Segment {
    pattern: String,
    wildcard: bool,
}

/// One expanded match expression.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct MatchExpr {
    segments: Vec<Segment>,
}

impl MatchExpr {
    pub fn parse(expr: &str) -> Result<Self, StorageError> {
        let compact: String = expr.chars().filter(|c| !c.is_whitespace()).collect();
        let mut segments: Vec<Segment> = compact
            .split('|')
            .filter(|s| !s.is_empty())
            .map(|s| {
                let pattern = s.replace('*', "%");
                let wildcard = pattern.contains('%');
                Segment { pattern, wildcard }
            })
            .collect();
        if segments.is_empty() {
            return Err(StorageError::Predicate(format!(
                "expression '{}' has no segments",
                expr
            )));
        }
        segments.sort();
        segments.dedup();
        Ok(Self { segments })
    }

    fn clause(&self, column: &str) -> String {
        let parts: Vec<String> = self
            .segments
            .iter()
            .map(|s| {
                let op = if s.wildcard { "LIKE" } else { "=" };
                format!("{} {} ?", column, op)
            })
            .collect();
        format!("({})", parts.join(" OR "))
    }

    fn normalized(&self) -> String {
        self.segments
            .iter()
            .map(|s| s.pattern.as_str())
            .collect::<Vec<_>>()
            .join("|")
    }
}

/// A `(tagk, tagv)` match pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TagPredicate {
    pub tagk: MatchExpr,
    pub tagv: MatchExpr,
}

/// A normalized, hashable set of tag predicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagPredicateSet {
    predicates: Vec<TagPredicate>,
    normalized: String,
    key: u64,
}

impl TagPredicateSet {
    pub fn parse<I, K, V>(pairs: I) -> Result<Self, StorageError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut predicates = pairs
            .into_iter()
            .map(|(k, v)| {
                Ok(TagPredicate {
                    tagk: MatchExpr::parse(k.as_ref())?,
                    tagv: MatchExpr::parse(v.as_ref())?,
                })
            })
            .collect::<Result<Vec<_>, StorageError>>()?;
        if predicates.is_empty() {
            return Err(StorageError::Predicate("empty predicate set".into()));
        }
        predicates.sort();
        predicates.dedup();

        let normalized = predicates
            .iter()
            .map(|p| format!("{}={}", p.tagk.normalized(), p.tagv.normalized()))
            .collect::<Vec<_>>()
            .join(",");
        let digest = Sha256::digest(normalized.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        let key = u64::from_be_bytes(head);

        Ok(Self {
            predicates,
            normalized,
            key,
        })
    }

    /// Stable cache key of the normalized set.
    #[must_use]
    pub fn key(&self) -> u64 {
        self.key
    }

    #[must_use]
    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Parameterized INTERSECT query.
    #[must_use]
    pub fn sql(&self) -> String {
        self.predicates
            .iter()
            .map(|p| {
                format!(
                    "{} AND ({} AND {})",
                    TAG_PAIR_SUBQUERY,
                    p.tagk.clause("K.NAME"),
                    p.tagv.clause("V.NAME")
                )
            })
            .collect::<Vec<_>>()
            .join(" INTERSECT ")
    }

    /// Bind values in placeholder order.
    #[must_use]
    pub fn binds(&self) -> Vec<String> {
        self.predicates
            .iter()
            .flat_map(|p| p.tagk.segments.iter().chain(p.tagv.segments.iter()))
            .map(|s| s.pattern.clone())
            .collect()
    }

    /// The query with bind values inlined, for logging only.
    #[must_use]
    pub fn render_sql(&self) -> String {
        let mut rendered = String::new();
        let mut binds = self.binds().into_iter();
        for ch in self.sql().chars() {
            if ch == '?' {
                match binds.next() {
                    Some(b) => {
                        rendered.push('\'');
                        rendered.push_str(&b.replace('\'', "''"));
                        rendered.push('\'');
                    }
                    None => rendered.push(ch),
                }
            } else {
                rendered.push(ch);
            }
        }
        rendered
    }
}

/// Tag predicate set -> sorted tag pair UIDs.
///
/// Load errors propagate: there is no safe empty answer for a query.
pub struct TagPredicateCache {
    cache: DecodeCache<u64, Vec<String>>,
    lookup: Arc<dyn CatalogLookup>,
}

impl TagPredicateCache {
    pub fn new(lookup: Arc<dyn CatalogLookup>, config: &CacheConfig) -> Self {
        Self {
            cache: DecodeCache::new("tag_predicate", config),
            lookup,
        }
    }

    /// Resolve `(tagk expr, tagv expr)` pairs.
    pub async fn resolve<I, K, V>(&self, pairs: I) -> Result<Vec<String>, StorageError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let set = TagPredicateSet::parse(pairs)?;
        self.resolve_set(&set).await
    }

    pub async fn resolve_set(&self, set: &TagPredicateSet) -> Result<Vec<String>, StorageError> {
        let lookup = self.lookup.clone();
        let resolved = self
            .cache
            .get_with(&set.key(), || async move {
                debug!(sql = %set.render_sql(), "Resolving tag predicates");
                let mut uids = lookup.resolve_tag_pairs(set).await?;
                uids.sort();
                Ok(Some(uids))
            })
            .await?;
        Ok(resolved.unwrap_or_default())
    }

    pub fn put(&self, set: &TagPredicateSet, uids: Vec<String>) {
        self.cache.put(set.key(), uids);
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_and_wildcard_segments() {
        let set = TagPredicateSet::parse([("host", "web01|db*")]).unwrap();
        assert_eq!(
            set.sql(),
            format!("{} AND ((K.NAME = ?) AND (V.NAME LIKE ? OR V.NAME = ?))", TAG_PAIR_SUBQUERY)
        );
        assert_eq!(set.binds(), vec!["host", "db%", "web01"]);
    }

    #[test]
    fn test_spaces_are_stripped() {
        let a = TagPredicateSet::parse([(" host ", " web 01 ")]).unwrap();
        let b = TagPredicateSet::parse([("host", "web01")]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.normalized(), "host=web01");
    }

    #[test]
    fn test_empty_expression_rejected() {
        assert!(matches!(
            TagPredicateSet::parse([("host", " | ")]),
            Err(StorageError::Predicate(_))
        ));
        assert!(matches!(
            TagPredicateSet::parse(Vec::<(&str, &str)>::new()),
            Err(StorageError::Predicate(_))
        ));
    }

    #[test]
    fn test_multiple_predicates_intersect() {
        let set = TagPredicateSet::parse([("host", "*"), ("h*", "web01")]).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.sql().matches(" INTERSECT ").count(), 1);
        assert_eq!(set.sql().matches('?').count(), set.binds().len());
    }

    #[test]
    fn test_key_is_order_independent() {
        let a = TagPredicateSet::parse([("a", "1|2"), ("b", "3")]).unwrap();
        let b = TagPredicateSet::parse([("b", "3"), ("a", "2|1")]).unwrap();
        let c = TagPredicateSet::parse([("a", "1"), ("b", "3")]).unwrap();
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn test_render_sql_inlines_quoted_binds() {
        let set = TagPredicateSet::parse([("owner", "o'brien")]).unwrap();
        let rendered = set.render_sql();
        assert!(rendered.contains("K.NAME = 'owner'"));
        assert!(rendered.contains("V.NAME = 'o''brien'"));
        assert!(!rendered.contains('?'));
    }

    #[tokio::test]
    async fn test_cache_resolves_once_per_normalized_set() {
        use super::super::testing::MockLookup;
        use std::sync::atomic::Ordering;

        let lookup = Arc::new(MockLookup::new());
        *lookup.pairs.lock() = vec!["000002000001".into(), "000001000001".into()];
        let cache = TagPredicateCache::new(lookup.clone(), &CacheConfig::predicate());

        let first = cache.resolve([("host", "web*")]).await.unwrap();
        assert_eq!(first, vec!["000001000001", "000002000001"]);
        let again = cache.resolve([("host ", "web *")]).await.unwrap();
        assert_eq!(again, first);
        assert_eq!(lookup.predicate_loads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_cache_propagates_load_errors() {
        use super::super::testing::MockLookup;
        use std::sync::atomic::Ordering;

        let lookup = Arc::new(MockLookup::new());
        lookup.fail.store(true, Ordering::SeqCst);
        let cache = TagPredicateCache::new(lookup, &CacheConfig::predicate());

        let err = cache.resolve([("host", "web01")]).await.unwrap_err();
        assert!(matches!(err, StorageError::Backend(_)));
        assert!(matches!(
            cache.resolve([("host", "")]).await,
            Err(StorageError::Predicate(_))
        ));
    }
}
