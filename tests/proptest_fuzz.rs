//! Property-based tests (fuzzing) for catalog sync building blocks.
//!
//! Uses proptest to generate random and malformed inputs and verify the
//! crate never panics, only returns clean errors, and keeps its invariants.
//!
//! Run with: `cargo test --test proptest_fuzz`

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use async_trait::async_trait;
use proptest::prelude::*;

use catalog_sync::sequence::SequenceSource;
use catalog_sync::{
    CatalogRecord, SequenceAllocator, StorageError, TagPredicateSet, TsMeta, UidMeta, UidType,
};

// =============================================================================
// Strategies for generating test data
// =============================================================================

fn uid_strategy() -> impl Strategy<Value = String> {
    "[0-9A-F]{6}"
}

fn uid_type_strategy() -> impl Strategy<Value = UidType> {
    prop_oneof![Just(UidType::Metric), Just(UidType::Tagk), Just(UidType::Tagv)]
}

fn name_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9._-]{0,15}"
}

/// Tag match expressions: literals, wildcards, `|`-joined alternatives
fn expr_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-z0-9*]{1,6}", 1..4).prop_map(|parts| parts.join("|"))
}

fn uid_meta_strategy() -> impl Strategy<Value = UidMeta> {
    (uid_type_strategy(), uid_strategy(), name_strategy(), ".{0,20}").prop_map(
        |(uid_type, uid, name, description)| {
            let mut meta = UidMeta::new(uid_type, uid, name);
            meta.description = description;
            meta
        },
    )
}

// =============================================================================
// Tag predicates
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Predicate order and duplicates never change the cache key.
    #[test]
    fn predicate_key_ignores_order_and_duplicates(
        pairs in prop::collection::vec((expr_strategy(), expr_strategy()), 1..5)
    ) {
        let forward = TagPredicateSet::parse(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))).unwrap();

        let mut shuffled = pairs.clone();
        shuffled.reverse();
        shuffled.push(pairs[0].clone());
        let backward = TagPredicateSet::parse(shuffled.iter().map(|(k, v)| (k.as_str(), v.as_str()))).unwrap();

        prop_assert_eq!(forward.key(), backward.key());
        prop_assert_eq!(forward.normalized(), backward.normalized());
    }

    /// Alternatives inside one expression are order-insensitive too.
    #[test]
    fn predicate_alternatives_are_normalized(
        parts in prop::collection::vec("[a-z0-9]{1,6}", 2..5)
    ) {
        let forward = parts.join("|");
        let mut reversed = parts.clone();
        reversed.reverse();
        let backward = reversed.join(" | ");

        let a = TagPredicateSet::parse([("host", forward.as_str())]).unwrap();
        let b = TagPredicateSet::parse([("host", backward.as_str())]).unwrap();
        prop_assert_eq!(a.key(), b.key());
    }

    /// Placeholders and binds always line up.
    #[test]
    fn predicate_sql_binds_match_placeholders(
        pairs in prop::collection::vec((expr_strategy(), expr_strategy()), 1..4)
    ) {
        let set = TagPredicateSet::parse(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))).unwrap();
        let placeholders = set.sql().matches('?').count();
        prop_assert_eq!(placeholders, set.binds().len());
        prop_assert!(!set.render_sql().contains('?'));
    }

    /// Arbitrary input never panics; it parses or fails cleanly.
    #[test]
    fn predicate_parse_never_panics(k in ".{0,20}", v in ".{0,20}") {
        match TagPredicateSet::parse([(k.as_str(), v.as_str())]) {
            Ok(set) => prop_assert!(!set.is_empty()),
            Err(e) => prop_assert!(matches!(e, StorageError::Predicate(_))),
        }
    }
}

// =============================================================================
// Records
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Malformed JSON is rejected without panicking.
    #[test]
    fn record_json_never_panics(input in ".{0,200}") {
        let _ = serde_json::from_str::<CatalogRecord>(&input);
    }

    /// Bookkeeping fields never affect content equality.
    #[test]
    fn content_eq_ignores_bookkeeping(
        meta in uid_meta_strategy(),
        version in 0i64..1_000,
        created in 0i64..1_000_000,
        last_update in 0i64..1_000_000,
    ) {
        let a = CatalogRecord::Uid(meta.clone());
        let mut b = CatalogRecord::Uid(meta);
        b.set_version(version);
        b.set_timestamps(created, last_update);
        b.echo_pk();
        prop_assert!(a.content_eq(&b));
    }

    /// The TSUID is the metric UID followed by pairs sorted by tag key UID.
    #[test]
    fn tsuid_is_order_independent(
        metric in uid_strategy(),
        keys in prop::collection::hash_set(uid_strategy(), 1..5),
        value in uid_strategy(),
    ) {
        let pairs: Vec<(UidMeta, UidMeta)> = keys
            .iter()
            .map(|k| (UidMeta::reference(UidType::Tagk, k), UidMeta::reference(UidType::Tagv, &value)))
            .collect();
        let mut reversed = pairs.clone();
        reversed.reverse();

        let a = TsMeta::new(UidMeta::reference(UidType::Metric, &metric), pairs);
        let b = TsMeta::new(UidMeta::reference(UidType::Metric, &metric), reversed);
        prop_assert_eq!(&a.tsuid, &b.tsuid);
        prop_assert_eq!(a.tsuid.len(), 6 * (1 + 2 * keys.len()));
        prop_assert!(a.tsuid.starts_with(&metric));
    }
}

// =============================================================================
// Sequence allocation
// =============================================================================

struct CountingSequence {
    value: AtomicI64,
    step: i64,
}

#[async_trait]
impl SequenceSource for CountingSequence {
    fn name(&self) -> &str {
        "FUZZ_SEQ"
    }

    async fn next_value(&self) -> Result<i64, StorageError> {
        Ok(self.value.fetch_add(self.step, Ordering::SeqCst) + self.step)
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Concurrent callers never see the same id twice, for any increment.
    #[test]
    fn allocator_ids_are_unique(increment in 1i64..20, tasks in 2usize..8, per_task in 1usize..40) {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();
        let ids = rt.block_on(async {
            let source = Arc::new(CountingSequence { value: AtomicI64::new(0), step: increment });
            let allocator = Arc::new(SequenceAllocator::new(source, increment).unwrap());
            let mut handles = Vec::new();
            for _ in 0..tasks {
                let allocator = Arc::clone(&allocator);
                handles.push(tokio::spawn(async move {
                    let mut ids = Vec::with_capacity(per_task);
                    for _ in 0..per_task {
                        ids.push(allocator.next().await.unwrap());
                    }
                    ids
                }));
            }
            let mut all = Vec::new();
            for handle in handles {
                all.extend(handle.await.unwrap());
            }
            all
        });

        let unique: HashSet<i64> = ids.iter().copied().collect();
        prop_assert_eq!(unique.len(), tasks * per_task);
        prop_assert!(ids.iter().all(|&id| id > 0));
    }
}
