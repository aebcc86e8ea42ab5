// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded, sharded loading cache with single-flight loads.
//!
//! Each shard is a `parking_lot::Mutex` over a map plus a recency index
//! (monotonic tick -> key), giving least-recently-used eviction per shard.
//! Misses go through a per-key in-flight registry: the first caller runs the
//! loader, concurrent callers for the same key await the same `OnceCell` and
//! share its result (value or error).
//!
//! A `put` or invalidation that lands while a load is in flight marks that
//! flight stale; its result is still handed to the waiters but never stored,
//! so a load that read the catalog before a write cannot replace the newer
//! entry.
//!
//! ```text
//! get_with(k) ──► shard hit ──────────────────────────► value
//!      │
//!      └─ miss ─► in_flight[k] (OnceCell) ─► loader() ─► insert ─► value
//!                     ▲
//!   concurrent get_with(k) await the same cell
//! ```

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::hash::{BuildHasher, Hash, RandomState};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OnceCell;
use crate::config::CacheConfig;
use crate::metrics;
use crate::storage::traits::StorageError;

type LoadResult<V> = Result<Option<V>, StorageError>;

/// Cache statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub name: String,
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub load_failures: u64,
    pub evictions: u64,
}

impl CacheStats {
    /// Hit rate in `[0.0, 1.0]`, 0 when there were no lookups.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// One in-flight load.
struct Flight<V> {
    cell: OnceCell<LoadResult<V>>,
    stale: AtomicBool,
}

impl<V> Flight<V> {
    fn new() -> Self {
        Self {
            cell: OnceCell::new(),
            stale: AtomicBool::new(false),
        }
    }
}

struct Slot<V> {
    value: V,
    tick: u64,
}

struct Shard<K, V> {
    entries: HashMap<K, Slot<V>>,
    recency: BTreeMap<u64, K>,
    tick: u64,
    capacity: usize,
}

impl<K: Hash + Eq + Clone, V: Clone> Shard<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            tick: 0,
            capacity,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn get(&mut self, key: &K) -> Option<V> {
        let tick = self.next_tick();
        let slot = self.entries.get_mut(key)?;
        self.recency.remove(&slot.tick);
        slot.tick = tick;
        self.recency.insert(tick, key.clone());
        Some(slot.value.clone())
    }

    fn peek(&self, key: &K) -> Option<V> {
        self.entries.get(key).map(|s| s.value.clone())
    }

    /// Insert or replace; returns the number of evicted entries.
    fn insert(&mut self, key: K, value: V) -> u64 {
        let tick = self.next_tick();
        if let Some(slot) = self.entries.get_mut(&key) {
            self.recency.remove(&slot.tick);
            slot.tick = tick;
            slot.value = value;
            self.recency.insert(tick, key);
            return 0;
        }

        let mut evicted = 0;
        while self.entries.len() >= self.capacity {
            let Some((_, oldest)) = self.recency.pop_first() else { break };
            self.entries.remove(&oldest);
            evicted += 1;
        }
        self.recency.insert(tick, key.clone());
        self.entries.insert(key, Slot { value, tick });
        evicted
    }

    fn remove(&mut self, key: &K) -> bool {
        match self.entries.remove(key) {
            Some(slot) => {
                self.recency.remove(&slot.tick);
                true
            }
            None => false,
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
    }
}

/// Generic loading cache shared by the UID, TSMeta and tag predicate caches.
pub struct DecodeCache<K, V> {
    name: String,
    shards: Vec<Mutex<Shard<K, V>>>,
    hasher: RandomState,
    capacity: usize,
    in_flight: DashMap<K, Arc<Flight<V>>>,
    stats_enabled: bool,
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    load_failures: AtomicU64,
    evictions: AtomicU64,
}

impl<K, V> DecodeCache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    pub fn new(name: impl Into<String>, config: &CacheConfig) -> Self {
        let shard_count = config.concurrency.max(1);
        let capacity = config.max_size.max(1);
        let per_shard = capacity.div_ceil(shard_count).max(1);
        Self {
            name: name.into(),
            shards: (0..shard_count).map(|_| Mutex::new(Shard::new(per_shard))).collect(),
            hasher: RandomState::new(),
            capacity,
            in_flight: DashMap::new(),
            stats_enabled: config.stats_enabled,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            loads: AtomicU64::new(0),
            load_failures: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn shard(&self, key: &K) -> &Mutex<Shard<K, V>> {
        let idx = (self.hasher.hash_one(key) as usize) % self.shards.len();
        &self.shards[idx]
    }

    fn count(&self, counter: &AtomicU64) {
        if self.stats_enabled {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Cached value only, no load. Counts a hit or a miss.
    pub fn get_if_present(&self, key: &K) -> Option<V> {
        let value = self.shard(key).lock().get(key);
        self.count(if value.is_some() { &self.hits } else { &self.misses });
        value
    }

    /// Cached value, or load it with at most one concurrent load per key.
    ///
    /// `Ok(None)` results are returned but not cached.
    pub async fn get_with<F, Fut>(&self, key: &K, loader: F) -> LoadResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = LoadResult<V>>,
    {
        if let Some(value) = self.shard(key).lock().get(key) {
            self.count(&self.hits);
            return Ok(Some(value));
        }
        self.count(&self.misses);

        let flight = self
            .in_flight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Flight::new()))
            .clone();

        let stale = &flight.stale;
        let result = flight
            .cell
            .get_or_init(|| async move {
                // A flight that finished before we registered already filled the shard
                if let Some(value) = self.shard(key).lock().peek(key) {
                    return Ok(Some(value));
                }
                self.loads.fetch_add(1, Ordering::Relaxed);
                let start = Instant::now();
                let loaded = loader().await;
                metrics::record_cache_load(&self.name, loaded.is_ok(), start.elapsed());
                match &loaded {
                    Ok(Some(value)) => self.store_loaded(key, value.clone(), stale),
                    Ok(None) => {}
                    Err(_) => self.count(&self.load_failures),
                }
                loaded
            })
            .await
            .clone();

        self.in_flight.remove_if(key, |_, f| Arc::ptr_eq(f, &flight));
        result
    }

    /// Store a loaded value unless a write touched the key mid-load.
    fn store_loaded(&self, key: &K, value: V, stale: &AtomicBool) {
        let mut shard = self.shard(key).lock();
        if stale.load(Ordering::Acquire) {
            return;
        }
        let evicted = shard.insert(key.clone(), value);
        drop(shard);
        self.count_evictions(evicted);
    }

    /// Caller holds the key's shard lock.
    fn mark_stale(&self, key: &K) {
        if let Some(flight) = self.in_flight.get(key) {
            flight.stale.store(true, Ordering::Release);
        }
    }

    fn count_evictions(&self, evicted: u64) {
        if evicted > 0 && self.stats_enabled {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
        }
    }

    /// Insert or replace an entry.
    pub fn put(&self, key: K, value: V) {
        let mut shard = self.shard(&key).lock();
        self.mark_stale(&key);
        let evicted = shard.insert(key, value);
        drop(shard);
        self.count_evictions(evicted);
    }

    /// Bulk insert without touching hit/miss counters.
    pub fn seed<I: IntoIterator<Item = (K, V)>>(&self, entries: I) -> usize {
        let mut n = 0;
        for (k, v) in entries {
            self.put(k, v);
            n += 1;
        }
        n
    }

    pub fn invalidate(&self, key: &K) -> bool {
        let mut shard = self.shard(key).lock();
        self.mark_stale(key);
        shard.remove(key)
    }

    pub fn invalidate_all(&self) {
        // Flights first: one that stores after this loop finds its shard cleared below
        for flight in self.in_flight.iter() {
            flight.stale.store(true, Ordering::Release);
        }
        for shard in &self.shards {
            shard.lock().clear();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().entries.len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of loader invocations (always tracked).
    #[must_use]
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            name: self.name.clone(),
            size: self.len(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            loads: self.load_count(),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Push the current statistics to the metrics recorder.
    pub fn export_metrics(&self) {
        let s = self.stats();
        metrics::set_cache_stats(&s.name, s.hits, s.misses, s.evictions, s.size);
    }
}
