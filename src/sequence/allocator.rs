// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Range-caching sequence allocator.
//!
//! Hands out identifiers from a locally cached range `(current, ceiling]`.
//! `next()` is a CAS on `current`; only when the range is exhausted does a
//! caller take the refresh gate and fetch a new range from the durable
//! [`SequenceSource`].
//!
//! ```text
//!   current ──CAS+1──► returned id          (lock-free fast path)
//!      │
//!      └─ current == ceiling ─► refresh gate ─► source.next_value() ─► new range
//! ```
//!
//! `current` never decreases: a refresh publishes `hw - increment` (which is
//! at least the old ceiling) before publishing the new ceiling `hw`, so a
//! stale CAS can never hand out an id twice.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, error};
use crate::metrics;
use crate::storage::traits::StorageError;
use super::source::SequenceSource;

/// Snapshot of an allocator for observability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceStats {
    pub name: String,
    pub current: i64,
    pub ceiling: i64,
    pub increment: i64,
    pub refreshes: u64,
    pub fresh: bool,
}

pub struct SequenceAllocator {
    source: Arc<dyn SequenceSource>,
    increment: i64,
    current: AtomicI64,
    ceiling: AtomicI64,
    fresh: AtomicBool,
    refreshes: AtomicU64,
    refresh_gate: Mutex<()>,
}

impl SequenceAllocator {
    /// Create an allocator with an empty range; the first `next()` refreshes.
    ///
    /// `increment` must match the step of the source.
    pub fn new(source: Arc<dyn SequenceSource>, increment: i64) -> Result<Self, StorageError> {
        if increment < 1 {
            return Err(StorageError::Sequence(format!(
                "{}: increment must be positive, got {}",
                source.name(),
                increment
            )));
        }
        Ok(Self {
            source,
            increment,
            current: AtomicI64::new(0),
            ceiling: AtomicI64::new(0),
            fresh: AtomicBool::new(false),
            refreshes: AtomicU64::new(0),
            refresh_gate: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.source.name()
    }

    /// Next identifier. Strictly increasing per allocator, never repeated.
    pub async fn next(&self) -> Result<i64, StorageError> {
        loop {
            let current = self.current.load(Ordering::Acquire);
            let ceiling = self.ceiling.load(Ordering::Acquire);
            if current < ceiling {
                if self
                    .current
                    .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Ok(current + 1);
                }
                continue;
            }
            self.fresh.store(false, Ordering::Release);
            self.refresh().await?;
        }
    }

    /// Reserve `count` identifiers (not necessarily contiguous).
    pub async fn next_n(&self, count: usize) -> Result<Vec<i64>, StorageError> {
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            ids.push(self.next().await?);
        }
        Ok(ids)
    }

    async fn refresh(&self) -> Result<(), StorageError> {
        let _gate = self.refresh_gate.lock().await;

        // Another caller refreshed while we waited
        if self.current.load(Ordering::Acquire) < self.ceiling.load(Ordering::Acquire) {
            return Ok(());
        }

        let start = Instant::now();
        let previous = self.ceiling.load(Ordering::Acquire);
        let target = previous + self.increment;
        let mut loops: i64 = 0;
        let high_water = loop {
            let value = self.source.next_value().await.inspect_err(|e| {
                error!(sequence = %self.name(), error = %e, "Sequence refresh failed");
            })?;
            loops += 1;
            if value >= target {
                break value;
            }
            if loops >= self.increment {
                error!(
                    sequence = %self.name(),
                    loops,
                    last = value,
                    target,
                    "Sequence refresh did not reach target"
                );
                return Err(StorageError::Sequence(format!(
                    "{}: {} refresh loops without reaching {} (last value {})",
                    self.name(),
                    loops,
                    target,
                    value
                )));
            }
        };

        self.current.store(high_water - self.increment, Ordering::Release);
        self.ceiling.store(high_water, Ordering::Release);
        self.fresh.store(true, Ordering::Release);
        self.refreshes.fetch_add(1, Ordering::Relaxed);

        debug!(
            sequence = %self.name(),
            ceiling = high_water,
            loops,
            elapsed_us = start.elapsed().as_micros() as u64,
            "Sequence range refreshed"
        );
        metrics::record_sequence_refresh(self.name(), start.elapsed());
        metrics::set_sequence_range(self.name(), high_water - self.increment, high_water);
        Ok(())
    }

    #[must_use]
    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn ceiling(&self) -> i64 {
        self.ceiling.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.fresh.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn stats(&self) -> SequenceStats {
        SequenceStats {
            name: self.name().to_string(),
            current: self.current(),
            ceiling: self.ceiling(),
            increment: self.increment,
            refreshes: self.refreshes.load(Ordering::Relaxed),
            fresh: self.is_fresh(),
        }
    }
}
