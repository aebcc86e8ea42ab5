// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Freshness stamping for catalog rows, independent of change capture.

use crate::record::CatalogRecord;

/// Stamps `created`/`last_update` on every persisted insert or update,
/// whatever the write origin.
pub struct LastUpdateStamp;

impl LastUpdateStamp {
    /// Insert: `created == last_update == now`.
    /// Update: keep `created`, move `last_update` strictly past the old value.
    pub fn stamp(old: Option<&CatalogRecord>, new: &mut CatalogRecord, now: i64) {
        match old {
            None => new.set_timestamps(now, now),
            Some(old) => {
                let last = Self::next(old.last_update(), now);
                new.set_timestamps(old.created(), last);
            }
        }
    }

    /// Next stamp for a row last stamped at `previous`.
    #[must_use]
    pub fn next(previous: i64, now: i64) -> i64 {
        now.max(previous + 1)
    }
}
