// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Write options for caller-controlled change capture.
//!
//! Every catalog write carries a [`WriteOptions`] naming where the change
//! came from. Change capture reads it instead of any connection state:
//!
//! | Origin | Version bump | Sync queue entry |
//! |--------|--------------|------------------|
//! | [`ChangeOrigin::Catalog`] | yes | yes |
//! | [`ChangeOrigin::EventQueue`] | no | yes |
//! | [`ChangeOrigin::Propagation`] | no | no |
//!
//! # Example
//!
//! ```rust
//! use catalog_sync::{WriteOptions, ChangeOrigin};
//!
//! // Default: a user edit of the catalog
//! let opts = WriteOptions::default();
//! assert!(opts.bumps_version());
//!
//! // Applying a value just read from the primary store
//! let opts = WriteOptions::propagation();
//! assert!(opts.suppresses_capture());
//! assert_eq!(opts.origin, ChangeOrigin::Propagation);
//! ```

/// Where a catalog write originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChangeOrigin {
    /// A direct catalog edit: version it and queue it.
    #[default]
    Catalog,
    /// An edit relayed from the event queue: queue it, keep the version.
    EventQueue,
    /// A value applied because the primary store changed: record nothing.
    Propagation,
}

/// Options passed alongside every catalog write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteOptions {
    pub origin: ChangeOrigin,
}

impl WriteOptions {
    #[must_use]
    pub fn catalog() -> Self {
        Self { origin: ChangeOrigin::Catalog }
    }

    #[must_use]
    pub fn event_queue() -> Self {
        Self { origin: ChangeOrigin::EventQueue }
    }

    /// Suppress change capture for this write.
    #[must_use]
    pub fn propagation() -> Self {
        Self { origin: ChangeOrigin::Propagation }
    }

    #[must_use]
    pub fn suppresses_capture(&self) -> bool {
        self.origin == ChangeOrigin::Propagation
    }

    #[must_use]
    pub fn bumps_version(&self) -> bool {
        self.origin == ChangeOrigin::Catalog
    }
}
