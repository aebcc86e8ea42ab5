// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change capture for the catalog write path.
//!
//! Everything here runs inside the catalog write transaction, so an error
//! rolls the mutation back instead of committing it uncaptured.
//!
//! - [`ChangeCaptureTrigger`]: version stamping and sync queue entries
//! - [`RenameCascade`]: denormalized name upkeep after a UID rename
//! - [`LastUpdateStamp`]: freshness timestamps on every persisted write
//! - [`WriteOptions`]: caller-supplied origin of the write

pub mod last_update;
pub mod options;
pub mod rename;
pub mod trigger;

pub use last_update::LastUpdateStamp;
pub use options::{ChangeOrigin, WriteOptions};
pub use rename::{CascadeReport, RenameCascade, UidRename};
pub use trigger::{Capture, ChangeCaptureTrigger, SyncQueueEntry, TriggerStats};
