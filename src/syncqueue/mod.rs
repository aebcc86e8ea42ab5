// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Outbound propagation: watermarks, the change queue, the failure ledger
//! and the scheduled processor that drains them into the primary store.

pub mod ledger;
pub mod processor;

pub use ledger::{FailureRecord, SyncLedger, Watermark};
pub use processor::{RetryReport, SyncQueueProcessor, SyncRunReport, TableReport};
