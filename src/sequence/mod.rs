// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Primary key generation for catalog rows.

pub mod allocator;
pub mod source;

pub use allocator::{SequenceAllocator, SequenceStats};
pub use source::{CounterTableSequence, NativeSequence, SequenceSource};

/// Sync queue entry ids
pub const QID_SEQ: &str = "QID_SEQ";
/// Time-series metadata primary keys
pub const FQN_SEQ: &str = "FQN_SEQ";
/// Time-series to tag pair association ids
pub const FQN_TP_SEQ: &str = "FQN_TP_SEQ";
/// Annotation primary keys
pub const ANN_SEQ: &str = "ANN_SEQ";
