// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Tessera Authors

//! Write-ahead log for Tessera operation intents.
//!
//! This crate provides:
//! - Segmented, checksummed log files with torn-tail repair
//! - The intent state machine and its per-intent projection
//! - Checkpointing and reclamation of settled intents
//! - An in-memory log with write-failure injection for tests

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod entry;
mod error;
mod log;
mod reader;
mod record;
mod storage;
mod writer;

#[cfg(test)]
mod durability_tests;

pub use entry::{DispatchAttempt, StateChange, WalEntry};
pub use error::{Result, WalError};
pub use log::{CompactionStats, ReplayStats, WriteAheadLog};
pub use reader::{list_sealed_segments, WalReader};
pub use record::{
    IntentState, SequencedRecord, TransitionDetail, TransitionRecord, TransitionRequest, WalRecord,
};
pub use storage::{FileLogStorage, LogScan, LogStorage, MemoryLogStorage};
pub use writer::{SegmentWriter, CURRENT_SEGMENT};
