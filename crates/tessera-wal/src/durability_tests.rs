// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Tessera Authors

//! Durability tests for the file-backed WAL.
//!
//! Covers:
//! - Crash recovery at each point of an intent's lifecycle
//! - Torn tails, bit flips and garbage in segments
//! - Replay across rotated segments and checkpoints
//!
//! # Test Infrastructure
//!
//! - [`WalTestHarness`]: an isolated WAL directory
//! - [`CorruptionInjector`]: utilities for damaging segment files

use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tessera_core::{IntentId, OperationIntent, WalSyncMode};

use crate::log::WriteAheadLog;
use crate::reader::{list_sealed_segments, WalReader};
use crate::record::{IntentState, TransitionRequest};
use crate::storage::{FileLogStorage, LogStorage};
use crate::writer::{CURRENT_SEGMENT, HEADER_LEN};

/// Test harness owning an isolated WAL directory.
pub struct WalTestHarness {
    _temp_dir: TempDir,
    /// Path to the WAL directory.
    pub wal_dir: PathBuf,
}

impl WalTestHarness {
    /// Create a harness with an empty WAL directory.
    pub fn new() -> std::io::Result<Self> {
        let temp_dir = TempDir::new()?;
        let wal_dir = temp_dir.path().join("wal");
        std::fs::create_dir_all(&wal_dir)?;
        Ok(Self { _temp_dir: temp_dir, wal_dir })
    }

    /// Open the file storage. Every call simulates a process restart.
    pub fn open_storage(&self) -> crate::Result<Arc<FileLogStorage>> {
        Ok(Arc::new(FileLogStorage::open(&self.wal_dir, WalSyncMode::None)?))
    }

    /// Open the WAL on fresh storage, replaying whatever is on disk.
    pub async fn open_wal(&self) -> crate::Result<WriteAheadLog> {
        let storage: Arc<dyn LogStorage> = self.open_storage()?;
        WriteAheadLog::open(storage).await
    }

    /// Path of the active segment.
    pub fn wal_path(&self) -> PathBuf {
        self.wal_dir.join(CURRENT_SEGMENT)
    }

    /// Size of the active segment.
    pub fn wal_len(&self) -> u64 {
        std::fs::metadata(self.wal_path()).map(|m| m.len()).unwrap_or(0)
    }
}

/// Utility for injecting corruption into files.
pub struct CorruptionInjector;

impl CorruptionInjector {
    /// Flip a single bit at the specified byte offset.
    pub fn flip_bit(path: &Path, offset: u64, bit: u8) -> std::io::Result<()> {
        let mut file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = [0u8; 1];
        std::io::Read::read_exact(&mut file, &mut buf)?;
        buf[0] ^= 1 << (bit % 8);
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&buf)?;
        Ok(())
    }

    /// Truncate a file to the specified size.
    pub fn truncate(path: &Path, size: u64) -> std::io::Result<()> {
        let file = std::fs::OpenOptions::new().write(true).open(path)?;
        file.set_len(size)?;
        Ok(())
    }

    /// Append garbage bytes to a file.
    pub fn append_garbage(path: &Path, garbage: &[u8]) -> std::io::Result<()> {
        let mut file = std::fs::OpenOptions::new().append(true).open(path)?;
        file.write_all(garbage)?;
        Ok(())
    }
}

fn pin(id: &str) -> OperationIntent {
    OperationIntent::pin(format!("bafy-{id}")).with_id(id)
}

fn id(id: &str) -> IntentId {
    IntentId::new(id)
}

/// Writes `count` committed intents and returns the file length after each
/// intent's last record.
async fn write_committed(harness: &WalTestHarness, count: usize) -> Vec<u64> {
    let wal = harness.open_wal().await.unwrap();
    let mut lengths = Vec::new();
    for i in 0..count {
        let name = format!("op-{i}");
        wal.append(pin(&name)).await.unwrap();
        wal.transition(&id(&name), TransitionRequest::dispatched(1, "local", vec![]))
            .await
            .unwrap();
        wal.transition(&id(&name), TransitionRequest::committed("local")).await.unwrap();
        lengths.push(harness.wal_len());
    }
    lengths
}

// =============================================================================
// Crash Recovery Tests
// =============================================================================

/// Crash before anything was logged: replay finds nothing.
#[tokio::test]
async fn test_crash_before_intent() {
    let harness = WalTestHarness::new().unwrap();
    let wal = harness.open_wal().await.unwrap();
    assert!(wal.is_empty());
    assert!(!wal.corruption_detected());
}

/// Crash after the intent record: the entry comes back `Pending`.
#[tokio::test]
async fn test_crash_after_intent() {
    let harness = WalTestHarness::new().unwrap();
    {
        let wal = harness.open_wal().await.unwrap();
        wal.append(pin("a")).await.unwrap();
    }

    let wal = harness.open_wal().await.unwrap();
    let entry = wal.get(&id("a")).unwrap();
    assert_eq!(entry.state, IntentState::Pending);
    assert_eq!(entry.attempt_count(), 0);
    assert_eq!(wal.unsettled().len(), 1);
}

/// Crash mid-dispatch: the entry comes back `Dispatched` with its attempt
/// count intact.
#[tokio::test]
async fn test_crash_after_dispatch() {
    let harness = WalTestHarness::new().unwrap();
    {
        let wal = harness.open_wal().await.unwrap();
        wal.append(pin("a")).await.unwrap();
        let candidates = vec!["local".to_string(), "remote".to_string()];
        wal.transition(&id("a"), TransitionRequest::dispatched(1, "local", candidates))
            .await
            .unwrap();
        wal.transition(&id("a"), TransitionRequest::dispatched(2, "remote", vec![]))
            .await
            .unwrap();
    }

    let wal = harness.open_wal().await.unwrap();
    let entry = wal.get(&id("a")).unwrap();
    assert_eq!(entry.state, IntentState::Dispatched);
    assert_eq!(entry.attempt_count(), 2);
    assert_eq!(entry.last_backend(), Some("remote"));
    assert_eq!(entry.candidates, vec!["local", "remote"]);
}

/// Crash after a committed transition: the commit is durable.
#[tokio::test]
async fn test_commit_is_durable() {
    let harness = WalTestHarness::new().unwrap();
    write_committed(&harness, 1).await;

    let wal = harness.open_wal().await.unwrap();
    let entry = wal.get(&id("op-0")).unwrap();
    assert_eq!(entry.state, IntentState::Committed);
    assert_eq!(entry.committed_backend.as_deref(), Some("local"));
    assert!(wal.unsettled().is_empty());
}

/// Crash between `Failed(exhausted)` and `Abandoned`: the entry stays
/// unsettled so recovery can finish the abandonment.
#[tokio::test]
async fn test_crash_before_abandon() {
    let harness = WalTestHarness::new().unwrap();
    {
        let wal = harness.open_wal().await.unwrap();
        wal.append(pin("a")).await.unwrap();
        wal.transition(&id("a"), TransitionRequest::dispatched(1, "x", vec![])).await.unwrap();
        wal.transition(&id("a"), TransitionRequest::failed("timeout", true)).await.unwrap();
    }

    let wal = harness.open_wal().await.unwrap();
    let entry = wal.get(&id("a")).unwrap();
    assert_eq!(entry.state, IntentState::Failed);
    assert!(entry.exhausted);
    assert!(!entry.is_settled());
    wal.transition(&id("a"), TransitionRequest::abandoned("timeout")).await.unwrap();
    assert!(wal.unsettled().is_empty());
}

/// Replaying twice yields the same projection.
#[tokio::test]
async fn test_replay_idempotent() {
    let harness = WalTestHarness::new().unwrap();
    write_committed(&harness, 3).await;

    let first = harness.open_wal().await.unwrap().scan();
    let second = harness.open_wal().await.unwrap().scan();
    assert_eq!(first, second);
    assert_eq!(first.len(), 3);
}

// =============================================================================
// Corruption Tests
// =============================================================================

/// A bit flip in the last frame drops that record only.
#[tokio::test]
async fn test_single_bit_flip_detection() {
    let harness = WalTestHarness::new().unwrap();
    let lengths = write_committed(&harness, 2).await;

    // Last byte of the file belongs to the final commit record of op-1.
    CorruptionInjector::flip_bit(&harness.wal_path(), lengths[1] - 1, 3).unwrap();

    let reader = WalReader::read(&harness.wal_path()).unwrap();
    assert!(reader.corruption_detected());
    assert_eq!(reader.records().len(), 5);

    let wal = harness.open_wal().await.unwrap();
    assert!(wal.corruption_detected());
    assert_eq!(wal.get(&id("op-0")).unwrap().state, IntentState::Committed);
    assert_eq!(wal.get(&id("op-1")).unwrap().state, IntentState::Dispatched);
}

/// A torn tail is cut off at open and new records land after the last valid
/// frame.
#[tokio::test]
async fn test_truncated_tail_is_repaired() {
    let harness = WalTestHarness::new().unwrap();
    let lengths = write_committed(&harness, 2).await;
    CorruptionInjector::truncate(&harness.wal_path(), lengths[1] - 2).unwrap();

    {
        let wal = harness.open_wal().await.unwrap();
        assert!(harness.wal_len() < lengths[1] - 2);
        wal.transition(&id("op-1"), TransitionRequest::committed("local")).await.unwrap();
    }

    let wal = harness.open_wal().await.unwrap();
    assert!(!wal.corruption_detected());
    assert_eq!(wal.get(&id("op-1")).unwrap().state, IntentState::Committed);
}

/// Garbage after the last frame is ignored.
#[tokio::test]
async fn test_garbage_after_last_frame() {
    let harness = WalTestHarness::new().unwrap();
    write_committed(&harness, 1).await;
    CorruptionInjector::append_garbage(&harness.wal_path(), &[0xFF; 37]).unwrap();

    let reader = WalReader::read(&harness.wal_path()).unwrap();
    assert!(reader.corruption_detected());
    assert_eq!(reader.records().len(), 3);

    let wal = harness.open_wal().await.unwrap();
    assert_eq!(wal.get(&id("op-0")).unwrap().state, IntentState::Committed);
}

/// A segment holding only garbage after its header reads as empty.
#[tokio::test]
async fn test_garbage_after_header() {
    let harness = WalTestHarness::new().unwrap();
    drop(harness.open_storage().unwrap());
    CorruptionInjector::append_garbage(&harness.wal_path(), b"definitely not a frame").unwrap();

    let wal = harness.open_wal().await.unwrap();
    assert!(wal.is_empty());
    assert_eq!(harness.wal_len(), HEADER_LEN);
}

// =============================================================================
// Rotation and Checkpoint Tests
// =============================================================================

/// Replay spans sealed segments and the active one.
#[tokio::test]
async fn test_replay_across_rotated_segments() {
    let harness = WalTestHarness::new().unwrap();
    {
        let storage = harness.open_storage().unwrap();
        let wal = WriteAheadLog::open(storage.clone()).await.unwrap();
        wal.append(pin("a")).await.unwrap();
        storage.rotate().await.unwrap();
        wal.transition(&id("a"), TransitionRequest::dispatched(1, "local", vec![]))
            .await
            .unwrap();
        storage.rotate().await.unwrap();
        wal.transition(&id("a"), TransitionRequest::committed("local")).await.unwrap();
    }

    assert_eq!(list_sealed_segments(&harness.wal_dir).unwrap().len(), 2);
    let wal = harness.open_wal().await.unwrap();
    assert_eq!(wal.get(&id("a")).unwrap().state, IntentState::Committed);
    assert_eq!(wal.last_sequence(), 3);
}

/// Compaction deletes covered segments; live intents survive a restart.
#[tokio::test]
async fn test_checkpoint_skips_reclaimed_records() {
    let harness = WalTestHarness::new().unwrap();
    write_committed(&harness, 3).await;
    {
        let wal = harness.open_wal().await.unwrap();
        wal.append(pin("live")).await.unwrap();
        let stats = wal.compact(Duration::ZERO).await.unwrap();
        assert_eq!(stats.checkpoint, Some(9));
        assert_eq!(stats.intents_reclaimed, 3);
        assert_eq!(stats.segments_removed, 0);
        assert_eq!(wal.len(), 1);
    }

    let wal = harness.open_wal().await.unwrap();
    assert_eq!(wal.checkpoint(), 9);
    assert_eq!(wal.len(), 1);
    assert_eq!(wal.get(&id("live")).unwrap().state, IntentState::Pending);

    wal.transition(&id("live"), TransitionRequest::failed("invalid reference", false))
        .await
        .unwrap();
    let stats = wal.compact(Duration::ZERO).await.unwrap();
    assert!(stats.segments_removed >= 1);
    assert!(wal.is_empty());

    let wal = harness.open_wal().await.unwrap();
    assert!(wal.is_empty());
}

/// Reclaimed ids stay retired after their segments are deleted.
#[tokio::test]
async fn test_reclaimed_ids_survive_segment_removal() {
    let harness = WalTestHarness::new().unwrap();
    write_committed(&harness, 2).await;
    {
        let wal = harness.open_wal().await.unwrap();
        wal.compact(Duration::ZERO).await.unwrap();
        wal.append(pin("later")).await.unwrap();
        wal.transition(&id("later"), TransitionRequest::failed("unauthorized", false))
            .await
            .unwrap();
        let stats = wal.compact(Duration::ZERO).await.unwrap();
        assert!(stats.segments_removed >= 1);
    }

    let wal = harness.open_wal().await.unwrap();
    assert!(wal.is_empty());
    for name in ["op-0", "op-1", "later"] {
        assert!(wal.is_retired(&id(name)), "{name} should stay retired");
        assert!(matches!(
            wal.append(pin(name)).await,
            Err(crate::WalError::DuplicateIntent(_))
        ));
    }
}

// =============================================================================
// Property-based Corruption Tests (using proptest)
// =============================================================================

#[cfg(test)]
mod proptest_durability {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        /// A bit flip anywhere past the header never fails replay, and what
        /// survives is a prefix of what was written.
        #[test]
        fn fuzz_bit_flip_recovery(
            bit_offset in HEADER_LEN..600,
            bit_position in 0u8..8
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let (open_ok, prefix_ok) = rt.block_on(async {
                let harness = WalTestHarness::new().unwrap();
                write_committed(&harness, 3).await;
                let original = WalReader::read(&harness.wal_path()).unwrap().into_records();

                if bit_offset < harness.wal_len() {
                    let _ = CorruptionInjector::flip_bit(&harness.wal_path(), bit_offset, bit_position);
                }

                let read = WalReader::read(&harness.wal_path()).unwrap().into_records();
                let prefix_ok = read.len() <= original.len() && original[..read.len()] == read[..];
                (harness.open_wal().await.is_ok(), prefix_ok)
            });

            prop_assert!(open_ok);
            prop_assert!(prefix_ok);
        }

        /// Truncating the active segment anywhere never fails replay.
        #[test]
        fn fuzz_truncation_recovery(truncate_point in 0u64..600) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let (open_ok, states_ok) = rt.block_on(async {
                let harness = WalTestHarness::new().unwrap();
                write_committed(&harness, 3).await;

                if truncate_point < harness.wal_len() {
                    let _ = CorruptionInjector::truncate(&harness.wal_path(), truncate_point);
                }

                match harness.open_wal().await {
                    Ok(wal) => {
                        // Surviving entries only ever show states they really reached.
                        let states_ok = wal.scan().iter().all(|e| {
                            matches!(
                                e.state,
                                IntentState::Pending | IntentState::Dispatched | IntentState::Committed
                            )
                        });
                        (true, states_ok)
                    }
                    Err(_) => (false, false),
                }
            });

            prop_assert!(open_ok);
            prop_assert!(states_ok);
        }
    }
}
