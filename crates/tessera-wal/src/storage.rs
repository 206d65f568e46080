// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Tessera Authors

//! Durable storage substrates for the write-ahead log.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tessera_core::WalSyncMode;

use crate::error::{Result, WalError};
use crate::reader::{list_sealed_segments, WalReader};
use crate::record::{SequencedRecord, WalRecord};
use crate::writer::{sealed_segment_name, sync_dir, SegmentWriter, CURRENT_SEGMENT};

/// The result of scanning a log substrate.
#[derive(Debug, Default)]
pub struct LogScan {
    /// Every readable record, in sequence order.
    pub records: Vec<SequencedRecord>,
    /// Whether any frame had to be discarded.
    pub corruption_detected: bool,
}

/// Append-only, durable record storage.
///
/// Sequence numbers are assigned by the storage and strictly increase across
/// restarts. `append` returns only once the record is durable.
#[async_trait]
pub trait LogStorage: Send + Sync {
    /// Durably appends a record, returning its sequence number.
    async fn append(&self, record: &WalRecord) -> Result<u64>;

    /// Reads every stored record in sequence order.
    async fn scan(&self) -> Result<LogScan>;

    /// Seals the active segment and starts a new one.
    ///
    /// Returns the last sequence of the sealed segment, or `None` if the
    /// active segment was empty and nothing was sealed.
    async fn rotate(&self) -> Result<Option<u64>>;

    /// Deletes sealed segments whose records all have sequence `<= through`.
    ///
    /// Returns the number of segments removed.
    async fn reclaim(&self, through: u64) -> Result<usize>;

    /// Flushes buffered state to stable storage.
    async fn sync(&self) -> Result<()>;
}

struct FileState {
    writer: SegmentWriter,
    next_sequence: u64,
}

/// File-backed log storage.
///
/// The active segment is `current.wal`; rotation renames it to
/// `segment-<last_sequence>.wal`.
pub struct FileLogStorage {
    dir: PathBuf,
    sync_mode: WalSyncMode,
    state: tokio::sync::Mutex<FileState>,
    repaired_tail: AtomicBool,
}

impl FileLogStorage {
    /// Opens or creates the log in `dir`.
    ///
    /// The next sequence continues after the highest sequence found in any
    /// segment.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the active
    /// segment has an invalid header.
    pub fn open(dir: impl AsRef<Path>, sync_mode: WalSyncMode) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let current_path = dir.join(CURRENT_SEGMENT);
        let mut repaired_tail = false;
        let writer = if current_path.exists() {
            let (writer, reader) = SegmentWriter::open(&current_path, sync_mode)?;
            if reader.corruption_detected() {
                tracing::warn!(
                    path = %current_path.display(),
                    "Recovered WAL segment with a damaged tail"
                );
                repaired_tail = true;
            }
            writer
        } else {
            let writer = SegmentWriter::create(&current_path, sync_mode)?;
            sync_dir(&dir, sync_mode)?;
            writer
        };

        let sealed_max = list_sealed_segments(&dir)?.last().map(|(last, _)| *last);
        let last = writer.last_sequence().max(sealed_max).unwrap_or(0);

        tracing::debug!(dir = %dir.display(), next_sequence = last + 1, "Opened WAL storage");

        Ok(Self {
            dir,
            sync_mode,
            state: tokio::sync::Mutex::new(FileState { writer, next_sequence: last + 1 }),
            repaired_tail: AtomicBool::new(repaired_tail),
        })
    }

    /// The directory holding the segments.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the active segment.
    #[must_use]
    pub fn current_path(&self) -> PathBuf {
        self.dir.join(CURRENT_SEGMENT)
    }
}

#[async_trait]
impl LogStorage for FileLogStorage {
    async fn append(&self, record: &WalRecord) -> Result<u64> {
        let mut state = self.state.lock().await;
        let sequence = state.next_sequence;
        state.writer.append(sequence, record)?;
        state.next_sequence += 1;
        Ok(sequence)
    }

    async fn scan(&self) -> Result<LogScan> {
        let _state = self.state.lock().await;
        let reader = WalReader::read_all(&self.dir)?;
        // A tail cut off at open still counts once.
        let corruption_detected =
            reader.corruption_detected() | self.repaired_tail.swap(false, Ordering::Relaxed);
        Ok(LogScan { records: reader.into_records(), corruption_detected })
    }

    async fn rotate(&self) -> Result<Option<u64>> {
        let mut state = self.state.lock().await;
        let Some(last) = state.writer.last_sequence() else {
            return Ok(None);
        };
        state.writer.sync()?;

        let current = self.current_path();
        let sealed = self.dir.join(sealed_segment_name(last));
        std::fs::rename(&current, &sealed)?;
        state.writer = SegmentWriter::create(&current, self.sync_mode)?;
        sync_dir(&self.dir, self.sync_mode)?;

        tracing::debug!(segment = %sealed.display(), "Sealed WAL segment");
        Ok(Some(last))
    }

    async fn reclaim(&self, through: u64) -> Result<usize> {
        let _state = self.state.lock().await;
        let mut removed = 0;
        for (last, path) in list_sealed_segments(&self.dir)? {
            if last > through {
                break;
            }
            std::fs::remove_file(&path)?;
            tracing::debug!(segment = %path.display(), "Removed reclaimed WAL segment");
            removed += 1;
        }
        if removed > 0 {
            sync_dir(&self.dir, self.sync_mode)?;
        }
        Ok(removed)
    }

    async fn sync(&self) -> Result<()> {
        self.state.lock().await.writer.sync()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    sealed: Vec<(u64, Vec<SequencedRecord>)>,
    current: Vec<SequencedRecord>,
    next_sequence: u64,
    appends_until_failure: Option<u64>,
}

/// Volatile log storage for tests and ephemeral deployments.
///
/// Clones share the same log, so a "restarted" manager can reopen what a
/// previous instance wrote. Write failures can be injected.
#[derive(Debug, Clone, Default)]
pub struct MemoryLogStorage {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryLogStorage {
    /// Creates an empty in-memory log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent append fail (or succeed again).
    pub fn fail_appends(&self, fail: bool) {
        self.state.lock().appends_until_failure = fail.then_some(0);
    }

    /// Lets `count` more appends succeed, then fails the rest.
    pub fn fail_after(&self, count: u64) {
        self.state.lock().appends_until_failure = Some(count);
    }

    /// Every stored record, in sequence order.
    #[must_use]
    pub fn records(&self) -> Vec<SequencedRecord> {
        let state = self.state.lock();
        state
            .sealed
            .iter()
            .flat_map(|(_, records)| records.iter())
            .chain(&state.current)
            .cloned()
            .collect()
    }

    /// Number of sealed segments.
    #[must_use]
    pub fn sealed_segments(&self) -> usize {
        self.state.lock().sealed.len()
    }
}

#[async_trait]
impl LogStorage for MemoryLogStorage {
    async fn append(&self, record: &WalRecord) -> Result<u64> {
        let mut state = self.state.lock();
        match state.appends_until_failure {
            Some(0) => return Err(WalError::Unavailable("injected write failure".to_string())),
            Some(n) => state.appends_until_failure = Some(n - 1),
            None => {}
        }
        state.next_sequence += 1;
        let sequence = state.next_sequence;
        state.current.push(SequencedRecord { sequence, record: record.clone() });
        Ok(sequence)
    }

    async fn scan(&self) -> Result<LogScan> {
        Ok(LogScan { records: self.records(), corruption_detected: false })
    }

    async fn rotate(&self) -> Result<Option<u64>> {
        let mut state = self.state.lock();
        let Some(last) = state.current.last().map(|r| r.sequence) else {
            return Ok(None);
        };
        let sealed = std::mem::take(&mut state.current);
        state.sealed.push((last, sealed));
        Ok(Some(last))
    }

    async fn reclaim(&self, through: u64) -> Result<usize> {
        let mut state = self.state.lock();
        let before = state.sealed.len();
        state.sealed.retain(|(last, _)| *last > through);
        Ok(before - state.sealed.len())
    }

    async fn sync(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tempfile::TempDir;

    use super::*;

    fn checkpoint(sequence: u64) -> WalRecord {
        WalRecord::Checkpoint { sequence, reclaimed: Vec::new(), timestamp: Utc::now() }
    }

    #[tokio::test]
    async fn test_file_storage_sequence_continues_after_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let storage = FileLogStorage::open(temp_dir.path(), WalSyncMode::None).unwrap();
            assert_eq!(storage.append(&checkpoint(0)).await.unwrap(), 1);
            assert_eq!(storage.append(&checkpoint(0)).await.unwrap(), 2);
            assert_eq!(storage.rotate().await.unwrap(), Some(2));
        }

        let storage = FileLogStorage::open(temp_dir.path(), WalSyncMode::None).unwrap();
        assert_eq!(storage.append(&checkpoint(0)).await.unwrap(), 3);

        let scan = storage.scan().await.unwrap();
        let sequences: Vec<u64> = scan.records.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert!(!scan.corruption_detected);
    }

    #[tokio::test]
    async fn test_file_storage_rotate_empty_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileLogStorage::open(temp_dir.path(), WalSyncMode::Fdatasync).unwrap();
        assert_eq!(storage.rotate().await.unwrap(), None);
        assert!(list_sealed_segments(temp_dir.path()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_storage_reclaim() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileLogStorage::open(temp_dir.path(), WalSyncMode::None).unwrap();
        for _ in 0..2 {
            storage.append(&checkpoint(0)).await.unwrap();
        }
        storage.rotate().await.unwrap();
        for _ in 0..2 {
            storage.append(&checkpoint(0)).await.unwrap();
        }
        storage.rotate().await.unwrap();
        storage.append(&checkpoint(0)).await.unwrap();

        assert_eq!(storage.reclaim(3).await.unwrap(), 1);
        let remaining = list_sealed_segments(temp_dir.path()).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].0, 4);

        let sequences: Vec<u64> =
            storage.scan().await.unwrap().records.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_memory_storage_fault_injection() {
        let storage = MemoryLogStorage::new();
        storage.fail_after(1);
        assert_eq!(storage.append(&checkpoint(0)).await.unwrap(), 1);
        assert!(matches!(storage.append(&checkpoint(0)).await, Err(WalError::Unavailable(_))));

        storage.fail_appends(false);
        assert_eq!(storage.append(&checkpoint(0)).await.unwrap(), 2);

        let clone = storage.clone();
        assert_eq!(clone.records().len(), 2);
    }

    #[tokio::test]
    async fn test_memory_storage_rotate_and_reclaim() {
        let storage = MemoryLogStorage::new();
        storage.append(&checkpoint(0)).await.unwrap();
        assert_eq!(storage.rotate().await.unwrap(), Some(1));
        assert_eq!(storage.rotate().await.unwrap(), None);
        storage.append(&checkpoint(0)).await.unwrap();

        assert_eq!(storage.reclaim(1).await.unwrap(), 1);
        assert_eq!(storage.sealed_segments(), 0);
        assert_eq!(storage.records().len(), 1);
    }
}
