// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Tessera Authors

//! Append-only segment writer.
//!
//! A segment starts with a header (`TWAL` magic, format version) followed by
//! frames:
//!
//! ```text
//! +-------------+------------+------------+-----------------+
//! | sequence u64| length u32 | crc32 u32  | bincode payload |
//! +-------------+------------+------------+-----------------+
//! ```
//!
//! All integers are little-endian. The CRC covers the sequence, the length
//! and the payload. Sealed segments are named after the last sequence they
//! hold, so lexical order is log order.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tessera_core::WalSyncMode;

use crate::error::{Result, WalError};
use crate::reader::WalReader;
use crate::record::WalRecord;

/// WAL file format version.
pub(crate) const WAL_VERSION: u32 = 1;

/// Magic bytes for WAL file header.
pub(crate) const WAL_MAGIC: &[u8; 4] = b"TWAL";

/// Length of the segment header.
pub(crate) const HEADER_LEN: u64 = 8;

/// Length of a frame header (sequence, length, crc).
pub(crate) const FRAME_HEADER_LEN: usize = 16;

/// Largest payload a frame may carry.
pub(crate) const MAX_RECORD_LEN: u32 = 16 * 1024 * 1024;

/// File name of the active segment.
pub const CURRENT_SEGMENT: &str = "current.wal";

/// File name of a sealed segment whose last frame is `last_sequence`.
#[must_use]
pub fn sealed_segment_name(last_sequence: u64) -> String {
    format!("segment-{last_sequence:020}.wal")
}

/// Parses the last sequence out of a sealed segment file name.
#[must_use]
pub fn parse_sealed_segment_name(name: &str) -> Option<u64> {
    name.strip_prefix("segment-")?.strip_suffix(".wal")?.parse().ok()
}

/// CRC of a frame's sequence, length and payload.
pub(crate) fn frame_crc(sequence: u64, len: u32, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&sequence.to_le_bytes());
    hasher.update(&len.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// Encodes a record into a complete frame.
pub(crate) fn encode_frame(sequence: u64, record: &WalRecord) -> Result<Vec<u8>> {
    let payload = bincode::serialize(record)?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_RECORD_LEN)
        .ok_or_else(|| WalError::Encode(format!("record of {} bytes is too large", payload.len())))?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&sequence.to_le_bytes());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&frame_crc(sequence, len, &payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Writes frames to a single segment file.
///
/// Each append is a single write of a whole frame followed by a sync
/// according to the configured mode. A failed write is rolled back by
/// truncating the file to its previous length so later frames stay readable.
#[derive(Debug)]
pub struct SegmentWriter {
    path: PathBuf,
    file: File,
    sync_mode: WalSyncMode,
    len: u64,
    records: u64,
    last_sequence: Option<u64>,
}

impl SegmentWriter {
    /// Creates a new, empty segment, replacing any existing file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or synced.
    pub fn create(path: &Path, sync_mode: WalSyncMode) -> Result<Self> {
        let mut file = File::create(path)?;
        file.write_all(WAL_MAGIC)?;
        file.write_all(&WAL_VERSION.to_le_bytes())?;
        sync_file(&file, sync_mode)?;

        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            sync_mode,
            len: HEADER_LEN,
            records: 0,
            last_sequence: None,
        })
    }

    /// Opens an existing segment for appending.
    ///
    /// The segment is read first; a torn or corrupted tail is cut off so new
    /// frames land directly after the last valid one. A file too short to hold
    /// a header is recreated.
    ///
    /// # Errors
    ///
    /// Returns [`WalError::Corrupt`] if the header is present but invalid.
    pub fn open(path: &Path, sync_mode: WalSyncMode) -> Result<(Self, WalReader)> {
        let reader = WalReader::read(path)?;
        if reader.valid_len() < HEADER_LEN {
            tracing::warn!(path = %path.display(), "WAL segment header is torn, recreating");
            return Ok((Self::create(path, sync_mode)?, reader));
        }

        let file = OpenOptions::new().append(true).open(path)?;
        let actual_len = file.metadata()?.len();
        if actual_len > reader.valid_len() {
            tracing::warn!(
                path = %path.display(),
                valid_len = reader.valid_len(),
                actual_len,
                "Truncating invalid WAL tail"
            );
            file.set_len(reader.valid_len())?;
            sync_file(&file, sync_mode)?;
        }

        let writer = Self {
            path: path.to_path_buf(),
            file,
            sync_mode,
            len: reader.valid_len(),
            records: reader.records().len() as u64,
            last_sequence: reader.last_sequence(),
        };
        Ok((writer, reader))
    }

    /// Appends a record and syncs it.
    ///
    /// Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding, writing or syncing fails. The segment is
    /// truncated back to its previous length on a failed write.
    pub fn append(&mut self, sequence: u64, record: &WalRecord) -> Result<usize> {
        let frame = encode_frame(sequence, record)?;

        if let Err(e) = self.write_frame(&frame) {
            if let Err(truncate_err) = self.file.set_len(self.len) {
                tracing::error!(
                    path = %self.path.display(),
                    error = %truncate_err,
                    "Failed to roll back partial WAL frame"
                );
            }
            return Err(e.into());
        }

        self.len += frame.len() as u64;
        self.records += 1;
        self.last_sequence = Some(sequence);
        Ok(frame.len())
    }

    fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.file.write_all(frame)?;
        sync_file(&self.file, self.sync_mode)
    }

    /// Syncs the segment according to the sync mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(sync_file(&self.file, self.sync_mode)?)
    }

    /// Path of the segment file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sequence of the last frame written.
    #[must_use]
    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    /// Number of frames in the segment.
    #[must_use]
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Current length of the segment in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns true if the segment holds no frames.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records == 0
    }
}

fn sync_file(file: &File, mode: WalSyncMode) -> std::io::Result<()> {
    match mode {
        WalSyncMode::None => Ok(()),
        WalSyncMode::Fdatasync => file.sync_data(),
        WalSyncMode::Fsync => file.sync_all(),
    }
}

/// Syncs a directory so renames and deletions inside it are durable.
pub(crate) fn sync_dir(dir: &Path, mode: WalSyncMode) -> std::io::Result<()> {
    if mode == WalSyncMode::None {
        return Ok(());
    }
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}
