// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Tessera Authors

//! WAL segment reader.
//!
//! Reading stops at the first frame of a segment that is truncated, fails its
//! CRC, breaks sequence order or does not decode. Everything before it is
//! returned and the reader reports that corruption was detected.

use std::path::{Path, PathBuf};

use crate::error::{Result, WalError};
use crate::record::{SequencedRecord, WalRecord};
use crate::writer::{
    frame_crc, parse_sealed_segment_name, CURRENT_SEGMENT, FRAME_HEADER_LEN, HEADER_LEN,
    MAX_RECORD_LEN, WAL_MAGIC, WAL_VERSION,
};

/// Records read from one or more WAL segments.
#[derive(Debug, Default)]
pub struct WalReader {
    records: Vec<SequencedRecord>,
    valid_len: u64,
    corruption_detected: bool,
    last_checkpoint: Option<u64>,
}

impl WalReader {
    /// Reads every valid frame from a single segment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, or
    /// [`WalError::Corrupt`] if its header carries the wrong magic or version.
    pub fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::parse(path, &bytes)
    }

    fn parse(path: &Path, bytes: &[u8]) -> Result<Self> {
        let mut reader = Self::default();

        if bytes.len() < HEADER_LEN as usize {
            if !bytes.is_empty() {
                tracing::warn!(path = %path.display(), len = bytes.len(), "Torn WAL header");
                reader.corruption_detected = true;
            }
            return Ok(reader);
        }

        if &bytes[..4] != WAL_MAGIC {
            return Err(WalError::Corrupt {
                path: path.to_path_buf(),
                reason: "invalid WAL magic".to_string(),
            });
        }
        let version = le_u32(&bytes[4..8]);
        if version != WAL_VERSION {
            return Err(WalError::Corrupt {
                path: path.to_path_buf(),
                reason: format!("unsupported WAL version: {version}"),
            });
        }

        let mut offset = HEADER_LEN as usize;
        reader.valid_len = HEADER_LEN;

        while offset < bytes.len() {
            let rest = &bytes[offset..];
            match decode_frame(rest, reader.last_sequence()) {
                Ok((sequence, record, frame_len)) => {
                    if let WalRecord::Checkpoint { sequence: covered, .. } = &record {
                        reader.last_checkpoint = reader.last_checkpoint.max(Some(*covered));
                    }
                    reader.records.push(SequencedRecord { sequence, record });
                    offset += frame_len;
                    reader.valid_len = offset as u64;
                }
                Err(reason) => {
                    tracing::warn!(
                        path = %path.display(),
                        offset,
                        reason,
                        "Invalid WAL frame, ignoring the rest of the segment"
                    );
                    reader.corruption_detected = true;
                    break;
                }
            }
        }

        Ok(reader)
    }

    /// Reads every segment in a WAL directory, sealed segments first.
    ///
    /// A missing directory reads as empty. Unreadable segments are skipped with
    /// a warning and flagged as corruption.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed.
    pub fn read_all(wal_dir: &Path) -> Result<Self> {
        let mut all = Self::default();
        if !wal_dir.exists() {
            return Ok(all);
        }

        let mut paths: Vec<PathBuf> =
            list_sealed_segments(wal_dir)?.into_iter().map(|(_, path)| path).collect();
        let current = wal_dir.join(CURRENT_SEGMENT);
        if current.exists() {
            paths.push(current);
        }

        for path in paths {
            match Self::read(&path) {
                Ok(reader) => {
                    all.corruption_detected |= reader.corruption_detected;
                    all.last_checkpoint = all.last_checkpoint.max(reader.last_checkpoint);
                    all.records.extend(reader.records);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to read WAL segment");
                    all.corruption_detected = true;
                }
            }
        }

        all.records.sort_by_key(|r| r.sequence);
        all.records.dedup_by_key(|r| r.sequence);
        Ok(all)
    }

    /// Every valid record read, in sequence order.
    #[must_use]
    pub fn records(&self) -> &[SequencedRecord] {
        &self.records
    }

    /// Consumes the reader, returning its records.
    #[must_use]
    pub fn into_records(self) -> Vec<SequencedRecord> {
        self.records
    }

    /// Records written after the last checkpoint.
    #[must_use]
    pub fn records_since_checkpoint(&self) -> &[SequencedRecord] {
        match self.last_checkpoint {
            Some(covered) => {
                let idx = self.records.partition_point(|r| r.sequence <= covered);
                &self.records[idx..]
            }
            None => &self.records,
        }
    }

    /// Highest sequence covered by a checkpoint, if any.
    #[must_use]
    pub fn last_checkpoint(&self) -> Option<u64> {
        self.last_checkpoint
    }

    /// Sequence of the last valid record.
    #[must_use]
    pub fn last_sequence(&self) -> Option<u64> {
        self.records.last().map(|r| r.sequence)
    }

    /// Byte length of the valid prefix of a single segment.
    ///
    /// Zero when the header itself is torn; meaningless for
    /// [`WalReader::read_all`].
    #[must_use]
    pub fn valid_len(&self) -> u64 {
        self.valid_len
    }

    /// Returns true if any frame was rejected.
    #[must_use]
    pub fn corruption_detected(&self) -> bool {
        self.corruption_detected
    }
}

/// Lists sealed segments in a WAL directory, oldest first.
///
/// # Errors
///
/// Returns an error if the directory cannot be read.
pub fn list_sealed_segments(wal_dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    for entry in std::fs::read_dir(wal_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(last) = name.to_str().and_then(parse_sealed_segment_name) {
            segments.push((last, entry.path()));
        }
    }
    segments.sort_by_key(|(last, _)| *last);
    Ok(segments)
}

fn decode_frame(
    bytes: &[u8],
    previous: Option<u64>,
) -> std::result::Result<(u64, WalRecord, usize), &'static str> {
    if bytes.len() < FRAME_HEADER_LEN {
        return Err("truncated frame header");
    }
    let sequence = le_u64(&bytes[0..8]);
    let len = le_u32(&bytes[8..12]);
    let crc = le_u32(&bytes[12..16]);

    if len > MAX_RECORD_LEN {
        return Err("frame length out of range");
    }
    let end = FRAME_HEADER_LEN + len as usize;
    if bytes.len() < end {
        return Err("truncated frame payload");
    }
    let payload = &bytes[FRAME_HEADER_LEN..end];
    if frame_crc(sequence, len, payload) != crc {
        return Err("checksum mismatch");
    }
    if previous.is_some_and(|prev| sequence <= prev) {
        return Err("sequence out of order");
    }
    let record = bincode::deserialize(payload).map_err(|_| "undecodable record")?;
    Ok((sequence, record, end))
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}
