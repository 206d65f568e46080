// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Tessera Authors

//! WAL error types.

use std::path::PathBuf;

use tessera_core::IntentId;
use thiserror::Error;

use crate::record::IntentState;

/// Result type for WAL operations.
pub type Result<T> = std::result::Result<T, WalError>;

/// Errors that can occur in the write-ahead log.
#[derive(Debug, Error)]
pub enum WalError {
    /// The storage medium rejected a read or write.
    #[error("WAL I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be encoded.
    #[error("WAL encoding error: {0}")]
    Encode(String),

    /// A segment is unusable (bad magic or unsupported version).
    #[error("corrupt WAL segment {}: {reason}", path.display())]
    Corrupt {
        /// Path of the offending segment.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },

    /// The storage substrate refused the write.
    #[error("WAL storage unavailable: {0}")]
    Unavailable(String),

    /// An intent with this id is already logged.
    #[error("intent {0} is already in the WAL")]
    DuplicateIntent(IntentId),

    /// No entry exists for this intent id.
    #[error("intent {0} is not in the WAL")]
    NotFound(IntentId),

    /// The requested state change violates the state lattice.
    #[error("invalid transition for intent {intent_id}: {from} -> {to}")]
    InvalidTransition {
        /// The intent being transitioned.
        intent_id: IntentId,
        /// Current state.
        from: IntentState,
        /// Requested state.
        to: IntentState,
    },
}

impl From<bincode::Error> for WalError {
    fn from(err: bincode::Error) -> Self {
        Self::Encode(err.to_string())
    }
}

impl From<WalError> for tessera_core::Error {
    fn from(err: WalError) -> Self {
        match err {
            WalError::NotFound(id) => Self::intent_not_found(id.as_str()),
            WalError::DuplicateIntent(id) => {
                Self::InvalidIntent(format!("intent id {id} has already been submitted"))
            }
            other => Self::LogWrite(other.to_string()),
        }
    }
}
