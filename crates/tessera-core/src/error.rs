// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Tessera Authors

//! Error taxonomy for Tessera storage operations.
//!
//! Every error surfaced to callers of the storage manager is one of these
//! variants. Backend-specific error types are classified into
//! [`Error::BackendTransient`] or [`Error::BackendPermanent`] at the dispatcher
//! boundary and never leak past it.

use thiserror::Error;

/// A specialized `Result` type for Tessera operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The kind of resource a [`Error::NotFound`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// An operation intent id.
    Intent,
    /// A registered backend name.
    Backend,
}

impl ResourceKind {
    /// Returns a lowercase label for the resource kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Intent => "intent",
            Self::Backend => "backend",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while coordinating storage operations.
///
/// The type is `Clone` so that a single terminal outcome can be handed to
/// every caller waiting on the same intent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The write-ahead log could not durably record an entry.
    ///
    /// Fatal to the current operation: an operation that cannot be logged is
    /// never executed.
    #[error("WAL write failed: {0}")]
    LogWrite(String),

    /// A backend failed in a way that may succeed on retry.
    #[error("backend {backend} transient failure: {message}")]
    BackendTransient {
        /// The backend that failed.
        backend: String,
        /// Description of the failure.
        message: String,
    },

    /// A backend rejected the operation in a way retries cannot fix.
    #[error("backend {backend} permanent failure: {message}")]
    BackendPermanent {
        /// The backend that rejected the operation.
        backend: String,
        /// Description of the failure.
        message: String,
    },

    /// Every allowed attempt failed transiently.
    #[error("retry budget exhausted after {attempts} attempts: {last_error}")]
    RetryBudgetExhausted {
        /// Number of dispatch attempts made, counted across restarts.
        attempts: u32,
        /// The error reported by the final attempt.
        last_error: String,
    },

    /// An unknown intent id or backend name was queried.
    #[error("{kind} not found: {name}")]
    NotFound {
        /// What kind of resource was looked up.
        kind: ResourceKind,
        /// The id or name that was not found.
        name: String,
    },

    /// No registered backend offers the capability an intent requires.
    #[error("no registered backend can {capability}")]
    NoCapableBackend {
        /// The missing capability.
        capability: String,
    },

    /// The intent was rejected before being logged.
    #[error("invalid intent: {0}")]
    InvalidIntent(String),

    /// The caller stopped waiting; the operation keeps running.
    #[error("stopped waiting for intent {intent_id}; the operation continues in the background")]
    Cancelled {
        /// The intent whose outcome is still pending.
        intent_id: String,
    },

    /// The manager is shutting down and accepts no new work.
    #[error("storage manager is shutting down")]
    ShuttingDown,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error outside the WAL write path.
    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// Creates a not-found error for an intent id.
    #[must_use]
    pub fn intent_not_found(id: impl Into<String>) -> Self {
        Self::NotFound { kind: ResourceKind::Intent, name: id.into() }
    }

    /// Creates a not-found error for a backend name.
    #[must_use]
    pub fn backend_not_found(name: impl Into<String>) -> Self {
        Self::NotFound { kind: ResourceKind::Backend, name: name.into() }
    }

    /// Returns true if retrying the operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::BackendTransient { .. })
    }

    /// Returns true if the error is a classified permanent backend failure.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::BackendPermanent { .. } | Self::NoCapableBackend { .. })
    }

    /// Returns true if the error reports a missing resource.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
