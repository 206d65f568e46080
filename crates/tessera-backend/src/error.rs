// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Tessera Authors

//! Errors reported by backend adapters.

use std::time::Duration;

use thiserror::Error;

/// Result type for backend adapter calls.
pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// A failure reported by a backend adapter.
///
/// Every variant is either transient (worth retrying, possibly elsewhere) or
/// permanent (the request itself is at fault). Adapters must pick the variant
/// that matches what the backend actually said.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// The call did not complete in time.
    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The backend could not be reached.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The backend asked us to slow down.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The backend is temporarily unable to serve requests.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The content reference or payload is malformed.
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    /// The backend refused our credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The content does not exist on the backend.
    #[error("not found: {0}")]
    NotFound(String),

    /// The backend does not implement the operation.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl AdapterError {
    /// Returns true if the same request may succeed later.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Connection(_) | Self::RateLimited(_) | Self::Unavailable(_)
        )
    }

    /// Classifies the failure into the caller-visible taxonomy.
    #[must_use]
    pub fn classify(&self, backend: &str) -> tessera_core::Error {
        let backend = backend.to_string();
        let message = self.to_string();
        if self.is_transient() {
            tessera_core::Error::BackendTransient { backend, message }
        } else {
            tessera_core::Error::BackendPermanent { backend, message }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let transient = [
            AdapterError::Timeout(Duration::from_millis(250)),
            AdapterError::Connection("reset".into()),
            AdapterError::RateLimited("429".into()),
            AdapterError::Unavailable("503".into()),
        ];
        for err in &transient {
            assert!(err.is_transient(), "{err} should be transient");
            assert!(err.classify("remote").is_transient());
        }

        let permanent = [
            AdapterError::InvalidReference("not a cid".into()),
            AdapterError::Unauthorized("bad token".into()),
            AdapterError::NotFound("bafy".into()),
            AdapterError::Unsupported("unpin".into()),
        ];
        for err in &permanent {
            assert!(!err.is_transient(), "{err} should be permanent");
            assert!(err.classify("remote").is_permanent());
        }
    }

    #[test]
    fn test_display() {
        let err = AdapterError::Timeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "timed out after 1500ms");
        let classified = err.classify("archive");
        assert_eq!(
            classified.to_string(),
            "backend archive transient failure: timed out after 1500ms"
        );
    }
}
