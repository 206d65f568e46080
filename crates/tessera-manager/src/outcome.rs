// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Tessera Authors

//! Terminal outcomes of intents.
//!
//! Live dispatch and replay derive outcomes from the same logged entry, so a
//! caller who resubmits a finished intent sees exactly what the first caller
//! saw.

use tessera_core::{ContentRef, Error, IntentId, IntentKind};
use tessera_wal::{IntentState, WalEntry};

/// A successfully committed intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResult {
    /// The intent.
    pub intent_id: IntentId,
    /// Its operation.
    pub kind: IntentKind,
    /// The content it targeted.
    pub content: ContentRef,
    /// Backend that acknowledged it.
    pub backend: String,
    /// Dispatch attempts it took, across restarts.
    pub attempts: u32,
}

/// What a caller eventually receives for an intent.
pub type Outcome = tessera_core::Result<OperationResult>;

/// Derives the caller-visible outcome of a logged entry.
///
/// Returns `None` while the entry can still make progress.
#[must_use]
pub fn outcome_of(entry: &WalEntry) -> Option<Outcome> {
    let last_error = || entry.last_error.clone().unwrap_or_default();
    match entry.state {
        IntentState::Committed => Some(Ok(OperationResult {
            intent_id: entry.id().clone(),
            kind: entry.intent.kind,
            content: entry.intent.content.clone(),
            backend: entry
                .committed_backend
                .clone()
                .or_else(|| entry.last_backend().map(str::to_string))
                .unwrap_or_default(),
            attempts: entry.attempt_count(),
        })),
        IntentState::Failed if entry.exhausted => None,
        IntentState::Failed => Some(Err(match entry.last_backend() {
            Some(backend) => {
                Error::BackendPermanent { backend: backend.to_string(), message: last_error() }
            }
            None => Error::NoCapableBackend {
                capability: entry.intent.kind.required_capability().to_string(),
            },
        })),
        IntentState::Abandoned => Some(Err(Error::RetryBudgetExhausted {
            attempts: entry.attempt_count(),
            last_error: last_error(),
        })),
        IntentState::Pending | IntentState::Dispatched => None,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tessera_core::OperationIntent;
    use tessera_wal::DispatchAttempt;

    use super::*;

    fn entry(state: IntentState) -> WalEntry {
        let mut entry = WalEntry::new(1, OperationIntent::pin("bafy").with_id("i-1"), Utc::now());
        entry.state = state;
        entry
    }

    fn attempt(n: u32, backend: &str) -> DispatchAttempt {
        DispatchAttempt { attempt: n, backend: backend.to_string(), at: Utc::now() }
    }

    #[test]
    fn test_open_entries_have_no_outcome() {
        assert!(outcome_of(&entry(IntentState::Pending)).is_none());
        assert!(outcome_of(&entry(IntentState::Dispatched)).is_none());

        let mut exhausted = entry(IntentState::Failed);
        exhausted.exhausted = true;
        assert!(outcome_of(&exhausted).is_none());
    }

    #[test]
    fn test_committed() {
        let mut e = entry(IntentState::Committed);
        e.attempts = vec![attempt(1, "remote"), attempt(2, "local")];
        e.committed_backend = Some("local".to_string());

        let result = outcome_of(&e).unwrap().unwrap();
        assert_eq!(result.backend, "local");
        assert_eq!(result.attempts, 2);
        assert_eq!(result.intent_id.as_str(), "i-1");
    }

    #[test]
    fn test_failed() {
        let mut e = entry(IntentState::Failed);
        e.attempts = vec![attempt(1, "local")];
        e.last_error = Some("invalid reference: bafy".to_string());
        assert_eq!(
            outcome_of(&e).unwrap(),
            Err(Error::BackendPermanent {
                backend: "local".to_string(),
                message: "invalid reference: bafy".to_string(),
            })
        );

        let undispatched = entry(IntentState::Failed);
        assert!(matches!(
            outcome_of(&undispatched).unwrap(),
            Err(Error::NoCapableBackend { .. })
        ));
    }

    #[test]
    fn test_abandoned() {
        let mut e = entry(IntentState::Abandoned);
        e.attempts = vec![attempt(1, "a"), attempt(2, "b"), attempt(3, "a")];
        e.last_error = Some("connection failed: reset".to_string());
        assert_eq!(
            outcome_of(&e).unwrap(),
            Err(Error::RetryBudgetExhausted {
                attempts: 3,
                last_error: "connection failed: reset".to_string(),
            })
        );
    }
}
