// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Tessera Authors

//! In-memory projection of one intent's log records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tessera_core::{IntentId, OperationIntent};

use crate::error::{Result, WalError};
use crate::record::{IntentState, TransitionRecord};

/// One dispatch attempt as recorded in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchAttempt {
    /// Attempt number, starting at 1 and counted across restarts.
    pub attempt: u32,
    /// Backend the attempt was sent to.
    pub backend: String,
    /// When the attempt was logged.
    pub at: DateTime<Utc>,
}

/// A state the entry entered, with its timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    /// State entered.
    pub state: IntentState,
    /// When it was entered.
    pub at: DateTime<Utc>,
}

/// The current view of a logged intent, built by replaying its records.
///
/// Live transitions and replay both go through [`WalEntry::apply`], so the
/// projection after a restart is identical to the one before it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalEntry {
    /// Snapshot of the submitted intent.
    pub intent: OperationIntent,
    /// Latest durable state.
    pub state: IntentState,
    /// Candidate backends chosen for the intent, in order.
    pub candidates: Vec<String>,
    /// Every dispatch attempt made so far.
    pub attempts: Vec<DispatchAttempt>,
    /// Backend that acknowledged the operation.
    pub committed_backend: Option<String>,
    /// Most recent error detail.
    pub last_error: Option<String>,
    /// Whether the failure was caused by retry exhaustion.
    pub exhausted: bool,
    /// States entered, oldest first.
    pub transitions: Vec<StateChange>,
    /// Sequence of the intent record.
    pub first_sequence: u64,
    /// Sequence of the latest record for this intent.
    pub last_sequence: u64,
}

impl WalEntry {
    /// Creates the projection for a freshly logged intent.
    #[must_use]
    pub fn new(sequence: u64, intent: OperationIntent, timestamp: DateTime<Utc>) -> Self {
        Self {
            intent,
            state: IntentState::Pending,
            candidates: Vec::new(),
            attempts: Vec::new(),
            committed_backend: None,
            last_error: None,
            exhausted: false,
            transitions: vec![StateChange { state: IntentState::Pending, at: timestamp }],
            first_sequence: sequence,
            last_sequence: sequence,
        }
    }

    /// The intent id.
    #[must_use]
    pub fn id(&self) -> &IntentId {
        &self.intent.id
    }

    /// Number of dispatch attempts recorded.
    #[must_use]
    pub fn attempt_count(&self) -> u32 {
        u32::try_from(self.attempts.len()).unwrap_or(u32::MAX)
    }

    /// Number of attempts sent to `backend`.
    #[must_use]
    pub fn attempts_against(&self, backend: &str) -> u32 {
        let count = self.attempts.iter().filter(|a| a.backend == backend).count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    /// Backend of the most recent attempt.
    #[must_use]
    pub fn last_backend(&self) -> Option<&str> {
        self.attempts.last().map(|a| a.backend.as_str())
    }

    /// Returns true once the entry reached a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Returns true when no further transition will ever be logged.
    ///
    /// A failure caused by retry exhaustion still owes its `Abandoned`
    /// record and is not settled.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        match self.state {
            IntentState::Committed | IntentState::Abandoned => true,
            IntentState::Failed => !self.exhausted,
            IntentState::Pending | IntentState::Dispatched => false,
        }
    }

    /// Returns true if recovery must re-drive this entry.
    #[must_use]
    pub fn needs_dispatch(&self) -> bool {
        matches!(self.state, IntentState::Pending | IntentState::Dispatched)
    }

    /// When the entry settled, if it has.
    #[must_use]
    pub fn settled_at(&self) -> Option<DateTime<Utc>> {
        if self.is_settled() {
            self.transitions.last().map(|t| t.at)
        } else {
            None
        }
    }

    /// Checks a transition against the state lattice without applying it.
    ///
    /// # Errors
    ///
    /// Returns [`WalError::InvalidTransition`] if the move is not allowed from
    /// the current state, or if a dispatch skips or repeats an attempt number.
    pub fn check(&self, record: &TransitionRecord) -> Result<()> {
        use IntentState::{Abandoned, Committed, Dispatched, Failed, Pending};

        let allowed = match (self.state, record.to) {
            (Pending, Dispatched) | (Dispatched, Dispatched) => {
                record.detail.attempt == Some(self.attempt_count().saturating_add(1))
                    && record.detail.backend.is_some()
            }
            (Dispatched, Committed) => record.detail.backend.is_some(),
            (Pending | Dispatched, Failed) => true,
            (Failed, Abandoned) => self.exhausted,
            _ => false,
        };

        if allowed && record.intent_id == self.intent.id {
            Ok(())
        } else {
            Err(WalError::InvalidTransition {
                intent_id: record.intent_id.clone(),
                from: self.state,
                to: record.to,
            })
        }
    }

    /// Applies a transition logged at `sequence`.
    ///
    /// # Errors
    ///
    /// Returns [`WalError::InvalidTransition`] if [`WalEntry::check`] rejects
    /// the transition; the entry is left unchanged.
    pub fn apply(&mut self, sequence: u64, record: &TransitionRecord) -> Result<()> {
        self.check(record)?;

        let detail = &record.detail;
        match record.to {
            IntentState::Dispatched => {
                if !detail.candidates.is_empty() {
                    self.candidates.clone_from(&detail.candidates);
                }
                self.attempts.push(DispatchAttempt {
                    attempt: detail.attempt.unwrap_or_default(),
                    backend: detail.backend.clone().unwrap_or_default(),
                    at: record.timestamp,
                });
            }
            IntentState::Committed => {
                self.committed_backend.clone_from(&detail.backend);
            }
            IntentState::Failed => {
                self.last_error.clone_from(&detail.error);
                self.exhausted = detail.exhausted;
            }
            IntentState::Abandoned => {
                if detail.error.is_some() {
                    self.last_error.clone_from(&detail.error);
                }
            }
            IntentState::Pending => {}
        }

        if record.to != self.state {
            self.transitions.push(StateChange { state: record.to, at: record.timestamp });
        }
        self.state = record.to;
        self.last_sequence = sequence;
        Ok(())
    }
}
