// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Tessera Authors

//! WAL record types.
//!
//! The log is a sequence of records, each tagged with a monotonically
//! increasing sequence number. An intent is logged once as an
//! [`WalRecord::Intent`] before anything touches a backend; every later state
//! change is appended as a [`WalRecord::Transition`]. Nothing is rewritten in
//! place.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tessera_core::{IntentId, OperationIntent};

/// Lifecycle state of a logged intent.
///
/// States only move forward:
///
/// ```text
/// Pending -> Dispatched -> Committed
///    |          | ^
///    |          +-+  (next attempt)
///    |          |
///    +----------+--> Failed -> Abandoned (retry budget exhausted)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntentState {
    /// Logged, no backend call made yet.
    Pending,
    /// A backend call is (or was) in flight.
    Dispatched,
    /// A backend acknowledged the operation.
    Committed,
    /// The operation failed.
    Failed,
    /// Every allowed attempt failed transiently.
    Abandoned,
}

impl IntentState {
    /// Returns true for states no normal dispatch moves out of.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::Failed | Self::Abandoned)
    }

    /// Returns a lowercase name for the state.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Dispatched => "dispatched",
            Self::Committed => "committed",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }

    /// Position in the lattice, used to check monotonicity.
    #[must_use]
    pub const fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Dispatched => 1,
            Self::Committed | Self::Failed => 2,
            Self::Abandoned => 3,
        }
    }
}

impl fmt::Display for IntentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Details carried by a state transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionDetail {
    /// Backend involved (dispatch target or committing backend).
    pub backend: Option<String>,
    /// Ordered candidate list, recorded with the first dispatch.
    pub candidates: Vec<String>,
    /// Attempt number, starting at 1, for dispatch transitions.
    pub attempt: Option<u32>,
    /// Error text for failures.
    pub error: Option<String>,
    /// Set on a failure caused by an exhausted retry budget.
    pub exhausted: bool,
}

/// A requested state change for one intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRequest {
    /// Target state.
    pub to: IntentState,
    /// Transition details.
    pub detail: TransitionDetail,
}

impl TransitionRequest {
    /// Records dispatch attempt `attempt` against `backend`.
    pub fn dispatched(attempt: u32, backend: impl Into<String>, candidates: Vec<String>) -> Self {
        Self {
            to: IntentState::Dispatched,
            detail: TransitionDetail {
                backend: Some(backend.into()),
                candidates,
                attempt: Some(attempt),
                ..Default::default()
            },
        }
    }

    /// Records a backend acknowledgement.
    pub fn committed(backend: impl Into<String>) -> Self {
        Self {
            to: IntentState::Committed,
            detail: TransitionDetail { backend: Some(backend.into()), ..Default::default() },
        }
    }

    /// Records a failure. `exhausted` marks a failure caused by running out
    /// of retry budget, which must be followed by [`Self::abandoned`].
    pub fn failed(error: impl Into<String>, exhausted: bool) -> Self {
        Self {
            to: IntentState::Failed,
            detail: TransitionDetail { error: Some(error.into()), exhausted, ..Default::default() },
        }
    }

    /// Records abandonment after retry exhaustion.
    pub fn abandoned(error: impl Into<String>) -> Self {
        Self {
            to: IntentState::Abandoned,
            detail: TransitionDetail { error: Some(error.into()), ..Default::default() },
        }
    }
}

/// A state change as persisted in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// The intent changing state.
    pub intent_id: IntentId,
    /// New state.
    pub to: IntentState,
    /// Transition details.
    pub detail: TransitionDetail,
    /// When the transition was logged.
    pub timestamp: DateTime<Utc>,
}

impl TransitionRecord {
    /// Stamps a request for `intent_id` with the current time.
    #[must_use]
    pub fn new(intent_id: IntentId, request: TransitionRequest) -> Self {
        Self { intent_id, to: request.to, detail: request.detail, timestamp: Utc::now() }
    }
}

/// A single record in the write-ahead log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalRecord {
    /// A new intent, logged in the `Pending` state.
    Intent {
        /// Snapshot of the submitted intent.
        intent: OperationIntent,
        /// When the intent was logged.
        timestamp: DateTime<Utc>,
    },

    /// A state change for a previously logged intent.
    Transition(TransitionRecord),

    /// Every record with a sequence at or below `sequence` belongs to an
    /// intent that has been reclaimed.
    Checkpoint {
        /// Highest reclaimed sequence number.
        sequence: u64,
        /// Every intent id reclaimed so far, including by earlier
        /// checkpoints. Reclaimed ids stay retired.
        reclaimed: Vec<IntentId>,
        /// When the checkpoint was written.
        timestamp: DateTime<Utc>,
    },
}

impl WalRecord {
    /// Returns the intent id this record belongs to, if any.
    #[must_use]
    pub fn intent_id(&self) -> Option<&IntentId> {
        match self {
            Self::Intent { intent, .. } => Some(&intent.id),
            Self::Transition(t) => Some(&t.intent_id),
            Self::Checkpoint { .. } => None,
        }
    }

    /// Returns true if this is a checkpoint marker.
    #[must_use]
    pub fn is_checkpoint(&self) -> bool {
        matches!(self, Self::Checkpoint { .. })
    }
}

/// A record with its log sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencedRecord {
    /// Sequence number.
    pub sequence: u64,
    /// The record.
    pub record: WalRecord,
}
