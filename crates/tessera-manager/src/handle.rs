// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Tessera Authors

//! Completion handles for submitted intents.

use std::fmt;

use tessera_core::{Error, IntentId};
use tokio::sync::watch;

use crate::outcome::Outcome;

/// A handle to an intent whose outcome may not be known yet.
///
/// Handles are cheap to clone; every clone observes the same outcome, which
/// is set exactly once.
#[derive(Clone)]
pub struct OperationHandle {
    intent_id: IntentId,
    rx: watch::Receiver<Option<Outcome>>,
}

impl OperationHandle {
    /// The intent this handle tracks.
    #[must_use]
    pub fn intent_id(&self) -> &IntentId {
        &self.intent_id
    }

    /// Returns the outcome if it has arrived.
    #[must_use]
    pub fn try_outcome(&self) -> Option<Outcome> {
        self.rx.borrow().clone()
    }

    /// Returns true once the outcome has arrived.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Waits for the outcome.
    ///
    /// Resolves to [`Error::ShuttingDown`] if the manager went away before
    /// the intent finished.
    pub async fn wait(&self) -> Outcome {
        let mut rx = self.rx.clone();
        let outcome = rx.wait_for(Option::is_some).await.ok().and_then(|slot| slot.clone());
        outcome.unwrap_or(Err(Error::ShuttingDown))
    }
}

impl fmt::Debug for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationHandle")
            .field("intent_id", &self.intent_id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// The sending half of an [`OperationHandle`].
pub(crate) struct Completion {
    tx: watch::Sender<Option<Outcome>>,
}

impl Completion {
    pub(crate) fn new(intent_id: IntentId) -> (Self, OperationHandle) {
        let (tx, rx) = watch::channel(None);
        (Self { tx }, OperationHandle { intent_id, rx })
    }

    /// Fulfils the handle. Only the first call has any effect.
    pub(crate) fn complete(&self, outcome: Outcome) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::OperationResult;
    use tessera_core::{ContentRef, IntentKind};

    fn committed(id: &str) -> Outcome {
        Ok(OperationResult {
            intent_id: IntentId::new(id),
            kind: IntentKind::Pin,
            content: ContentRef::new("bafy"),
            backend: "local".to_string(),
            attempts: 1,
        })
    }

    #[tokio::test]
    async fn test_fulfilled_once() {
        let (completion, handle) = Completion::new(IntentId::new("a"));
        assert!(!handle.is_finished());

        assert!(completion.complete(committed("a")));
        assert!(!completion.complete(Err(Error::ShuttingDown)));

        assert_eq!(handle.wait().await, committed("a"));
        assert_eq!(handle.clone().try_outcome(), Some(committed("a")));
    }

    #[tokio::test]
    async fn test_waiters_share_the_outcome() {
        let (completion, handle) = Completion::new(IntentId::new("a"));
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let handle = handle.clone();
                tokio::spawn(async move { handle.wait().await })
            })
            .collect();

        tokio::task::yield_now().await;
        completion.complete(committed("a"));
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), committed("a"));
        }
    }

    #[tokio::test]
    async fn test_dropped_completion_reports_shutdown() {
        let (completion, handle) = Completion::new(IntentId::new("a"));
        drop(completion);
        assert_eq!(handle.wait().await, Err(Error::ShuttingDown));
    }
}
