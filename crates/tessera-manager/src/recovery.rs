// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Tessera Authors

//! Startup recovery.
//!
//! Replays the log projection and re-drives every intent that had not
//! settled when the process stopped. A `Pending` or `Dispatched` entry is
//! treated exactly like a crash in the middle of dispatch and continues from
//! its recorded attempt count. A `Failed` entry flagged as retry-exhausted is
//! rolled forward to `Abandoned`.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use tessera_core::{Error, IntentId};
use tessera_wal::{IntentState, WriteAheadLog};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::dispatcher::Dispatcher;
use crate::outcome::Outcome;

/// What one recovery pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    /// Entries in the log projection.
    pub scanned: usize,
    /// Entries that were re-driven.
    pub resumed: usize,
    /// Resumed entries found `Pending`.
    pub pending: usize,
    /// Resumed entries found `Dispatched`.
    pub dispatched: usize,
    /// Retry-exhausted failures rolled forward to `Abandoned`.
    pub rolled_forward: usize,
    /// Resumed entries that committed.
    pub committed: usize,
    /// Resumed entries that failed permanently.
    pub failed: usize,
    /// Resumed entries that were abandoned.
    pub abandoned: usize,
    /// Resumed entries left open by a log failure or shutdown.
    pub interrupted: usize,
    /// Log checkpoint at the start of recovery.
    pub checkpoint: u64,
    /// Whether replay found and truncated a damaged log tail.
    pub corruption_detected: bool,
    /// Outcome of every resumed entry.
    pub outcomes: Vec<(IntentId, Outcome)>,
    /// Time the pass took.
    pub elapsed: Duration,
}

impl RecoveryReport {
    fn record(&mut self, intent_id: IntentId, outcome: Outcome) {
        match &outcome {
            Ok(_) => self.committed += 1,
            Err(Error::RetryBudgetExhausted { .. }) => self.abandoned += 1,
            Err(Error::LogWrite(_) | Error::ShuttingDown) => self.interrupted += 1,
            Err(_) => self.failed += 1,
        }
        self.outcomes.push((intent_id, outcome));
    }
}

/// Re-drives unsettled intents after a restart.
pub struct RecoveryRunner {
    wal: Arc<WriteAheadLog>,
    dispatcher: Arc<Dispatcher>,
}

impl RecoveryRunner {
    /// Creates a runner.
    #[must_use]
    pub fn new(wal: Arc<WriteAheadLog>, dispatcher: Arc<Dispatcher>) -> Self {
        Self { wal, dispatcher }
    }

    /// Runs one recovery pass to completion.
    ///
    /// Entries are re-driven concurrently; backend calls stay within the
    /// dispatcher's concurrency limits.
    pub async fn run(&self) -> RecoveryReport {
        let started = Instant::now();
        let unsettled = self.wal.unsettled();
        let mut report = RecoveryReport {
            scanned: self.wal.len(),
            resumed: unsettled.len(),
            checkpoint: self.wal.checkpoint(),
            corruption_detected: self.wal.corruption_detected(),
            ..RecoveryReport::default()
        };

        if report.corruption_detected {
            warn!(checkpoint = report.checkpoint, "Log tail was damaged and has been truncated");
        }
        info!(
            scanned = report.scanned,
            unsettled = report.resumed,
            checkpoint = report.checkpoint,
            "Starting recovery"
        );

        let mut drives = JoinSet::new();
        for entry in unsettled {
            match entry.state {
                IntentState::Pending => report.pending += 1,
                IntentState::Dispatched => report.dispatched += 1,
                _ => report.rolled_forward += 1,
            }
            let dispatcher = Arc::clone(&self.dispatcher);
            drives.spawn(async move {
                let id = entry.id().clone();
                (id, dispatcher.resume(entry).await)
            });
        }

        while let Some(joined) = drives.join_next().await {
            match joined {
                Ok((id, outcome)) => report.record(id, outcome),
                Err(e) => {
                    warn!(error = %e, "Recovery task failed");
                    report.interrupted += 1;
                }
            }
        }

        report.elapsed = started.elapsed();
        counter!("tessera_recovery_resumed_total").increment(report.resumed as u64);
        histogram!("tessera_recovery_seconds").record(report.elapsed.as_secs_f64());
        info!(
            committed = report.committed,
            failed = report.failed,
            abandoned = report.abandoned,
            interrupted = report.interrupted,
            elapsed_ms = report.elapsed.as_millis(),
            "Recovery complete"
        );
        report
    }
}
