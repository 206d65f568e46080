// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Tessera Authors

//! Operation dispatch with retry and failover.
//!
//! Every intent is driven through the same loop, whether it was just
//! submitted or recovered from the log:
//!
//! 1. Plan candidate backends from the current health snapshot.
//! 2. Log `Dispatched` for the attempt, then call the backend.
//! 3. On success log `Committed`.
//! 4. On a permanent error log `Failed` and stop.
//! 5. On a transient error back off and move on to the next candidate,
//!    wrapping around, until the retry budget is spent. Then log `Failed`
//!    (exhausted) followed by `Abandoned`.
//!
//! Attempts are counted from the log, so a recovered intent continues from
//! its recorded attempt count rather than starting over.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use rand::Rng;
use tessera_backend::{perform, AdapterError, AdapterResult, BackendRegistry, Signal};
use tessera_core::{DispatchConfig, Error, OperationIntent};
use tessera_wal::{IntentState, TransitionRequest, WalEntry, WriteAheadLog};
use tokio::sync::{watch, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::outcome::{outcome_of, Outcome};
use crate::policy::{CandidatePlan, PolicyEngine};

/// Drives intents to a terminal state.
pub struct Dispatcher {
    wal: Arc<WriteAheadLog>,
    registry: Arc<BackendRegistry>,
    policy: PolicyEngine,
    config: DispatchConfig,
    global: Arc<Semaphore>,
    shutdown: watch::Receiver<bool>,
}

impl Dispatcher {
    /// Creates a dispatcher.
    ///
    /// Backoff waits end early once `shutdown` turns true.
    #[must_use]
    pub fn new(
        wal: Arc<WriteAheadLog>,
        registry: Arc<BackendRegistry>,
        policy: PolicyEngine,
        config: DispatchConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let global = Arc::new(Semaphore::new(config.global_concurrency.max(1)));
        Self { wal, registry, policy, config, global, shutdown }
    }

    /// The policy engine used for planning.
    #[must_use]
    pub fn policy(&self) -> &PolicyEngine {
        &self.policy
    }

    /// The dispatch configuration.
    #[must_use]
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Logs a new intent and drives it to a terminal state.
    ///
    /// # Errors
    ///
    /// Returns the intent's failure, or [`Error::LogWrite`] if the log could
    /// not record it. Nothing is sent to a backend before the intent is
    /// logged.
    pub async fn execute(&self, intent: OperationIntent) -> Outcome {
        intent.validate()?;
        let entry = self.wal.append(intent).await?;
        debug!(intent_id = %entry.id(), kind = %entry.intent.kind, "Intent logged");
        self.drive(entry).await
    }

    /// Continues an intent recovered from the log.
    ///
    /// # Errors
    ///
    /// As [`Self::execute`].
    pub async fn resume(&self, entry: WalEntry) -> Outcome {
        info!(
            intent_id = %entry.id(),
            state = %entry.state,
            attempts = entry.attempt_count(),
            "Resuming intent"
        );
        self.drive(entry).await
    }

    async fn drive(&self, mut entry: WalEntry) -> Outcome {
        let id = entry.id().clone();

        if entry.state == IntentState::Failed && entry.exhausted {
            let error = entry.last_error.clone().unwrap_or_default();
            entry = self.wal.transition(&id, TransitionRequest::abandoned(error)).await?;
        }
        if let Some(outcome) = outcome_of(&entry) {
            return outcome;
        }

        let plan = self.plan(&entry.intent);
        if plan.is_empty() {
            let error = Error::NoCapableBackend {
                capability: entry.intent.kind.required_capability().to_string(),
            };
            warn!(intent_id = %id, error = %error, "No backend can serve intent");
            let request = TransitionRequest::failed(error.to_string(), false);
            entry = self.wal.transition(&id, request).await?;
            return finish(&entry);
        }
        if plan.last_resort {
            warn!(intent_id = %id, "Every capable backend is unreachable, trying anyway");
        }

        let budget = self.config.retry_budget.max(1);
        let mut first = true;
        let mut last_error = entry.last_error.clone();

        loop {
            let attempt = entry.attempt_count() + 1;
            if attempt > budget {
                let error = last_error.unwrap_or_else(|| "retry budget exhausted".to_string());
                warn!(intent_id = %id, attempts = budget, error = %error, "Retry budget exhausted");
                let request = TransitionRequest::failed(error.clone(), true);
                self.wal.transition(&id, request).await?;
                entry = self.wal.transition(&id, TransitionRequest::abandoned(error)).await?;
                return finish(&entry);
            }

            // rotation is by attempt number so resumed intents keep moving
            let Some(backend) = plan.candidate_for(attempt).map(str::to_string) else {
                return Err(Error::NoCapableBackend {
                    capability: entry.intent.kind.required_capability().to_string(),
                });
            };
            let candidates = if first { plan.candidates.clone() } else { Vec::new() };
            first = false;

            entry = self
                .wal
                .transition(&id, TransitionRequest::dispatched(attempt, &backend, candidates))
                .await?;

            match self.call(&backend, &entry.intent).await {
                Ok(()) => {
                    entry = self.wal.transition(&id, TransitionRequest::committed(&backend)).await?;
                    debug!(intent_id = %id, backend = %backend, attempt, "Intent committed");
                    return finish(&entry);
                }
                Err(e) if !e.is_transient() => {
                    warn!(intent_id = %id, backend = %backend, error = %e, "Permanent failure");
                    entry = self
                        .wal
                        .transition(&id, TransitionRequest::failed(e.to_string(), false))
                        .await?;
                    return finish(&entry);
                }
                Err(e) => {
                    last_error = Some(e.to_string());
                    if attempt >= budget {
                        continue;
                    }
                    let delay = self.backoff_for(attempt);
                    warn!(
                        intent_id = %id,
                        backend = %backend,
                        attempt,
                        budget,
                        error = %e,
                        delay_ms = delay.as_millis(),
                        "Transient failure, retrying"
                    );
                    counter!("tessera_dispatch_retries_total", "backend" => backend.clone())
                        .increment(1);
                    if !self.wait_unless_shutdown(delay).await {
                        info!(intent_id = %id, "Stopping retries for shutdown");
                        return Err(Error::ShuttingDown);
                    }
                }
            }
        }
    }

    fn plan(&self, intent: &OperationIntent) -> CandidatePlan {
        let snapshot = self.registry.health().snapshot();
        let descriptors = self.registry.descriptors();
        self.policy.plan(intent, &snapshot, &descriptors)
    }

    /// Calls `backend` once, holding the global and per-backend permits only
    /// for the duration of the call, and feeds the outcome to its health.
    async fn call(&self, backend: &str, intent: &OperationIntent) -> AdapterResult<()> {
        let Some(registered) = self.registry.get(backend) else {
            return Err(AdapterError::Unavailable(format!("backend {backend} is not registered")));
        };

        let _global = Arc::clone(&self.global)
            .acquire_owned()
            .await
            .map_err(|_| AdapterError::Unavailable("dispatcher closed".to_string()))?;
        let _slot = Arc::clone(registered.permits())
            .acquire_owned()
            .await
            .map_err(|_| AdapterError::Unavailable(format!("backend {backend} closed")))?;

        let timeout = self.config.call_timeout();
        let started = Instant::now();
        let call = perform(registered.adapter().as_ref(), intent);
        let result = match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Timeout(timeout)),
        };
        let latency = started.elapsed();

        // a permanent error still means the backend answered
        let signal = match &result {
            Err(e) if e.is_transient() => Signal::Failure(latency),
            _ => Signal::Success(latency),
        };
        self.registry.health().record(backend, signal);

        let outcome = match &result {
            Ok(()) => "success",
            Err(e) if e.is_transient() => "transient",
            Err(_) => "permanent",
        };
        counter!(
            "tessera_dispatch_calls_total",
            "backend" => backend.to_string(),
            "outcome" => outcome
        )
        .increment(1);
        histogram!("tessera_dispatch_call_seconds", "backend" => backend.to_string())
            .record(latency.as_secs_f64());

        result
    }

    /// Backoff before the retry following `attempt`.
    ///
    /// `min(base * 2^(attempt - 1), max)`, spread by the configured jitter
    /// fraction in both directions.
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay_ms = self
            .config
            .base_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.config.max_backoff_ms);

        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || delay_ms == 0 {
            return Duration::from_millis(delay_ms);
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
        Duration::from_secs_f64(delay_ms as f64 * factor / 1000.0)
    }

    /// Sleeps for `delay`. Returns false if shutdown began first.
    async fn wait_unless_shutdown(&self, delay: Duration) -> bool {
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return false;
        }
        let stopping = async move {
            if shutdown.wait_for(|stop| *stop).await.is_err() {
                // nobody can signal shutdown any more
                std::future::pending::<()>().await;
            }
        };
        tokio::select! {
            () = tokio::time::sleep(delay) => true,
            () = stopping => false,
        }
    }
}

fn finish(entry: &WalEntry) -> Outcome {
    let outcome = outcome_of(entry).unwrap_or_else(|| {
        Err(Error::LogWrite(format!("intent {} was left in state {}", entry.id(), entry.state)))
    });
    counter!("tessera_intents_finished_total", "state" => entry.state.as_str()).increment(1);
    outcome
}
