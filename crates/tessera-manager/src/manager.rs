// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Tessera Authors

//! The unified storage manager.
//!
//! [`StorageManager`] is the caller-facing surface. It owns the log, the
//! backend registry, the dispatcher and the background tasks (health probing
//! and log compaction), and tracks every intent currently being driven so
//! that a second submission of the same id joins the first instead of
//! starting another call sequence.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use tessera_backend::{
    BackendAdapter, BackendRegistry, HealthBoard, HealthEvent, HealthMonitor, HealthSnapshot,
    HealthState,
};
use tessera_core::{
    BackendDescriptor, Config, Error, IntentId, IntentKind, OperationIntent, Result,
};
use tessera_wal::{
    CompactionStats, FileLogStorage, IntentState, LogStorage, WalEntry, WalError, WriteAheadLog,
};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::handle::{Completion, OperationHandle};
use crate::outcome::{outcome_of, OperationResult, Outcome};
use crate::policy::PolicyEngine;
use crate::recovery::{RecoveryReport, RecoveryRunner};

/// Result of a submission.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// The intent committed within the bounded wait.
    Completed(OperationResult),
    /// The intent is still running.
    Pending(OperationHandle),
}

impl SubmitOutcome {
    /// Returns true if the caller got a handle rather than a result.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }

    /// The result, if the intent already committed.
    #[must_use]
    pub fn completed(self) -> Option<OperationResult> {
        match self {
            Self::Completed(result) => Some(result),
            Self::Pending(_) => None,
        }
    }

    /// Waits for the final outcome, whichever form the submission took.
    pub async fn wait(self) -> Outcome {
        match self {
            Self::Completed(result) => Ok(result),
            Self::Pending(handle) => handle.wait().await,
        }
    }
}

/// Published when an intent reaches a terminal state.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalEvent {
    /// The intent.
    pub intent_id: IntentId,
    /// Its terminal state.
    pub state: IntentState,
    /// What its callers received.
    pub outcome: Outcome,
    /// When the event was published.
    pub at: DateTime<Utc>,
}

enum Work {
    Execute(OperationIntent),
    Resume(WalEntry),
}

enum Admission {
    Finished(Outcome),
    Running(OperationHandle),
}

struct InFlight {
    completion: Completion,
    handle: OperationHandle,
}

struct Inner {
    config: Config,
    wal: Arc<WriteAheadLog>,
    registry: Arc<BackendRegistry>,
    dispatcher: Arc<Dispatcher>,
    in_flight: DashMap<IntentId, InFlight>,
    active_drives: watch::Sender<usize>,
    events: broadcast::Sender<TerminalEvent>,
    ready: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
    closed: AtomicBool,
    monitor: tokio::sync::Mutex<HealthMonitor>,
    compactor: Mutex<Option<JoinHandle<()>>>,
}

/// Coordinates intents across storage backends.
///
/// Cloning is cheap; clones share the same manager.
#[derive(Clone)]
pub struct StorageManager {
    inner: Arc<Inner>,
}

impl StorageManager {
    /// Creates a manager on top of `storage`.
    ///
    /// The log is replayed immediately, but nothing is re-driven until
    /// [`Self::start`].
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the log cannot
    /// be replayed.
    pub async fn new(config: Config, storage: Arc<dyn LogStorage>) -> Result<Self> {
        config.validate()?;
        let wal = Arc::new(WriteAheadLog::open(storage).await?);

        let health = Arc::new(HealthBoard::new(config.health.clone()));
        let registry =
            Arc::new(BackendRegistry::new(health, config.dispatch.per_backend_concurrency));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&wal),
            Arc::clone(&registry),
            PolicyEngine::new(&config.policy),
            config.dispatch.clone(),
            shutdown_rx,
        ));
        let monitor = HealthMonitor::new(Arc::clone(&registry));
        let (events, _) = broadcast::channel(1024);

        info!(
            entries = wal.len(),
            last_sequence = wal.last_sequence(),
            checkpoint = wal.checkpoint(),
            "Storage manager created"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                wal,
                registry,
                dispatcher,
                in_flight: DashMap::new(),
                active_drives: watch::channel(0).0,
                events,
                ready: watch::channel(false).0,
                shutdown,
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                monitor: tokio::sync::Mutex::new(monitor),
                compactor: Mutex::new(None),
            }),
        })
    }

    /// Creates a manager with a file-backed log in `config.wal.dir`.
    ///
    /// # Errors
    ///
    /// As [`Self::new`], plus failures to open the log directory.
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let storage = FileLogStorage::open(&config.wal.dir, config.wal.sync_mode)?;
        Self::new(config, Arc::new(storage)).await
    }

    /// Registers a backend, replacing any registered under the same name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid descriptor.
    pub fn register_backend(
        &self,
        descriptor: BackendDescriptor,
        adapter: Arc<dyn BackendAdapter>,
    ) -> Result<()> {
        self.inner.registry.register(descriptor, adapter)
    }

    /// Registers `adapter` under the descriptor configured for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the configuration has no backend
    /// called `name`.
    pub fn register_configured(&self, name: &str, adapter: Arc<dyn BackendAdapter>) -> Result<()> {
        let descriptor = self
            .inner
            .config
            .backends
            .iter()
            .find(|d| d.name == name)
            .cloned()
            .ok_or_else(|| Error::backend_not_found(name))?;
        self.register_backend(descriptor, adapter)
    }

    /// Recovers unsettled intents, then starts accepting submissions and
    /// launches health probing and log compaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the manager was already started, or
    /// [`Error::ShuttingDown`] if it was shut down before or during recovery.
    pub async fn start(&self) -> Result<RecoveryReport> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Config("storage manager already started".to_string()));
        }

        let runner =
            RecoveryRunner::new(Arc::clone(&self.inner.wal), Arc::clone(&self.inner.dispatcher));
        let report = runner.run().await;
        for (id, outcome) in &report.outcomes {
            self.inner.announce(id, outcome.clone());
        }

        // `closed` is read under the monitor lock; shutdown stops the
        // monitor under the same lock.
        let mut monitor = self.inner.monitor.lock().await;
        if self.inner.closed.load(Ordering::SeqCst) {
            info!(recovered = report.resumed, "Shut down during recovery");
            return Err(Error::ShuttingDown);
        }
        self.inner.ready.send_replace(true);
        monitor.start();
        *self.inner.compactor.lock() = self.inner.spawn_compactor();
        drop(monitor);

        info!(
            backends = self.inner.registry.len(),
            recovered = report.resumed,
            "Storage manager ready"
        );
        Ok(report)
    }

    /// Returns true once recovery has finished.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    /// Submits an intent.
    ///
    /// Waits for recovery to finish first. Migrations and intents whose
    /// primary backend is marked slow return a handle straight away; others
    /// return the result if it arrives within the configured bounded wait.
    ///
    /// Submitting an id that is already running joins it; submitting an id
    /// that already finished returns the recorded outcome without calling
    /// any backend. Ids reclaimed by compaction are rejected.
    ///
    /// # Errors
    ///
    /// Returns the intent's classified failure, [`Error::InvalidIntent`]
    /// for a malformed intent, or [`Error::ShuttingDown`].
    pub async fn submit(&self, intent: OperationIntent) -> Result<SubmitOutcome> {
        self.submit_with_cancel(intent, std::future::pending()).await
    }

    /// Like [`Self::submit`], but stops waiting once `cancel` resolves.
    ///
    /// Cancelling only abandons the wait. An intent that was already logged
    /// keeps running and its outcome stays available through
    /// [`Self::status`]; one cancelled while waiting for recovery is never
    /// logged.
    ///
    /// # Errors
    ///
    /// As [`Self::submit`], plus [`Error::Cancelled`].
    pub async fn submit_with_cancel<F>(
        &self,
        intent: OperationIntent,
        cancel: F,
    ) -> Result<SubmitOutcome>
    where
        F: Future<Output = ()>,
    {
        intent.validate()?;
        tokio::pin!(cancel);
        tokio::select! {
            biased;
            ready = self.wait_ready() => ready?,
            () = &mut cancel => {
                debug!(intent_id = %intent.id, "Caller stopped waiting before start");
                return Err(Error::Cancelled { intent_id: intent.id.to_string() });
            }
        }
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        let intent_id = intent.id.clone();
        let slow = self.is_slow(&intent);
        counter!("tessera_intents_submitted_total", "kind" => intent.kind.as_str()).increment(1);

        let handle = match self.inner.admit(intent) {
            Admission::Finished(outcome) => return outcome.map(SubmitOutcome::Completed),
            Admission::Running(handle) => handle,
        };
        if slow {
            debug!(intent_id = %intent_id, "Returning handle for slow intent");
            return Ok(SubmitOutcome::Pending(handle));
        }

        let waiter = handle.clone();
        tokio::select! {
            biased;
            outcome = waiter.wait() => outcome.map(SubmitOutcome::Completed),
            () = &mut cancel => {
                debug!(intent_id = %intent_id, "Caller stopped waiting");
                Err(Error::Cancelled { intent_id: intent_id.to_string() })
            }
            () = tokio::time::sleep(self.inner.config.dispatch.sync_wait()) => {
                Ok(SubmitOutcome::Pending(handle))
            }
        }
    }

    /// The logged state of an intent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown or reclaimed id.
    pub fn status(&self, intent_id: &IntentId) -> Result<WalEntry> {
        self.inner.wal.get(intent_id).ok_or_else(|| Error::intent_not_found(intent_id.as_str()))
    }

    /// Subscribes to terminal-state notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TerminalEvent> {
        self.inner.events.subscribe()
    }

    /// Current health of one backend.
    #[must_use]
    pub fn health(&self, backend: &str) -> Option<HealthState> {
        self.inner.registry.health().snapshot().get(backend).cloned()
    }

    /// Current health of every backend.
    #[must_use]
    pub fn health_snapshot(&self) -> Arc<HealthSnapshot> {
        self.inner.registry.health().snapshot()
    }

    /// Subscribes to backend health transitions.
    #[must_use]
    pub fn health_events(&self) -> broadcast::Receiver<HealthEvent> {
        self.inner.registry.health().subscribe()
    }

    /// Runs one compaction pass with the configured retention.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LogWrite`] if the checkpoint cannot be written.
    pub async fn compact(&self) -> Result<CompactionStats> {
        Ok(self.inner.wal.compact(self.inner.config.wal.retention()).await?)
    }

    /// Stops background work and waits for running intents to settle or
    /// park.
    ///
    /// Intents waiting out a retry backoff stop there and stay `Dispatched`
    /// for the next recovery. Calls already in flight finish first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LogWrite`] if the final log sync fails.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(in_flight = self.inner.in_flight.len(), "Shutting down storage manager");
        self.inner.shutdown.send_replace(true);

        self.inner.monitor.lock().await.stop().await;
        let compactor = self.inner.compactor.lock().take();
        if let Some(task) = compactor {
            if let Err(e) = task.await {
                warn!(error = %e, "Compaction task ended abnormally");
            }
        }

        let mut active = self.inner.active_drives.subscribe();
        let _ = active.wait_for(|n| *n == 0).await;

        self.inner.wal.sync().await?;
        info!("Storage manager stopped");
        Ok(())
    }

    async fn wait_ready(&self) -> Result<()> {
        let mut ready = self.inner.ready.subscribe();
        let mut shutdown = self.inner.shutdown.subscribe();
        let ready = async move { ready.wait_for(|ready| *ready).await.is_ok() };
        let stopping = async move { shutdown.wait_for(|stop| *stop).await.is_ok() };
        tokio::select! {
            biased;
            true = ready => Ok(()),
            _ = stopping => Err(Error::ShuttingDown),
            else => Err(Error::ShuttingDown),
        }
    }

    fn is_slow(&self, intent: &OperationIntent) -> bool {
        if intent.kind == IntentKind::Migrate {
            return true;
        }
        let registry = &self.inner.registry;
        let plan = self.inner.dispatcher.policy().plan(
            intent,
            &registry.health().snapshot(),
            &registry.descriptors(),
        );
        plan.primary().and_then(|name| registry.get(name)).is_some_and(|b| b.descriptor().slow)
    }
}

impl Inner {
    fn admit(self: &Arc<Self>, intent: OperationIntent) -> Admission {
        let intent_id = intent.id.clone();
        let (work, handle) = match self.in_flight.entry(intent_id.clone()) {
            Entry::Occupied(running) => {
                debug!(intent_id = %intent_id, "Joining in-flight intent");
                counter!("tessera_intents_deduplicated_total").increment(1);
                return Admission::Running(running.get().handle.clone());
            }
            Entry::Vacant(slot) => {
                let work = match self.wal.get(&intent_id) {
                    Some(entry) => match outcome_of(&entry) {
                        Some(outcome) => {
                            debug!(
                                intent_id = %intent_id,
                                state = %entry.state,
                                "Intent already finished"
                            );
                            counter!("tessera_intents_deduplicated_total").increment(1);
                            return Admission::Finished(outcome);
                        }
                        None => Work::Resume(entry),
                    },
                    None if self.wal.is_retired(&intent_id) => {
                        debug!(intent_id = %intent_id, "Intent id was reclaimed");
                        return Admission::Finished(Err(
                            WalError::DuplicateIntent(intent_id.clone()).into()
                        ));
                    }
                    None => Work::Execute(intent),
                };
                let (completion, handle) = Completion::new(intent_id.clone());
                slot.insert(InFlight { completion, handle: handle.clone() });
                (work, handle)
            }
        };

        gauge!("tessera_intents_in_flight").set(self.in_flight.len() as f64);
        self.spawn_drive(intent_id, work);
        Admission::Running(handle)
    }

    fn spawn_drive(self: &Arc<Self>, intent_id: IntentId, work: Work) {
        let guard = DriveGuard::enter(Arc::clone(self));
        tokio::spawn(async move {
            let inner = Arc::clone(&guard.0);
            let outcome = match work {
                Work::Execute(intent) => inner.dispatcher.execute(intent).await,
                Work::Resume(entry) => inner.dispatcher.resume(entry).await,
            };
            inner.finish(&intent_id, outcome);
            drop(guard);
        });
    }

    fn finish(&self, intent_id: &IntentId, outcome: Outcome) {
        if let Err(e @ Error::LogWrite(_)) = &outcome {
            error!(intent_id = %intent_id, error = %e, "Intent could not be logged");
        }
        if let Some((_, running)) = self.in_flight.remove(intent_id) {
            running.completion.complete(outcome.clone());
        }
        gauge!("tessera_intents_in_flight").set(self.in_flight.len() as f64);
        self.announce(intent_id, outcome);
    }

    /// Publishes a terminal event if the intent is settled in the log.
    fn announce(&self, intent_id: &IntentId, outcome: Outcome) {
        let Some(entry) = self.wal.get(intent_id) else {
            return;
        };
        if !entry.is_settled() {
            return;
        }
        // no subscribers is fine
        let _ = self.events.send(TerminalEvent {
            intent_id: intent_id.clone(),
            state: entry.state,
            outcome,
            at: Utc::now(),
        });
    }

    fn spawn_compactor(&self) -> Option<JoinHandle<()>> {
        let period = self.config.wal.compaction_interval()?;
        let retention = self.config.wal.retention();
        let wal = Arc::clone(&self.wal);
        let mut shutdown = self.shutdown.subscribe();

        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => match wal.compact(retention).await {
                        Ok(stats) => debug!(
                            checkpoint = ?stats.checkpoint,
                            reclaimed = stats.intents_reclaimed,
                            segments_removed = stats.segments_removed,
                            "Compaction pass finished"
                        ),
                        Err(e) => warn!(error = %e, "Compaction pass failed"),
                    },
                    _ = shutdown.changed() => {
                        debug!("Compaction loop shutting down");
                        break;
                    }
                }
            }
        }))
    }
}

/// Counts a drive as active until dropped.
struct DriveGuard(Arc<Inner>);

impl DriveGuard {
    fn enter(inner: Arc<Inner>) -> Self {
        inner.active_drives.send_modify(|n| *n += 1);
        Self(inner)
    }
}

impl Drop for DriveGuard {
    fn drop(&mut self) {
        self.0.active_drives.send_modify(|n| *n = n.saturating_sub(1));
    }
}
