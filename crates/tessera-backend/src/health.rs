// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Tessera Authors

//! Backend health tracking.
//!
//! Every backend has a tracker holding a fixed-size window of recent
//! outcomes. Probes and dispatch results feed the same tracker. After every
//! signal the board publishes a fresh immutable [`HealthSnapshot`]; readers
//! clone an `Arc` and never wait on updates.
//!
//! # Transition policy
//!
//! - `Healthy → Degraded` after N consecutive failures, or once the window
//!   holds the minimum number of samples and its error rate exceeds the
//!   threshold.
//! - `Degraded → Unreachable` after M further consecutive failures.
//! - A success resets the consecutive-failure counter. It promotes the
//!   backend one level toward `Healthy` only once the cool-down has elapsed
//!   since the last failure.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tessera_core::HealthConfig;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Health status of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Responding normally.
    Healthy,
    /// Failing intermittently; still selectable.
    Degraded,
    /// Excluded from new backend selection until it recovers.
    Unreachable,
}

impl HealthStatus {
    /// Returns the snake_case name of the status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unreachable => "unreachable",
        }
    }

    /// Returns true if the backend may be chosen for new work.
    #[must_use]
    pub const fn is_available(&self) -> bool {
        !matches!(self, Self::Unreachable)
    }

    const fn promoted(self) -> Self {
        match self {
            Self::Unreachable => Self::Degraded,
            Self::Degraded | Self::Healthy => Self::Healthy,
        }
    }

    const fn level(self) -> f64 {
        match self {
            Self::Healthy => 0.0,
            Self::Degraded => 1.0,
            Self::Unreachable => 2.0,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed outcome, with the time the call took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// The backend answered.
    Success(Duration),
    /// The backend failed or did not answer in time.
    Failure(Duration),
}

impl Signal {
    /// Returns true for a success.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// How long the call took.
    #[must_use]
    pub const fn latency(&self) -> Duration {
        match self {
            Self::Success(latency) | Self::Failure(latency) => *latency,
        }
    }
}

/// Published health of one backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthState {
    /// Current status.
    pub status: HealthStatus,
    /// Fraction of failures in the trailing window.
    pub error_rate: f64,
    /// Mean latency over the trailing window, in milliseconds.
    pub latency_ms: f64,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Number of samples in the window.
    pub samples: usize,
    /// When the backend was last probed.
    pub last_probe_at: Option<DateTime<Utc>>,
    /// When the status last changed (or the backend was registered).
    pub last_change_at: DateTime<Utc>,
}

/// Immutable view of every backend's health.
#[derive(Debug, Clone, Default)]
pub struct HealthSnapshot {
    version: u64,
    states: BTreeMap<String, HealthState>,
}

impl HealthSnapshot {
    /// Creates an empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the snapshot with `backend` set to `status` and no samples.
    #[must_use]
    pub fn with_status(mut self, backend: impl Into<String>, status: HealthStatus) -> Self {
        let mut state = Tracker::new(Utc::now()).state();
        state.status = status;
        self.states.insert(backend.into(), state);
        self
    }

    /// Monotonic publication counter.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Health of a backend, if tracked.
    #[must_use]
    pub fn get(&self, backend: &str) -> Option<&HealthState> {
        self.states.get(backend)
    }

    /// Status of a backend. Untracked backends count as healthy.
    #[must_use]
    pub fn status(&self, backend: &str) -> HealthStatus {
        self.states.get(backend).map_or(HealthStatus::Healthy, |s| s.status)
    }

    /// Returns true if the backend may be chosen for new work.
    #[must_use]
    pub fn is_available(&self, backend: &str) -> bool {
        self.status(backend).is_available()
    }

    /// Iterates over tracked backends in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &HealthState)> {
        self.states.iter().map(|(name, state)| (name.as_str(), state))
    }

    /// Number of tracked backends.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Returns true if no backend is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// A status change, broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthEvent {
    /// The backend whose status changed.
    pub backend: String,
    /// Status before the change.
    pub from: HealthStatus,
    /// Status after the change.
    pub to: HealthStatus,
    /// When the change happened.
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    ok: bool,
    latency: Duration,
}

#[derive(Debug)]
struct Tracker {
    window: VecDeque<Sample>,
    status: HealthStatus,
    consecutive_failures: u32,
    /// Consecutive failures counted when the backend was degraded.
    failures_at_demotion: u32,
    last_failure: Option<Instant>,
    last_probe_at: Option<DateTime<Utc>>,
    last_change_at: DateTime<Utc>,
}

impl Tracker {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            window: VecDeque::new(),
            status: HealthStatus::Healthy,
            consecutive_failures: 0,
            failures_at_demotion: 0,
            last_failure: None,
            last_probe_at: None,
            last_change_at: now,
        }
    }

    fn error_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|s| !s.ok).count();
        failures as f64 / self.window.len() as f64
    }

    fn latency_ms(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let total: f64 = self.window.iter().map(|s| s.latency.as_secs_f64() * 1000.0).sum();
        total / self.window.len() as f64
    }

    /// Applies a signal and returns the status change it caused, if any.
    fn observe(
        &mut self,
        signal: Signal,
        config: &HealthConfig,
        now: Instant,
    ) -> Option<(HealthStatus, HealthStatus)> {
        self.window.push_back(Sample { ok: signal.is_success(), latency: signal.latency() });
        while self.window.len() > config.window_size {
            self.window.pop_front();
        }

        let from = self.status;
        if signal.is_success() {
            self.consecutive_failures = 0;
            self.failures_at_demotion = 0;
            let cooled = self
                .last_failure
                .map_or(true, |at| now.saturating_duration_since(at) >= config.cooldown());
            if from != HealthStatus::Healthy && cooled {
                self.status = from.promoted();
            }
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            self.last_failure = Some(now);
            match from {
                HealthStatus::Healthy => {
                    let rate_exceeded = self.window.len() >= config.min_samples
                        && self.error_rate() > config.error_rate_threshold;
                    if self.consecutive_failures >= config.degraded_after_failures || rate_exceeded
                    {
                        self.status = HealthStatus::Degraded;
                        self.failures_at_demotion = self.consecutive_failures;
                    }
                }
                HealthStatus::Degraded => {
                    let further =
                        self.consecutive_failures.saturating_sub(self.failures_at_demotion);
                    if further >= config.unreachable_after_failures {
                        self.status = HealthStatus::Unreachable;
                    }
                }
                HealthStatus::Unreachable => {}
            }
        }

        (from != self.status).then_some((from, self.status))
    }

    fn state(&self) -> HealthState {
        HealthState {
            status: self.status,
            error_rate: self.error_rate(),
            latency_ms: self.latency_ms(),
            consecutive_failures: self.consecutive_failures,
            samples: self.window.len(),
            last_probe_at: self.last_probe_at,
            last_change_at: self.last_change_at,
        }
    }
}

/// Health of every registered backend.
pub struct HealthBoard {
    config: HealthConfig,
    trackers: Mutex<BTreeMap<String, Tracker>>,
    snapshot: RwLock<Arc<HealthSnapshot>>,
    event_tx: broadcast::Sender<HealthEvent>,
}

impl HealthBoard {
    /// Creates an empty board.
    #[must_use]
    pub fn new(config: HealthConfig) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            config,
            trackers: Mutex::new(BTreeMap::new()),
            snapshot: RwLock::new(Arc::new(HealthSnapshot::default())),
            event_tx,
        }
    }

    /// The tracking configuration.
    #[must_use]
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Starts tracking a backend as healthy, discarding any previous history.
    pub fn register(&self, backend: &str) {
        let mut trackers = self.trackers.lock();
        trackers.insert(backend.to_string(), Tracker::new(Utc::now()));
        self.publish(&trackers);
        gauge!("tessera_backend_health_status", "backend" => backend.to_string())
            .set(HealthStatus::Healthy.level());
        debug!(backend = %backend, "Tracking backend health");
    }

    /// Stops tracking a backend. Returns false if it was not tracked.
    pub fn remove(&self, backend: &str) -> bool {
        let mut trackers = self.trackers.lock();
        let removed = trackers.remove(backend).is_some();
        if removed {
            self.publish(&trackers);
        }
        removed
    }

    /// Records the outcome of a dispatched call.
    ///
    /// Returns the backend's status afterwards, or `None` if it is not
    /// tracked.
    pub fn record(&self, backend: &str, signal: Signal) -> Option<HealthStatus> {
        self.observe(backend, signal, false)
    }

    /// Records the outcome of a liveness probe.
    pub fn record_probe(&self, backend: &str, signal: Signal) -> Option<HealthStatus> {
        self.observe(backend, signal, true)
    }

    fn observe(&self, backend: &str, signal: Signal, probe: bool) -> Option<HealthStatus> {
        let (change, status) = {
            let mut trackers = self.trackers.lock();
            let Some(tracker) = trackers.get_mut(backend) else {
                debug!(backend = %backend, "Ignoring health signal for untracked backend");
                return None;
            };
            let now = Utc::now();
            if probe {
                tracker.last_probe_at = Some(now);
            }
            let change = tracker.observe(signal, &self.config, Instant::now());
            if change.is_some() {
                tracker.last_change_at = now;
            }
            let status = tracker.status;
            self.publish(&trackers);
            (change.map(|(from, to)| (from, to, now)), status)
        };

        let outcome = if signal.is_success() { "success" } else { "failure" };
        counter!(
            "tessera_backend_signals_total",
            "backend" => backend.to_string(),
            "outcome" => outcome
        )
        .increment(1);

        if let Some((from, to, at)) = change {
            gauge!("tessera_backend_health_status", "backend" => backend.to_string())
                .set(to.level());
            counter!(
                "tessera_backend_health_transitions_total",
                "backend" => backend.to_string(),
                "to" => to.as_str()
            )
            .increment(1);
            if to > from {
                warn!(backend = %backend, from = %from, to = %to, "Backend health degraded");
            } else {
                info!(backend = %backend, from = %from, to = %to, "Backend health recovered");
            }
            let _ = self.event_tx.send(HealthEvent { backend: backend.to_string(), from, to, at });
        }

        Some(status)
    }

    fn publish(&self, trackers: &BTreeMap<String, Tracker>) {
        let states = trackers.iter().map(|(name, t)| (name.clone(), t.state())).collect();
        let mut snapshot = self.snapshot.write();
        let version = snapshot.version + 1;
        *snapshot = Arc::new(HealthSnapshot { version, states });
    }

    /// The latest published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<HealthSnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    /// Current status of a backend, if tracked.
    #[must_use]
    pub fn status(&self, backend: &str) -> Option<HealthStatus> {
        self.snapshot().get(backend).map(|s| s.status)
    }

    /// Subscribes to status changes.
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.event_tx.subscribe()
    }
}

impl fmt::Debug for HealthBoard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthBoard")
            .field("config", &self.config)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAIL: Signal = Signal::Failure(Duration::from_millis(5));
    const OK: Signal = Signal::Success(Duration::from_millis(5));

    fn board(config: HealthConfig) -> HealthBoard {
        let board = HealthBoard::new(config);
        board.register("remote");
        board
    }

    #[test]
    fn test_consecutive_failures_demote() {
        let board = board(HealthConfig::new().failure_thresholds(3, 2).cooldown_ms(60_000));

        assert_eq!(board.record("remote", FAIL), Some(HealthStatus::Healthy));
        assert_eq!(board.record("remote", FAIL), Some(HealthStatus::Healthy));
        assert_eq!(board.record("remote", FAIL), Some(HealthStatus::Degraded));
        assert_eq!(board.record("remote", FAIL), Some(HealthStatus::Degraded));
        assert_eq!(board.record("remote", FAIL), Some(HealthStatus::Unreachable));

        let snapshot = board.snapshot();
        let state = snapshot.get("remote").unwrap();
        assert_eq!(state.consecutive_failures, 5);
        assert_eq!(state.samples, 5);
        assert!((state.error_rate - 1.0).abs() < f64::EPSILON);
        assert!(!snapshot.is_available("remote"));
    }

    #[test]
    fn test_error_rate_demotes_once_window_is_warm() {
        let board = board(
            HealthConfig::new()
                .window(10, 4)
                .failure_thresholds(100, 3)
                .error_rate_threshold(0.5)
                .cooldown_ms(60_000),
        );

        for signal in [OK, FAIL, OK, FAIL] {
            assert_eq!(board.record("remote", signal), Some(HealthStatus::Healthy));
        }
        // 3 failures out of 5 samples.
        assert_eq!(board.record("remote", FAIL), Some(HealthStatus::Degraded));
    }

    #[test]
    fn test_window_is_bounded() {
        let board = board(HealthConfig::new().window(4, 1).failure_thresholds(100, 100));
        for _ in 0..3 {
            board.record("remote", FAIL);
        }
        for _ in 0..4 {
            board.record("remote", OK);
        }
        let snapshot = board.snapshot();
        let state = snapshot.get("remote").unwrap();
        assert_eq!(state.samples, 4);
        assert!(state.error_rate.abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_promotion_waits_for_cooldown() {
        let board = board(HealthConfig::new().failure_thresholds(1, 1).cooldown_ms(1_000));

        board.record("remote", FAIL);
        assert_eq!(board.record("remote", FAIL), Some(HealthStatus::Unreachable));

        // Success resets the counter but the cool-down has not elapsed.
        assert_eq!(board.record("remote", OK), Some(HealthStatus::Unreachable));
        assert_eq!(board.snapshot().get("remote").unwrap().consecutive_failures, 0);

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert_eq!(board.record("remote", OK), Some(HealthStatus::Degraded));
        assert_eq!(board.record("remote", OK), Some(HealthStatus::Healthy));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_restarts_cooldown() {
        let board = board(HealthConfig::new().failure_thresholds(1, 5).cooldown_ms(1_000));

        assert_eq!(board.record("remote", FAIL), Some(HealthStatus::Degraded));
        tokio::time::advance(Duration::from_millis(900)).await;
        board.record("remote", FAIL);
        tokio::time::advance(Duration::from_millis(900)).await;
        assert_eq!(board.record("remote", OK), Some(HealthStatus::Degraded));
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(board.record("remote", OK), Some(HealthStatus::Healthy));
    }

    #[test]
    fn test_snapshot_is_replaced_not_mutated() {
        let board = board(HealthConfig::new().failure_thresholds(1, 1));
        let before = board.snapshot();

        board.record("remote", FAIL);
        let after = board.snapshot();

        assert_eq!(before.status("remote"), HealthStatus::Healthy);
        assert_eq!(after.status("remote"), HealthStatus::Degraded);
        assert!(after.version() > before.version());
    }

    #[test]
    fn test_events_are_broadcast() {
        let board = board(HealthConfig::new().failure_thresholds(1, 1).cooldown_ms(0));
        let mut events = board.subscribe();

        board.record("remote", FAIL);
        board.record("remote", OK);

        let first = events.try_recv().unwrap();
        assert_eq!((first.from, first.to), (HealthStatus::Healthy, HealthStatus::Degraded));
        let second = events.try_recv().unwrap();
        assert_eq!((second.from, second.to), (HealthStatus::Degraded, HealthStatus::Healthy));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_register_resets_history() {
        let board = board(HealthConfig::new().failure_thresholds(1, 1));
        board.record("remote", FAIL);
        board.record("remote", FAIL);
        assert_eq!(board.status("remote"), Some(HealthStatus::Unreachable));

        board.register("remote");
        let snapshot = board.snapshot();
        let state = snapshot.get("remote").unwrap();
        assert_eq!(state.status, HealthStatus::Healthy);
        assert_eq!(state.samples, 0);
    }

    #[test]
    fn test_untracked_backend() {
        let board = HealthBoard::new(HealthConfig::default());
        assert_eq!(board.record("ghost", FAIL), None);
        assert_eq!(board.status("ghost"), None);
        assert!(board.snapshot().is_available("ghost"));
        assert!(!board.remove("ghost"));
    }

    #[test]
    fn test_probe_sets_timestamp() {
        let board = board(HealthConfig::default());
        board.record("remote", OK);
        assert!(board.snapshot().get("remote").unwrap().last_probe_at.is_none());
        board.record_probe("remote", OK);
        assert!(board.snapshot().get("remote").unwrap().last_probe_at.is_some());
    }

    #[test]
    fn test_snapshot_builder() {
        let snapshot = HealthSnapshot::new()
            .with_status("local", HealthStatus::Healthy)
            .with_status("remote", HealthStatus::Unreachable);
        assert!(snapshot.is_available("local"));
        assert!(!snapshot.is_available("remote"));
        assert_eq!(snapshot.len(), 2);
    }
}
