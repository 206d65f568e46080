// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Tessera Authors

//! Controllable backend adapters for tests.
//!
//! [`ScriptedBackend`] answers operation calls from a script of queued
//! outcomes, falling back to a default outcome once the script runs dry. It
//! can add artificial latency, report probe failures and keeps a journal of
//! every call it received.
//!
//! # Example
//!
//! ```ignore
//! let remote = ScriptedBackend::healthy("remote");
//! remote.push_failures(2, AdapterError::Connection("reset".into()));
//! // The first two calls fail, every later call succeeds.
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tessera_core::{ContentRef, IntentKind, PayloadHandle};

use crate::adapter::BackendAdapter;
use crate::error::{AdapterError, AdapterResult};

/// A call received by a [`ScriptedBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    /// The operation requested.
    pub kind: IntentKind,
    /// The content it targeted.
    pub content: ContentRef,
    /// Whether the scripted outcome was a success.
    pub succeeded: bool,
}

/// A backend whose behavior is scripted by the test.
pub struct ScriptedBackend {
    name: String,
    script: Mutex<VecDeque<AdapterResult<()>>>,
    default_outcome: Mutex<AdapterResult<()>>,
    latency: Mutex<Duration>,
    probe_healthy: AtomicBool,
    calls: Mutex<Vec<RecordedCall>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    probes: AtomicUsize,
}

impl ScriptedBackend {
    /// A backend that succeeds at everything.
    #[must_use]
    pub fn healthy(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::with_default(name, Ok(())))
    }

    /// A backend whose calls and probes always fail with `error`.
    #[must_use]
    pub fn failing(name: impl Into<String>, error: AdapterError) -> Arc<Self> {
        let backend = Self::with_default(name, Err(error));
        backend.probe_healthy.store(false, Ordering::SeqCst);
        Arc::new(backend)
    }

    fn with_default(name: impl Into<String>, outcome: AdapterResult<()>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            default_outcome: Mutex::new(outcome),
            latency: Mutex::new(Duration::ZERO),
            probe_healthy: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
        }
    }

    /// The backend's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues an outcome behind any already scripted.
    pub fn push_outcome(&self, outcome: AdapterResult<()>) {
        self.script.lock().push_back(outcome);
    }

    /// Queues `count` failures.
    pub fn push_failures(&self, count: usize, error: AdapterError) {
        let mut script = self.script.lock();
        for _ in 0..count {
            script.push_back(Err(error.clone()));
        }
    }

    /// Sets the outcome used once the script is empty.
    pub fn set_default(&self, outcome: AdapterResult<()>) {
        *self.default_outcome.lock() = outcome;
    }

    /// Delays every operation call and probe by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Makes probes succeed or fail.
    pub fn set_probe_healthy(&self, healthy: bool) {
        self.probe_healthy.store(healthy, Ordering::SeqCst);
    }

    /// Every operation call received, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Number of operation calls received.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Number of operation calls that targeted `content`.
    #[must_use]
    pub fn calls_for(&self, content: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.content.as_str() == content).count()
    }

    /// Highest number of operation calls observed running at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Number of probes received.
    #[must_use]
    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    async fn answer(&self, kind: IntentKind, content: &ContentRef) -> AdapterResult<()> {
        let scripted = self.script.lock().pop_front();
        let outcome = scripted.unwrap_or_else(|| self.default_outcome.lock().clone());
        self.calls.lock().push(RecordedCall {
            kind,
            content: content.clone(),
            succeeded: outcome.is_ok(),
        });

        let _running = InFlight::enter(self);
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        outcome
    }
}

/// Counts a call as running until dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(backend: &'a ScriptedBackend) -> Self {
        let running = backend.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        backend.max_in_flight.fetch_max(running, Ordering::SeqCst);
        Self(&backend.in_flight)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl BackendAdapter for ScriptedBackend {
    async fn put(&self, content: &ContentRef, _payload: &PayloadHandle) -> AdapterResult<()> {
        self.answer(IntentKind::Put, content).await
    }

    async fn pin(&self, content: &ContentRef) -> AdapterResult<()> {
        self.answer(IntentKind::Pin, content).await
    }

    async fn unpin(&self, content: &ContentRef) -> AdapterResult<()> {
        self.answer(IntentKind::Unpin, content).await
    }

    async fn delete(&self, content: &ContentRef) -> AdapterResult<()> {
        self.answer(IntentKind::Delete, content).await
    }

    async fn migrate(&self, content: &ContentRef, _payload: &PayloadHandle) -> AdapterResult<()> {
        self.answer(IntentKind::Migrate, content).await
    }

    async fn probe(&self) -> AdapterResult<()> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.probe_healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AdapterError::Unavailable(format!("{} probe failed", self.name)))
        }
    }
}
