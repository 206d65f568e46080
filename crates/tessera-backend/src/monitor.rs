// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Tessera Authors

//! Active health probing.
//!
//! The monitor probes every registered backend on a fixed interval,
//! independent of any operation. Unreachable backends are probed too, which
//! is how they recover.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::health::{HealthBoard, Signal};
use crate::registry::{BackendRegistry, RegisteredBackend};

/// Periodically probes every registered backend.
pub struct HealthMonitor {
    registry: Arc<BackendRegistry>,
    interval: Duration,
    timeout: Duration,
    shutdown_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    /// Creates a monitor using the registry's health configuration.
    #[must_use]
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        let config = registry.health().config();
        let interval = config.probe_interval();
        let timeout = config.probe_timeout();
        Self { registry, interval, timeout, shutdown_tx: None, task: None }
    }

    /// Starts the probe loop. Does nothing if it is already running.
    pub fn start(&mut self) {
        if self.task.is_some() {
            return;
        }
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);

        let registry = Arc::clone(&self.registry);
        let period = self.interval;
        let timeout = self.timeout;

        self.task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        probe_round(&registry, timeout).await;
                    }
                    _ = shutdown_rx.changed() => {
                        info!("Health monitor shutting down");
                        break;
                    }
                }
            }
        }));

        info!(
            interval_ms = self.interval.as_millis(),
            timeout_ms = self.timeout.as_millis(),
            "Health monitor started"
        );
    }

    /// Stops the probe loop and waits for it to exit.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Health monitor task ended abnormally");
            }
        }
    }

    /// Returns true while the probe loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Probes every backend once, returning how many were probed.
    pub async fn probe_all(&self) -> usize {
        probe_round(&self.registry, self.timeout).await
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn probe_round(registry: &BackendRegistry, timeout: Duration) -> usize {
    let mut probes = JoinSet::new();
    for backend in registry.backends() {
        let board = Arc::clone(registry.health());
        probes.spawn(probe_one(backend, board, timeout));
    }

    let mut probed = 0;
    while let Some(result) = probes.join_next().await {
        match result {
            Ok(()) => probed += 1,
            Err(e) => warn!(error = %e, "Health probe task failed"),
        }
    }
    probed
}

async fn probe_one(backend: Arc<RegisteredBackend>, board: Arc<HealthBoard>, timeout: Duration) {
    let name = backend.name().to_string();
    let started = Instant::now();
    let outcome = tokio::time::timeout(timeout, backend.adapter().probe()).await;
    let latency = started.elapsed();

    histogram!("tessera_backend_probe_seconds", "backend" => name.clone())
        .record(latency.as_secs_f64());

    let signal = match outcome {
        Ok(Ok(())) => Signal::Success(latency),
        Ok(Err(e)) => {
            debug!(backend = %name, error = %e, "Probe failed");
            counter!("tessera_backend_probe_failures_total", "backend" => name.clone())
                .increment(1);
            Signal::Failure(latency)
        }
        Err(_) => {
            debug!(backend = %name, timeout_ms = timeout.as_millis(), "Probe timed out");
            counter!("tessera_backend_probe_failures_total", "backend" => name.clone())
                .increment(1);
            Signal::Failure(latency)
        }
    };
    board.record_probe(&name, signal);
}
