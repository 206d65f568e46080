// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Tessera Authors

//! Shared helpers for manager integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tessera_backend::testing::ScriptedBackend;
use tessera_backend::HealthStatus;
use tessera_core::{BackendDescriptor, Capability, Config, DispatchConfig, HealthConfig};
use tessera_manager::{RecoveryReport, StorageManager};
use tessera_wal::MemoryLogStorage;

/// A manager over an in-memory log that can be "restarted".
pub struct TestManager {
    /// The running manager.
    pub manager: StorageManager,
    /// The log it writes to, shared with any restarted instance.
    pub storage: MemoryLogStorage,
    /// What recovery did when this instance started.
    pub recovery: RecoveryReport,
}

impl TestManager {
    /// Starts a manager on a fresh log.
    pub async fn start(config: Config, backends: &[Backend]) -> Self {
        Self::start_on(MemoryLogStorage::new(), config, backends).await
    }

    /// Starts a manager on an existing log, as after a crash.
    pub async fn start_on(storage: MemoryLogStorage, config: Config, backends: &[Backend]) -> Self {
        let manager = StorageManager::new(config, Arc::new(storage.clone())).await.unwrap();
        for backend in backends {
            manager.register_backend(backend.descriptor.clone(), backend.adapter.clone()).unwrap();
        }
        let recovery = manager.start().await.unwrap();
        Self { manager, storage, recovery }
    }

    /// Drops this instance without shutting down and starts a new one on
    /// the same log.
    pub async fn crash_and_restart(self, config: Config, backends: &[Backend]) -> Self {
        let storage = self.storage.clone();
        storage.fail_appends(false);
        drop(self);
        Self::start_on(storage, config, backends).await
    }
}

/// A scripted backend with the descriptor it is registered under.
#[derive(Clone)]
pub struct Backend {
    pub descriptor: BackendDescriptor,
    pub adapter: Arc<ScriptedBackend>,
}

impl Backend {
    /// A backend offering every write capability.
    pub fn new(adapter: Arc<ScriptedBackend>, priority: u32) -> Self {
        let descriptor = BackendDescriptor::new(
            adapter.name(),
            [Capability::Put, Capability::Pin, Capability::Unpin, Capability::Delete],
        )
        .with_priority(priority);
        Self { descriptor, adapter }
    }

    /// Marks the backend as slow.
    pub fn slow(mut self) -> Self {
        self.descriptor = self.descriptor.slow();
        self
    }
}

/// Short timings so tests run quickly.
pub fn test_config() -> Config {
    Config {
        dispatch: DispatchConfig::default()
            .retry_budget(3)
            .backoff_ms(1, 5)
            .jitter(0.0)
            .call_timeout_ms(1_000)
            .sync_wait_ms(2_000),
        ..Config::default()
    }
}

/// Test configuration with fast probing that marks a backend unreachable
/// after two failed probes.
pub fn probing_config() -> Config {
    Config {
        health: HealthConfig::new().probe_ms(20, 10).failure_thresholds(1, 1),
        ..test_config()
    }
}

/// Waits until `backend` reaches `status`.
pub async fn wait_for_status(manager: &StorageManager, backend: &str, status: HealthStatus) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if manager.health(backend).is_some_and(|state| state.status == status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{backend} never became {status}"));
}
