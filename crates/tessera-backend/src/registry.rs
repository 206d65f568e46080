// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Tessera Authors

//! The set of configured backends.

use std::fmt;
use std::sync::Arc;

use metrics::gauge;
use parking_lot::RwLock;
use tessera_core::{BackendDescriptor, Capability, Error, Result};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::info;

use crate::adapter::BackendAdapter;
use crate::health::HealthBoard;

/// A backend as held by the registry.
pub struct RegisteredBackend {
    descriptor: BackendDescriptor,
    adapter: Arc<dyn BackendAdapter>,
    permits: Arc<Semaphore>,
}

impl RegisteredBackend {
    /// The backend's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// The descriptor it was registered with.
    #[must_use]
    pub fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    /// The adapter wrapping the backend.
    #[must_use]
    pub fn adapter(&self) -> &Arc<dyn BackendAdapter> {
        &self.adapter
    }

    /// Permits bounding concurrent calls to this backend.
    #[must_use]
    pub fn permits(&self) -> &Arc<Semaphore> {
        &self.permits
    }
}

impl fmt::Debug for RegisteredBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredBackend")
            .field("descriptor", &self.descriptor)
            .field("available_permits", &self.permits.available_permits())
            .finish_non_exhaustive()
    }
}

/// Registered backends in registration order, with their live health.
pub struct BackendRegistry {
    backends: RwLock<Vec<Arc<RegisteredBackend>>>,
    health: Arc<HealthBoard>,
    default_concurrency: usize,
}

impl BackendRegistry {
    /// Creates an empty registry.
    ///
    /// Backends whose descriptor sets no concurrency limit get
    /// `default_concurrency` permits.
    #[must_use]
    pub fn new(health: Arc<HealthBoard>, default_concurrency: usize) -> Self {
        Self { backends: RwLock::new(Vec::new()), health, default_concurrency }
    }

    /// Registers a backend.
    ///
    /// Registering a name again replaces its adapter and descriptor, keeps
    /// its position in registration order and resets its health.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an empty name or a zero concurrency
    /// limit.
    pub fn register(
        &self,
        descriptor: BackendDescriptor,
        adapter: Arc<dyn BackendAdapter>,
    ) -> Result<()> {
        if descriptor.name.is_empty() {
            return Err(Error::Config("backend name cannot be empty".to_string()));
        }
        let limit = descriptor.max_concurrency.unwrap_or(self.default_concurrency);
        if limit == 0 {
            return Err(Error::Config(format!(
                "backend {} must allow at least one concurrent call",
                descriptor.name
            )));
        }

        let name = descriptor.name.clone();
        let backend = Arc::new(RegisteredBackend {
            descriptor,
            adapter,
            permits: Arc::new(Semaphore::new(limit)),
        });

        let replaced = {
            let mut backends = self.backends.write();
            match backends.iter_mut().find(|b| b.name() == name) {
                Some(existing) => {
                    *existing = backend;
                    true
                }
                None => {
                    backends.push(backend);
                    false
                }
            }
        };
        self.health.register(&name);

        gauge!("tessera_backends_registered").set(self.len() as f64);
        info!(backend = %name, replaced, max_concurrency = limit, "Registered backend");
        Ok(())
    }

    /// Returns the adapter registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown name.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn BackendAdapter>> {
        self.get(name)
            .map(|b| Arc::clone(b.adapter()))
            .ok_or_else(|| Error::backend_not_found(name))
    }

    /// Returns the registration for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<RegisteredBackend>> {
        self.backends.read().iter().find(|b| b.name() == name).cloned()
    }

    /// Returns true if `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.backends.read().iter().any(|b| b.name() == name)
    }

    /// Descriptors of backends offering `capability`, highest priority
    /// first; registration order breaks ties.
    #[must_use]
    pub fn list_by_capability(&self, capability: Capability) -> Vec<BackendDescriptor> {
        let mut capable: Vec<BackendDescriptor> = self
            .backends
            .read()
            .iter()
            .filter(|b| b.descriptor.supports(capability))
            .map(|b| b.descriptor.clone())
            .collect();
        // Stable sort keeps registration order within a priority.
        capable.sort_by(|a, b| b.priority.cmp(&a.priority));
        capable
    }

    /// Every descriptor, in registration order.
    #[must_use]
    pub fn descriptors(&self) -> Vec<BackendDescriptor> {
        self.backends.read().iter().map(|b| b.descriptor.clone()).collect()
    }

    /// Every registration, in registration order.
    #[must_use]
    pub fn backends(&self) -> Vec<Arc<RegisteredBackend>> {
        self.backends.read().clone()
    }

    /// The health board tracking these backends.
    #[must_use]
    pub fn health(&self) -> &Arc<HealthBoard> {
        &self.health
    }

    /// Waits for a call slot on `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown name.
    pub async fn acquire(&self, name: &str) -> Result<OwnedSemaphorePermit> {
        let backend = self.get(name).ok_or_else(|| Error::backend_not_found(name))?;
        Arc::clone(backend.permits()).acquire_owned().await.map_err(|_| Error::ShuttingDown)
    }

    /// Number of registered backends.
    #[must_use]
    pub fn len(&self) -> usize {
        self.backends.read().len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backends.read().is_empty()
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &*self.backends.read())
            .field("default_concurrency", &self.default_concurrency)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tessera_core::HealthConfig;

    use super::*;
    use crate::health::{HealthStatus, Signal};
    use crate::testing::ScriptedBackend;

    fn registry() -> BackendRegistry {
        BackendRegistry::new(Arc::new(HealthBoard::new(HealthConfig::default())), 4)
    }

    fn descriptor(name: &str, priority: u32) -> BackendDescriptor {
        BackendDescriptor::new(name, [Capability::Put, Capability::Pin]).with_priority(priority)
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = registry();
        registry.register(descriptor("local", 0), ScriptedBackend::healthy("local")).unwrap();

        assert!(registry.resolve("local").is_ok());
        assert!(registry.contains("local"));
        let err = registry.resolve("remote").err().unwrap();
        assert_eq!(err, Error::backend_not_found("remote"));
    }

    #[test]
    fn test_list_by_capability_orders_by_priority_then_registration() {
        let registry = registry();
        registry.register(descriptor("a", 1), ScriptedBackend::healthy("a")).unwrap();
        registry.register(descriptor("b", 5), ScriptedBackend::healthy("b")).unwrap();
        registry.register(descriptor("c", 1), ScriptedBackend::healthy("c")).unwrap();
        let pin_only = BackendDescriptor::new("d", [Capability::Unpin]).with_priority(9);
        registry.register(pin_only, ScriptedBackend::healthy("d")).unwrap();

        let names: Vec<String> =
            registry.list_by_capability(Capability::Pin).into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
        assert!(registry.list_by_capability(Capability::Delete).is_empty());
    }

    #[test]
    fn test_reregistration_replaces_in_place_and_resets_health() {
        let registry = registry();
        registry.register(descriptor("a", 0), ScriptedBackend::healthy("a")).unwrap();
        registry.register(descriptor("b", 0), ScriptedBackend::healthy("b")).unwrap();
        for _ in 0..6 {
            registry.health().record("a", Signal::Failure(Duration::ZERO));
        }
        assert_eq!(registry.health().status("a"), Some(HealthStatus::Unreachable));

        registry.register(descriptor("a", 0).slow(), ScriptedBackend::healthy("a")).unwrap();

        let names: Vec<String> = registry.descriptors().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(registry.get("a").unwrap().descriptor().slow);
        assert_eq!(registry.health().status("a"), Some(HealthStatus::Healthy));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_register_rejects_bad_descriptors() {
        let registry = registry();
        let unnamed = BackendDescriptor::new("", [Capability::Put]);
        assert!(registry.register(unnamed, ScriptedBackend::healthy("x")).is_err());
        let zero = descriptor("z", 0).with_max_concurrency(0);
        assert!(registry.register(zero, ScriptedBackend::healthy("z")).is_err());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_concurrency_permits() {
        let registry = registry();
        let limited = descriptor("slow", 0).with_max_concurrency(1);
        registry.register(limited, ScriptedBackend::healthy("slow")).unwrap();

        let permit = registry.acquire("slow").await.unwrap();
        let backend = registry.get("slow").unwrap();
        assert_eq!(backend.permits().available_permits(), 0);
        drop(permit);
        assert_eq!(backend.permits().available_permits(), 1);

        assert!(registry.acquire("missing").await.is_err());
    }
}
