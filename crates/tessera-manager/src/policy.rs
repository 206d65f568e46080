// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Tessera Authors

//! Backend selection.
//!
//! The policy engine turns an intent into an ordered list of backends to try.
//! It is a pure function of the intent, a health snapshot and the registered
//! descriptors: the same inputs always give the same plan, which is what
//! makes retries reproducible.
//!
//! Selection order:
//!
//! 1. The intent's backend hint, when it is capable and not unreachable.
//! 2. Otherwise the target of the first matching migration rule.
//! 3. Otherwise the configured default backend.
//! 4. Every other capable, reachable backend as fallback: healthy before
//!    degraded, then by priority, then in registration order.
//!
//! When every capable backend is unreachable the plan lists them anyway as a
//! last resort, so the attempt is still logged and budgeted.

use tessera_backend::{HealthSnapshot, HealthStatus};
use tessera_core::rules::first_match;
use tessera_core::{BackendDescriptor, MigrationRule, OperationIntent, PolicyConfig};

/// Ordered backends to try for one intent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidatePlan {
    /// Backend names, primary first.
    pub candidates: Vec<String>,
    /// Rule that chose the primary, if one did.
    pub matched_rule: Option<String>,
    /// Whether the primary came from the intent's hint.
    pub hinted: bool,
    /// Whether every candidate is unreachable.
    pub last_resort: bool,
}

impl CandidatePlan {
    /// The first backend to try.
    #[must_use]
    pub fn primary(&self) -> Option<&str> {
        self.candidates.first().map(String::as_str)
    }

    /// Candidate for the given 1-based attempt, wrapping around the list.
    #[must_use]
    pub fn candidate_for(&self, attempt: u32) -> Option<&str> {
        if self.candidates.is_empty() {
            return None;
        }
        let index = (attempt.saturating_sub(1) as usize) % self.candidates.len();
        Some(self.candidates[index].as_str())
    }

    /// Number of candidates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    /// Returns true if no backend can serve the intent.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// Plans candidate backends from configured rules.
#[derive(Debug, Clone, Default)]
pub struct PolicyEngine {
    rules: Vec<MigrationRule>,
    default_backend: Option<String>,
}

impl PolicyEngine {
    /// Creates an engine from the policy configuration.
    #[must_use]
    pub fn new(config: &PolicyConfig) -> Self {
        Self { rules: config.rules.clone(), default_backend: config.default_backend.clone() }
    }

    /// Plans the backends to try for `intent`.
    ///
    /// `descriptors` must be in registration order.
    #[must_use]
    pub fn plan(
        &self,
        intent: &OperationIntent,
        health: &HealthSnapshot,
        descriptors: &[BackendDescriptor],
    ) -> CandidatePlan {
        let capability = intent.kind.required_capability();
        let capable: Vec<(usize, &BackendDescriptor)> =
            descriptors.iter().enumerate().filter(|(_, d)| d.supports(capability)).collect();
        if capable.is_empty() {
            return CandidatePlan::default();
        }

        let mut reachable: Vec<(usize, &BackendDescriptor)> =
            capable.iter().copied().filter(|(_, d)| health.is_available(&d.name)).collect();

        if reachable.is_empty() {
            let mut unreachable = capable;
            unreachable.sort_by(|(ia, a), (ib, b)| b.priority.cmp(&a.priority).then(ia.cmp(ib)));
            return CandidatePlan {
                candidates: unreachable.into_iter().map(|(_, d)| d.name.clone()).collect(),
                last_resort: true,
                ..CandidatePlan::default()
            };
        }

        let is_reachable = |name: &str| reachable.iter().any(|(_, d)| d.name == name);
        let mut plan = CandidatePlan::default();

        let primary = if let Some(hint) =
            intent.backend_hint.as_deref().filter(|hint| is_reachable(hint))
        {
            plan.hinted = true;
            Some(hint.to_string())
        } else if let Some(rule) =
            first_match(&self.rules, intent).filter(|rule| is_reachable(&rule.target))
        {
            plan.matched_rule = Some(rule.name.clone());
            Some(rule.target.clone())
        } else {
            self.default_backend.clone().filter(|name| is_reachable(name))
        };

        if let Some(primary) = &primary {
            reachable.retain(|(_, d)| &d.name != primary);
        }
        reachable.sort_by(|(ia, a), (ib, b)| {
            rank(health.status(&a.name))
                .cmp(&rank(health.status(&b.name)))
                .then(b.priority.cmp(&a.priority))
                .then(ia.cmp(ib))
        });

        plan.candidates = primary
            .into_iter()
            .chain(reachable.into_iter().map(|(_, d)| d.name.clone()))
            .collect();
        plan
    }
}

fn rank(status: HealthStatus) -> u8 {
    match status {
        HealthStatus::Healthy => 0,
        HealthStatus::Degraded => 1,
        HealthStatus::Unreachable => 2,
    }
}

#[cfg(test)]
mod tests {
    use tessera_core::{Capability, IntentKind, RuleMatch};

    use super::*;

    fn pin_backend(name: &str, priority: u32) -> BackendDescriptor {
        BackendDescriptor::new(name, [Capability::Pin, Capability::Put]).with_priority(priority)
    }

    fn names(plan: &CandidatePlan) -> Vec<&str> {
        plan.candidates.iter().map(String::as_str).collect()
    }

    #[test]
    fn test_fallbacks_by_priority_then_registration() {
        let engine = PolicyEngine::default();
        let descriptors = vec![pin_backend("a", 1), pin_backend("b", 5), pin_backend("c", 1)];

        let health = HealthSnapshot::default();
        let plan = engine.plan(&OperationIntent::pin("x"), &health, &descriptors);
        assert_eq!(names(&plan), vec!["b", "a", "c"]);
        assert!(!plan.hinted);
        assert!(plan.matched_rule.is_none());
    }

    #[test]
    fn test_unreachable_backend_excluded() {
        let engine = PolicyEngine::default();
        let descriptors = vec![pin_backend("local", 0), pin_backend("remote", 10)];
        let health = HealthSnapshot::default().with_status("remote", HealthStatus::Unreachable);

        let plan = engine.plan(&OperationIntent::pin("x"), &health, &descriptors);
        assert_eq!(names(&plan), vec!["local"]);
        assert!(!plan.last_resort);
    }

    #[test]
    fn test_healthy_before_degraded() {
        let engine = PolicyEngine::default();
        let descriptors = vec![pin_backend("fast", 10), pin_backend("steady", 1)];
        let health = HealthSnapshot::default().with_status("fast", HealthStatus::Degraded);

        let plan = engine.plan(&OperationIntent::pin("x"), &health, &descriptors);
        assert_eq!(names(&plan), vec!["steady", "fast"]);
    }

    #[test]
    fn test_hint_goes_first() {
        let engine = PolicyEngine::new(&PolicyConfig::default().default_backend("a"));
        let descriptors = vec![pin_backend("a", 5), pin_backend("b", 1)];

        let intent = OperationIntent::pin("x").with_hint("b");
        let plan = engine.plan(&intent, &HealthSnapshot::default(), &descriptors);
        assert_eq!(names(&plan), vec!["b", "a"]);
        assert!(plan.hinted);
    }

    #[test]
    fn test_unreachable_hint_is_skipped() {
        let engine = PolicyEngine::default();
        let descriptors = vec![pin_backend("a", 0), pin_backend("b", 0)];
        let health = HealthSnapshot::default().with_status("b", HealthStatus::Unreachable);

        let intent = OperationIntent::pin("x").with_hint("b");
        let plan = engine.plan(&intent, &health, &descriptors);
        assert_eq!(names(&plan), vec!["a"]);
        assert!(!plan.hinted);
    }

    #[test]
    fn test_incapable_hint_is_skipped() {
        let engine = PolicyEngine::default();
        let descriptors =
            vec![pin_backend("a", 0), BackendDescriptor::new("reader", [Capability::Get])];

        let intent = OperationIntent::pin("x").with_hint("reader");
        let plan = engine.plan(&intent, &HealthSnapshot::default(), &descriptors);
        assert_eq!(names(&plan), vec!["a"]);
    }

    #[test]
    fn test_first_matching_rule_picks_primary() {
        let config = PolicyConfig::default()
            .default_backend("hot")
            .rule(
                MigrationRule::new("large-to-cold", "cold")
                    .with_priority(1)
                    .with_match(RuleMatch { min_size_bytes: Some(1024), ..RuleMatch::default() }),
            )
            .rule(MigrationRule::new("catch-all", "warm").with_priority(9));
        let engine = PolicyEngine::new(&config);
        let descriptors =
            vec![pin_backend("hot", 9), pin_backend("warm", 5), pin_backend("cold", 1)];
        let health = HealthSnapshot::default();

        let large = OperationIntent::put("big", "blob").with_size(4096);
        let plan = engine.plan(&large, &health, &descriptors);
        assert_eq!(names(&plan), vec!["cold", "hot", "warm"]);
        assert_eq!(plan.matched_rule.as_deref(), Some("large-to-cold"));

        let small = OperationIntent::put("small", "blob").with_size(10);
        let plan = engine.plan(&small, &health, &descriptors);
        assert_eq!(plan.primary(), Some("warm"));
        assert_eq!(plan.matched_rule.as_deref(), Some("catch-all"));
    }

    #[test]
    fn test_default_backend_when_no_rule_applies() {
        let config = PolicyConfig::default().default_backend("archive").rule(
            MigrationRule::new("deletes", "hot")
                .with_match(RuleMatch { kinds: vec![IntentKind::Delete], ..RuleMatch::default() }),
        );
        let engine = PolicyEngine::new(&config);
        let descriptors = vec![pin_backend("hot", 9), pin_backend("archive", 0)];

        let health = HealthSnapshot::default();
        let plan = engine.plan(&OperationIntent::pin("x"), &health, &descriptors);
        assert_eq!(names(&plan), vec!["archive", "hot"]);
        assert!(plan.matched_rule.is_none());
    }

    #[test]
    fn test_all_unreachable_is_last_resort() {
        let engine = PolicyEngine::default();
        let descriptors = vec![pin_backend("a", 1), pin_backend("b", 3)];
        let health = HealthSnapshot::default()
            .with_status("a", HealthStatus::Unreachable)
            .with_status("b", HealthStatus::Unreachable);

        let plan = engine.plan(&OperationIntent::pin("x"), &health, &descriptors);
        assert_eq!(names(&plan), vec!["b", "a"]);
        assert!(plan.last_resort);
    }

    #[test]
    fn test_no_capable_backend_gives_empty_plan() {
        let engine = PolicyEngine::default();
        let descriptors = vec![BackendDescriptor::new("reader", [Capability::Get])];

        let plan =
            engine.plan(&OperationIntent::delete("x"), &HealthSnapshot::default(), &descriptors);
        assert!(plan.is_empty());
        assert_eq!(plan.candidate_for(1), None);
    }

    #[test]
    fn test_candidate_rotation_wraps() {
        let plan = CandidatePlan {
            candidates: vec!["a".into(), "b".into()],
            ..CandidatePlan::default()
        };
        assert_eq!(plan.candidate_for(1), Some("a"));
        assert_eq!(plan.candidate_for(2), Some("b"));
        assert_eq!(plan.candidate_for(3), Some("a"));
    }

    mod prop {
        use proptest::prelude::*;

        use super::*;

        fn status_strategy() -> impl Strategy<Value = HealthStatus> {
            prop_oneof![
                Just(HealthStatus::Healthy),
                Just(HealthStatus::Degraded),
                Just(HealthStatus::Unreachable),
            ]
        }

        proptest! {
            #[test]
            fn plan_is_deterministic_and_well_formed(
                backends in proptest::collection::vec(
                    (0u32..4, status_strategy(), any::<bool>()),
                    0..8,
                ),
                hint in proptest::option::of(0usize..8),
            ) {
                let mut descriptors = Vec::new();
                let mut health = HealthSnapshot::default();
                for (i, (priority, status, capable)) in backends.iter().enumerate() {
                    let name = format!("b{i}");
                    let capability = if *capable { Capability::Pin } else { Capability::Get };
                    descriptors.push(
                        BackendDescriptor::new(name.clone(), [capability]).with_priority(*priority),
                    );
                    health = health.with_status(&name, *status);
                }
                let mut intent = OperationIntent::pin("x");
                if let Some(h) = hint {
                    intent = intent.with_hint(format!("b{h}"));
                }

                let engine = PolicyEngine::default();
                let first = engine.plan(&intent, &health, &descriptors);
                let second = engine.plan(&intent, &health, &descriptors);
                prop_assert_eq!(&first, &second);

                let mut seen = std::collections::HashSet::new();
                for name in &first.candidates {
                    prop_assert!(seen.insert(name.clone()));
                    let descriptor = descriptors.iter().find(|d| &d.name == name).unwrap();
                    prop_assert!(descriptor.supports(Capability::Pin));
                    if !first.last_resort {
                        prop_assert!(health.is_available(name));
                    }
                }

                let reachable_capable = descriptors
                    .iter()
                    .filter(|d| d.supports(Capability::Pin) && health.is_available(&d.name))
                    .count();
                if reachable_capable > 0 {
                    prop_assert_eq!(first.len(), reachable_capable);
                }
            }
        }
    }
}
