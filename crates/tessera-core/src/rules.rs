// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Tessera Authors

//! Migration rules.
//!
//! A migration rule maps intents matching a predicate onto a target backend.
//! Rules are evaluated in ascending `priority` order, ties broken by
//! declaration order, and the first matching rule wins. Every condition set on
//! a [`RuleMatch`] must hold for the rule to match; an empty matcher matches
//! every intent.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{IntentKind, OperationIntent};

/// A declarative routing rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRule {
    /// Rule name, reported in candidate plans.
    pub name: String,
    /// Evaluation order; lower values are evaluated first.
    #[serde(default)]
    pub priority: u32,
    /// Predicate selecting the intents this rule applies to.
    #[serde(default, rename = "match")]
    pub matcher: RuleMatch,
    /// Name of the backend matching intents are routed to.
    pub target: String,
}

impl MigrationRule {
    /// Creates a rule with an empty matcher.
    pub fn new(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self { name: name.into(), priority: 0, matcher: RuleMatch::default(), target: target.into() }
    }

    /// Sets the evaluation priority.
    #[must_use]
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the predicate.
    #[must_use]
    pub fn with_match(mut self, matcher: RuleMatch) -> Self {
        self.matcher = matcher;
        self
    }

    /// Returns true if this rule applies to `intent`.
    #[must_use]
    pub fn matches(&self, intent: &OperationIntent) -> bool {
        self.matcher.matches(intent)
    }
}

/// Conditions an intent must satisfy for a rule to apply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleMatch {
    /// Intent kinds the rule applies to (empty means any).
    pub kinds: Vec<IntentKind>,
    /// Content reference prefix.
    pub content_prefix: Option<String>,
    /// Tags that must all be present with equal values.
    pub tags: BTreeMap<String, String>,
    /// Exact content type.
    pub content_type: Option<String>,
    /// Minimum content size in bytes (inclusive).
    pub min_size_bytes: Option<u64>,
    /// Maximum content size in bytes (inclusive).
    pub max_size_bytes: Option<u64>,
}

impl RuleMatch {
    /// Returns true if every configured condition holds for `intent`.
    ///
    /// Size bounds never match an intent whose size is unknown.
    #[must_use]
    pub fn matches(&self, intent: &OperationIntent) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&intent.kind) {
            return false;
        }

        if let Some(prefix) = &self.content_prefix {
            if !intent.content.as_str().starts_with(prefix.as_str()) {
                return false;
            }
        }

        let tags_match = self
            .tags
            .iter()
            .all(|(key, value)| intent.metadata.tags.get(key).is_some_and(|v| v == value));
        if !tags_match {
            return false;
        }

        if let Some(content_type) = &self.content_type {
            if intent.metadata.content_type.as_deref() != Some(content_type.as_str()) {
                return false;
            }
        }

        let size = intent.metadata.size_bytes;
        if let Some(min) = self.min_size_bytes {
            if !size.is_some_and(|s| s >= min) {
                return false;
            }
        }
        if let Some(max) = self.max_size_bytes {
            if !size.is_some_and(|s| s <= max) {
                return false;
            }
        }

        true
    }
}

/// Returns the first rule matching `intent`, in evaluation order.
///
/// The sort is stable, so rules sharing a priority keep declaration order.
#[must_use]
pub fn first_match<'a>(
    rules: &'a [MigrationRule],
    intent: &OperationIntent,
) -> Option<&'a MigrationRule> {
    let mut ordered: Vec<&MigrationRule> = rules.iter().collect();
    ordered.sort_by_key(|rule| rule.priority);
    ordered.into_iter().find(|rule| rule.matches(intent))
}
