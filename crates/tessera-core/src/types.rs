// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Tessera Authors

//! Common data types shared across Tessera components.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Unique identifier of an operation intent.
///
/// Ids are caller-supplied or generated with [`IntentId::generate`]. An id is
/// never reused for a different operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntentId(String);

impl IntentId {
    /// Creates an intent id from a caller-supplied value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random intent id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IntentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IntentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for IntentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A capability a backend may offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Store new content.
    Put,
    /// Retrieve content.
    Get,
    /// Pin content so the backend retains it.
    Pin,
    /// Release a pin.
    Unpin,
    /// Remove content.
    Delete,
    /// Enumerate stored content.
    List,
    /// Partial reads.
    RangeRead,
}

impl Capability {
    /// Returns the snake_case name of the capability.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Put => "put",
            Self::Get => "get",
            Self::Pin => "pin",
            Self::Unpin => "unpin",
            Self::Delete => "delete",
            Self::List => "list",
            Self::RangeRead => "range_read",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The set of capabilities offered by a backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    /// Creates an empty capability set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the set contains `capability`.
    #[must_use]
    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    /// Adds a capability to the set.
    pub fn insert(&mut self, capability: Capability) {
        self.0.insert(capability);
    }

    /// Iterates over the capabilities in a stable order.
    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }

    /// Returns true if the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[Capability; N]> for CapabilitySet {
    fn from(caps: [Capability; N]) -> Self {
        caps.into_iter().collect()
    }
}

/// The kind of storage operation an intent requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    /// Store content on a backend.
    Put,
    /// Pin content on a backend.
    Pin,
    /// Release a pin on a backend.
    Unpin,
    /// Remove content from a backend.
    Delete,
    /// Move content onto a (usually slower or cheaper) backend.
    Migrate,
}

impl IntentKind {
    /// The backend capability required to execute this kind of intent.
    ///
    /// A migration lands as a write on its target backend.
    #[must_use]
    pub const fn required_capability(&self) -> Capability {
        match self {
            Self::Put | Self::Migrate => Capability::Put,
            Self::Pin => Capability::Pin,
            Self::Unpin => Capability::Unpin,
            Self::Delete => Capability::Delete,
        }
    }

    /// Returns true if intents of this kind carry a payload handle.
    #[must_use]
    pub const fn requires_payload(&self) -> bool {
        matches!(self, Self::Put | Self::Migrate)
    }

    /// Returns the snake_case name of the kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Put => "put",
            Self::Pin => "pin",
            Self::Unpin => "unpin",
            Self::Delete => "delete",
            Self::Migrate => "migrate",
        }
    }
}

impl fmt::Display for IntentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A content address or opaque key identifying stored content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentRef(String);

impl ContentRef {
    /// Creates a content reference.
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    /// Returns the reference as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContentRef {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A handle the backend adapter resolves to the payload bytes.
///
/// The core never holds payload bytes itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayloadHandle(String);

impl PayloadHandle {
    /// Creates a payload handle.
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// Returns the handle as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PayloadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata used by migration rules to choose a target backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentMetadata {
    /// Content size in bytes, when known.
    pub size_bytes: Option<u64>,
    /// Content MIME type, when known.
    pub content_type: Option<String>,
    /// Free-form tags.
    pub tags: BTreeMap<String, String>,
}

/// A caller's request to perform one storage operation.
///
/// Immutable once submitted; the WAL stores a snapshot of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationIntent {
    /// Unique intent id.
    pub id: IntentId,
    /// Requested operation.
    pub kind: IntentKind,
    /// Content the operation acts on.
    pub content: ContentRef,
    /// Payload handle for puts and migrations.
    pub payload: Option<PayloadHandle>,
    /// Backend the caller prefers, tried first when reachable.
    pub backend_hint: Option<String>,
    /// Metadata for rule matching.
    pub metadata: IntentMetadata,
    /// When the intent was created.
    pub requested_at: DateTime<Utc>,
}

impl OperationIntent {
    /// Creates an intent with a generated id.
    pub fn new(kind: IntentKind, content: impl Into<String>) -> Self {
        Self {
            id: IntentId::generate(),
            kind,
            content: ContentRef::new(content),
            payload: None,
            backend_hint: None,
            metadata: IntentMetadata::default(),
            requested_at: Utc::now(),
        }
    }

    /// Creates a put intent.
    pub fn put(content: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::new(IntentKind::Put, content).with_payload(payload)
    }

    /// Creates a pin intent.
    pub fn pin(content: impl Into<String>) -> Self {
        Self::new(IntentKind::Pin, content)
    }

    /// Creates an unpin intent.
    pub fn unpin(content: impl Into<String>) -> Self {
        Self::new(IntentKind::Unpin, content)
    }

    /// Creates a delete intent.
    pub fn delete(content: impl Into<String>) -> Self {
        Self::new(IntentKind::Delete, content)
    }

    /// Creates a migration intent.
    pub fn migrate(content: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::new(IntentKind::Migrate, content).with_payload(payload)
    }

    /// Replaces the generated id with a caller-supplied one.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<IntentId>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets the payload handle.
    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(PayloadHandle::new(payload));
        self
    }

    /// Sets the backend hint.
    #[must_use]
    pub fn with_hint(mut self, backend: impl Into<String>) -> Self {
        self.backend_hint = Some(backend.into());
        self
    }

    /// Sets the content size.
    #[must_use]
    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.metadata.size_bytes = Some(size_bytes);
        self
    }

    /// Sets the content type.
    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.metadata.content_type = Some(content_type.into());
        self
    }

    /// Adds a metadata tag.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.tags.insert(key.into(), value.into());
        self
    }

    /// Checks that the intent is well formed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidIntent`] for an empty id or content reference,
    /// or a missing payload on a put or migration.
    pub fn validate(&self) -> Result<()> {
        if self.id.as_str().is_empty() {
            return Err(Error::InvalidIntent("intent id is empty".to_string()));
        }
        if self.content.as_str().is_empty() {
            return Err(Error::InvalidIntent("content reference is empty".to_string()));
        }
        if self.kind.requires_payload() && self.payload.is_none() {
            return Err(Error::InvalidIntent(format!("{} intent requires a payload", self.kind)));
        }
        if self.backend_hint.as_deref().is_some_and(str::is_empty) {
            return Err(Error::InvalidIntent("backend hint is empty".to_string()));
        }
        Ok(())
    }
}

/// Static description of a configured backend.
///
/// Immutable after registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    /// Unique backend name.
    pub name: String,
    /// Operations the backend supports.
    pub capabilities: CapabilitySet,
    /// Selection weight; higher values are preferred.
    #[serde(default)]
    pub priority: u32,
    /// Whether operations on this backend are known to be slow.
    ///
    /// Submits routed to a slow backend return a pending handle instead of
    /// waiting for the outcome.
    #[serde(default)]
    pub slow: bool,
    /// Maximum concurrent calls into this backend (falls back to the
    /// dispatcher default).
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    /// Backend-specific settings, opaque to the core.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl BackendDescriptor {
    /// Creates a descriptor with default priority.
    pub fn new(name: impl Into<String>, capabilities: impl Into<CapabilitySet>) -> Self {
        Self {
            name: name.into(),
            capabilities: capabilities.into(),
            priority: 0,
            slow: false,
            max_concurrency: None,
            options: BTreeMap::new(),
        }
    }

    /// Sets the priority weight.
    #[must_use]
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Marks the backend as slow.
    #[must_use]
    pub fn slow(mut self) -> Self {
        self.slow = true;
        self
    }

    /// Sets the per-backend concurrency limit.
    #[must_use]
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    /// Adds an opaque option.
    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Returns true if the backend offers `capability`.
    #[must_use]
    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(capability)
    }
}
