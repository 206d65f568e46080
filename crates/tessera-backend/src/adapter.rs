// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Tessera Authors

//! The uniform interface every storage backend is wrapped in.

use async_trait::async_trait;
use tessera_core::{ContentRef, IntentKind, OperationIntent, PayloadHandle};

use crate::error::{AdapterError, AdapterResult};

/// A storage backend behind a capability interface.
///
/// Every call must be idempotent per content reference: pinning content that
/// is already pinned, or putting content that is already stored, succeeds
/// without side effects. Recovery may reissue a call whose outcome was never
/// recorded.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Stores the payload behind `payload` under `content`.
    async fn put(&self, content: &ContentRef, payload: &PayloadHandle) -> AdapterResult<()>;

    /// Pins `content` so the backend retains it.
    async fn pin(&self, content: &ContentRef) -> AdapterResult<()>;

    /// Releases a pin on `content`.
    async fn unpin(&self, content: &ContentRef) -> AdapterResult<()>;

    /// Removes `content`.
    async fn delete(&self, content: &ContentRef) -> AdapterResult<()>;

    /// Moves `content` onto this backend.
    ///
    /// Lands as a put by default; adapters with a cheaper native transfer
    /// path override it.
    async fn migrate(&self, content: &ContentRef, payload: &PayloadHandle) -> AdapterResult<()> {
        self.put(content, payload).await
    }

    /// Lightweight liveness check.
    async fn probe(&self) -> AdapterResult<()>;
}

/// Issues the adapter call matching the intent's kind.
///
/// # Errors
///
/// Returns the adapter's error, or [`AdapterError::InvalidReference`] if a
/// put or migration carries no payload handle.
pub async fn perform(adapter: &dyn BackendAdapter, intent: &OperationIntent) -> AdapterResult<()> {
    let content = &intent.content;
    match intent.kind {
        IntentKind::Put => adapter.put(content, payload_of(intent)?).await,
        IntentKind::Migrate => adapter.migrate(content, payload_of(intent)?).await,
        IntentKind::Pin => adapter.pin(content).await,
        IntentKind::Unpin => adapter.unpin(content).await,
        IntentKind::Delete => adapter.delete(content).await,
    }
}

fn payload_of(intent: &OperationIntent) -> AdapterResult<&PayloadHandle> {
    intent.payload.as_ref().ok_or_else(|| {
        let message = format!("{} intent {} has no payload", intent.kind, intent.id);
        AdapterError::InvalidReference(message)
    })
}
