// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Tessera Authors

//! Intent coordination for Tessera.
//!
//! This crate ties the log and the backends together:
//!
//! - [`PolicyEngine`] plans which backends to try for an intent.
//! - [`Dispatcher`] drives an intent through the log and the backends, with
//!   retries, failover and backoff.
//! - [`RecoveryRunner`] re-drives unsettled intents after a restart.
//! - [`StorageManager`] is the caller-facing surface.
//!
//! ```text
//!  submit(intent)
//!       │
//!       ▼
//!  ┌──────────┐  append    ┌─────┐
//!  │ Manager  │──────────► │ WAL │ ◄──── recovery replays on start
//!  └────┬─────┘            └─────┘
//!       │ drive                ▲
//!       ▼                      │ dispatched / committed / failed
//!  ┌────────────┐  plan   ┌────┴─────┐
//!  │ Dispatcher │───────► │  Policy  │ ◄──── health snapshot
//!  └────┬───────┘         └──────────┘
//!       │ call (permits, timeout)
//!       ▼
//!  ┌──────────┐
//!  │ Backends │ ──── outcomes feed health
//!  └──────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use tessera_core::{BackendDescriptor, Capability, Config, OperationIntent};
//! use tessera_manager::StorageManager;
//!
//! let manager = StorageManager::open(Config::default()).await?;
//! manager.register_backend(
//!     BackendDescriptor::new("local", [Capability::Put, Capability::Pin]),
//!     local_adapter,
//! )?;
//! manager.start().await?;
//!
//! let outcome = manager.submit(OperationIntent::pin("bafy...")).await?;
//! let result = outcome.wait().await?;
//! println!("pinned on {}", result.backend);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod dispatcher;
pub mod handle;
pub mod manager;
pub mod outcome;
pub mod policy;
pub mod recovery;

pub use dispatcher::Dispatcher;
pub use handle::OperationHandle;
pub use manager::{StorageManager, SubmitOutcome, TerminalEvent};
pub use outcome::{outcome_of, OperationResult, Outcome};
pub use policy::{CandidatePlan, PolicyEngine};
pub use recovery::{RecoveryReport, RecoveryRunner};
