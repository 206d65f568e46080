// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Tessera Authors

//! Storage backends for the Tessera storage manager.
//!
//! This crate provides:
//! - The [`BackendAdapter`] capability interface every backend is wrapped in
//! - A registry of adapters with per-backend concurrency limits
//! - Health tracking over a trailing window, with hysteresis
//! - An active health monitor probing every backend on an interval
//!
//! # Architecture
//!
//! Health is fed from two directions:
//! 1. The [`HealthMonitor`] probes each backend periodically
//! 2. The dispatcher reports the outcome of every backend call
//!
//! Both land in the same [`HealthBoard`], which publishes an immutable
//! [`HealthSnapshot`] after each signal. Backend selection reads snapshots
//! and never waits on updates.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod adapter;
pub mod error;
pub mod health;
pub mod monitor;
pub mod registry;
pub mod testing;

pub use adapter::{perform, BackendAdapter};
pub use error::{AdapterError, AdapterResult};
pub use health::{HealthBoard, HealthEvent, HealthSnapshot, HealthState, HealthStatus, Signal};
pub use monitor::HealthMonitor;
pub use registry::{BackendRegistry, RegisteredBackend};
