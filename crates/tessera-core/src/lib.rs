// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Tessera Authors

//! Core types and utilities for the Tessera storage manager.
//!
//! This crate provides the building blocks shared by every Tessera component:
//! - Configuration management
//! - The caller-visible error taxonomy
//! - Operation intents, backend descriptors and capabilities
//! - Migration rule predicates
//! - Logging bootstrap

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;
pub mod rules;
pub mod types;

pub use config::{
    Config, ConfigValidationError, DispatchConfig, HealthConfig, LogFormat, LoggingConfig,
    PolicyConfig, WalConfig, WalSyncMode,
};
pub use error::{Error, ResourceKind, Result};
pub use logging::init_logging;
pub use rules::{MigrationRule, RuleMatch};
pub use types::{
    BackendDescriptor, Capability, CapabilitySet, ContentRef, IntentId, IntentKind,
    IntentMetadata, OperationIntent, PayloadHandle,
};
