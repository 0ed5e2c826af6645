// Copyright (c) 2025-2026 Astrid Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Typed configuration surface for the astrid agent runtime.
//!
//! This crate owns the config *schema* and its startup validation only.
//! Reading config files from disk, merging layers, and environment expansion
//! are host concerns and live outside the runtime crates.

mod schema;

pub use schema::{
    Config, MetacogConfig, MetacogRouterConfig, ModelEntryConfig, ModelPricing, PricingConfig,
    ProfileConfig, RouterConfig,
};

/// Configuration errors are fatal at startup: a runtime started with an
/// invalid budget or probability would misbehave in ways that are much harder
/// to diagnose later (e.g. a negative-jitter sleep or a zero-iteration
/// delegate loop).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{field}: duration must be greater than zero")]
    ZeroDuration { field: &'static str },

    #[error("{field}: {value} is outside [0, 1]")]
    ProbabilityOutOfRange { field: &'static str, value: f64 },

    #[error("metacognitive.min_sleep_secs ({min}) exceeds max_sleep_secs ({max})")]
    SleepBoundsInverted { min: u64, max: u64 },

    #[error("router.max_audit_log must be at least 1")]
    AuditLogBoundZero,

    #[error("router.default_model must not be empty")]
    EmptyDefaultModel,

    #[error("profile {profile}: {field} must be greater than zero")]
    ZeroProfileBudget { profile: String, field: &'static str },
}
