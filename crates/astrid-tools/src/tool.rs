// Copyright (c) 2025-2026 Astrid Contributors
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;

use crate::scope::Scope;

/// Trait that every tool must implement.
///
/// `execute` receives the caller's scope (deadline, cancellation, carried
/// identifiers) and the parsed JSON argument object.  Errors returned here
/// are information for the model — the agent loop converts them into tool
/// messages — not process failures.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique within a registry; must match `[a-z_][a-z0-9_]*`.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for the parameters object.
    fn parameters_schema(&self) -> Value;

    /// Capability tags used by tag-filtered registry views.
    /// Membership tests are case-sensitive.
    fn tags(&self) -> &[&str] {
        &[]
    }

    async fn execute(&self, scope: &Scope, args: Value) -> anyhow::Result<String>;
}

/// `true` when `name` is a legal registry tool name (`[a-z_][a-z0-9_]*`).
pub fn valid_tool_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
