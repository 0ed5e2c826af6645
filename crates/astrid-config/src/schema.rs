// Copyright (c) 2025-2026 Astrid Contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so a named function is required for enabled-by-default
/// fields.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub router: RouterConfig,
    /// Named delegate profiles.  A profile named `general` is always
    /// available; when absent from config the built-in defaults apply.
    #[serde(default)]
    pub profiles: HashMap<String, ProfileConfig>,
    #[serde(default)]
    pub metacognitive: MetacogConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
}

impl Config {
    /// Validate every field that can render the runtime inoperable.
    /// Call once at startup; errors are fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.router.validate()?;
        self.metacognitive.validate()?;
        for (name, p) in &self.profiles {
            p.validate(name)?;
        }
        Ok(())
    }
}

// ─── Router ───────────────────────────────────────────────────────────────────

/// One model in the router catalog.
///
/// `speed` and `quality` are coarse 0–10 rankings relative to the rest of the
/// catalog; `cost_tier` is 0 (free/local) through 5 (frontier-priced).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelEntryConfig {
    pub name: String,
    /// Provider identifier: "ollama" | "anthropic" | ...
    pub provider: String,
    #[serde(default)]
    pub supports_tools: bool,
    #[serde(default)]
    pub speed: u8,
    #[serde(default)]
    pub quality: u8,
    #[serde(default)]
    pub cost_tier: u8,
    #[serde(default)]
    pub context_window: u32,
    /// Maximum number of tool schemas the model handles reliably.
    /// 0 means no limit is known.
    #[serde(default)]
    pub max_tools: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Model used when no catalog candidate survives the hard filters.
    pub default_model: String,
    /// Prefer local-provider models on score ties.
    #[serde(default = "default_true")]
    pub local_first: bool,
    #[serde(default)]
    pub models: Vec<ModelEntryConfig>,
    /// Bound on the in-memory decision audit ring.
    #[serde(default = "default_max_audit_log")]
    pub max_audit_log: usize,
}

fn default_max_audit_log() -> usize {
    64
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_model: "qwen2.5:14b".into(),
            local_first: true,
            models: Vec::new(),
            max_audit_log: default_max_audit_log(),
        }
    }
}

impl RouterConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.default_model.is_empty() {
            return Err(ConfigError::EmptyDefaultModel);
        }
        if self.max_audit_log == 0 {
            return Err(ConfigError::AuditLogBoundZero);
        }
        Ok(())
    }
}

// ─── Delegate profiles ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    #[serde(default)]
    pub description: String,
    /// Explicit tool allow-list.  `None` means "all tools minus the
    /// delegate-entry tool itself".
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default)]
    pub system_prompt: String,
    /// Hints forwarded verbatim to the model router.
    #[serde(default)]
    pub router_hints: HashMap<String, String>,
    #[serde(default = "default_max_iter")]
    pub max_iter: u32,
    /// Cumulative output-token budget for one delegate run.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: u64,
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

fn default_max_iter() -> u32 {
    15
}
fn default_max_tokens() -> u64 {
    50_000
}
fn default_max_duration_secs() -> u64 {
    300
}
fn default_tool_timeout_secs() -> u64 {
    60
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            description: String::new(),
            allowed_tools: None,
            system_prompt: String::new(),
            router_hints: HashMap::new(),
            max_iter: default_max_iter(),
            max_tokens: default_max_tokens(),
            max_duration_secs: default_max_duration_secs(),
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

impl ProfileConfig {
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let zero = |field| ConfigError::ZeroProfileBudget {
            profile: name.to_string(),
            field,
        };
        if self.max_iter == 0 {
            return Err(zero("max_iter"));
        }
        if self.max_tokens == 0 {
            return Err(zero("max_tokens"));
        }
        if self.tool_timeout_secs == 0 {
            return Err(zero("tool_timeout_secs"));
        }
        // max_duration_secs == 0 is intentionally allowed: an exhausted
        // wall clock on entry is a defined (and tested) delegate outcome.
        Ok(())
    }
}

// ─── Metacognitive loop ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetacogRouterConfig {
    /// Minimum model quality for this iteration class.
    #[serde(default)]
    pub quality_floor: u8,
}

impl Default for MetacogRouterConfig {
    fn default() -> Self {
        Self { quality_floor: 0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetacogConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Markdown state file carried across iterations.
    #[serde(default = "default_state_file")]
    pub state_file: String,
    #[serde(default = "default_min_sleep_secs")]
    pub min_sleep_secs: u64,
    #[serde(default = "default_max_sleep_secs")]
    pub max_sleep_secs: u64,
    /// Sleep used when the model does not call `set_next_sleep`.
    #[serde(default = "default_sleep_secs")]
    pub default_sleep_secs: u64,
    /// Symmetric jitter factor applied to every computed sleep, in [0, 1].
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Probability that an iteration runs as a supervisor iteration, in [0, 1].
    #[serde(default = "default_supervisor_probability")]
    pub supervisor_probability: f64,
    #[serde(default)]
    pub router: MetacogRouterConfig,
    #[serde(default = "default_supervisor_router")]
    pub supervisor_router: MetacogRouterConfig,
    /// Tools the loop must never see.  New tools are NOT auto-excluded;
    /// operators own this list.
    #[serde(default = "default_exclude_tools")]
    pub exclude_tools: Vec<String>,
    /// Iteration cap for one metacognitive step's inner tool loop.
    #[serde(default = "default_metacog_max_iter")]
    pub max_iter: u32,
}

fn default_state_file() -> String {
    "metacognitive.md".into()
}
fn default_min_sleep_secs() -> u64 {
    60
}
fn default_max_sleep_secs() -> u64 {
    3600
}
fn default_sleep_secs() -> u64 {
    600
}
fn default_jitter() -> f64 {
    0.1
}
fn default_supervisor_probability() -> f64 {
    0.1
}
fn default_supervisor_router() -> MetacogRouterConfig {
    MetacogRouterConfig { quality_floor: 7 }
}
fn default_exclude_tools() -> Vec<String> {
    [
        "delegate",
        "exec",
        "file_read",
        "file_write",
        "session_end",
        "capability_grant",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_metacog_max_iter() -> u32 {
    8
}

impl Default for MetacogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            state_file: default_state_file(),
            min_sleep_secs: default_min_sleep_secs(),
            max_sleep_secs: default_max_sleep_secs(),
            default_sleep_secs: default_sleep_secs(),
            jitter: default_jitter(),
            supervisor_probability: default_supervisor_probability(),
            router: MetacogRouterConfig::default(),
            supervisor_router: default_supervisor_router(),
            exclude_tools: default_exclude_tools(),
            max_iter: default_metacog_max_iter(),
        }
    }
}

impl MetacogConfig {
    pub fn min_sleep(&self) -> Duration {
        Duration::from_secs(self.min_sleep_secs)
    }
    pub fn max_sleep(&self) -> Duration {
        Duration::from_secs(self.max_sleep_secs)
    }
    pub fn default_sleep(&self) -> Duration {
        Duration::from_secs(self.default_sleep_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.min_sleep_secs == 0 {
            return Err(ConfigError::ZeroDuration {
                field: "metacognitive.min_sleep_secs",
            });
        }
        if self.min_sleep_secs > self.max_sleep_secs {
            return Err(ConfigError::SleepBoundsInverted {
                min: self.min_sleep_secs,
                max: self.max_sleep_secs,
            });
        }
        for (field, value) in [
            ("metacognitive.jitter", self.jitter),
            (
                "metacognitive.supervisor_probability",
                self.supervisor_probability,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) || value.is_nan() {
                return Err(ConfigError::ProbabilityOutOfRange { field, value });
            }
        }
        Ok(())
    }
}

// ─── Pricing ──────────────────────────────────────────────────────────────────

/// Per-token USD prices for one model.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelPricing {
    pub in_price: f64,
    pub out_price: f64,
}

/// Pricing map keyed by model name.  Models absent from the map cost 0.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PricingConfig {
    #[serde(default, flatten)]
    pub models: HashMap<String, ModelPricing>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
