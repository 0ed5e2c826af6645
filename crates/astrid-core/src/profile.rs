// Copyright (c) 2025-2026 Astrid Contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::time::Duration;

use tracing::warn;

use astrid_config::ProfileConfig;

/// Name of the profile every unknown lookup falls back to.
pub const GENERAL_PROFILE: &str = "general";

const GENERAL_SYSTEM_PROMPT: &str = "You are a focused assistant completing one delegated task. \
     Use the available tools when they help, then answer with a concise \
     final result. Do not ask follow-up questions.";

/// Named preset defining system prompt, tool subset, router hints, and
/// budgets for a delegate run.  Process-lifetime immutable after
/// construction.
#[derive(Debug, Clone)]
pub struct Profile {
    pub name: String,
    pub description: String,
    /// `None` means "all tools minus the delegate-entry tool itself".
    pub allowed_tools: Option<Vec<String>>,
    pub system_prompt: String,
    pub router_hints: HashMap<String, String>,
    pub max_iter: u32,
    pub max_tokens: u64,
    pub max_duration: Duration,
    pub tool_timeout: Duration,
}

impl Profile {
    pub fn general() -> Self {
        let defaults = ProfileConfig::default();
        Self {
            name: GENERAL_PROFILE.into(),
            description: "general-purpose delegate".into(),
            allowed_tools: None,
            system_prompt: GENERAL_SYSTEM_PROMPT.into(),
            router_hints: HashMap::new(),
            max_iter: defaults.max_iter,
            max_tokens: defaults.max_tokens,
            max_duration: defaults.max_duration(),
            tool_timeout: defaults.tool_timeout(),
        }
    }

    pub fn from_config(name: &str, cfg: &ProfileConfig) -> Self {
        Self {
            name: name.to_string(),
            description: cfg.description.clone(),
            allowed_tools: cfg.allowed_tools.clone(),
            system_prompt: if cfg.system_prompt.is_empty() {
                GENERAL_SYSTEM_PROMPT.into()
            } else {
                cfg.system_prompt.clone()
            },
            router_hints: cfg.router_hints.clone(),
            max_iter: cfg.max_iter,
            max_tokens: cfg.max_tokens,
            max_duration: cfg.max_duration(),
            tool_timeout: cfg.tool_timeout(),
        }
    }
}

/// All configured profiles.  A `general` profile is always present.
pub struct ProfileSet {
    profiles: HashMap<String, Profile>,
}

impl ProfileSet {
    pub fn from_config(config: &HashMap<String, ProfileConfig>) -> Self {
        let mut profiles: HashMap<String, Profile> = config
            .iter()
            .map(|(name, cfg)| (name.clone(), Profile::from_config(name, cfg)))
            .collect();
        profiles
            .entry(GENERAL_PROFILE.to_string())
            .or_insert_with(Profile::general);
        Self { profiles }
    }

    /// Add or replace a runtime-constructed profile.
    pub fn insert(&mut self, profile: Profile) {
        self.profiles.insert(profile.name.clone(), profile);
    }

    /// Unknown names fall back to `general`.
    pub fn resolve(&self, name: &str) -> &Profile {
        if let Some(p) = self.profiles.get(name) {
            return p;
        }
        warn!(profile = name, "unknown profile; falling back to general");
        &self.profiles[GENERAL_PROFILE]
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.profiles.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ProfileSet {
    fn default() -> Self {
        Self::from_config(&HashMap::new())
    }
}
