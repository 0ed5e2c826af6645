// Copyright (c) 2025-2026 Astrid Contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use astrid_config::RouterConfig;

use crate::ModelEntry;

/// Providers that run on the local machine.  Local models win score ties
/// and are the only candidates under the `local_only` hint.
const LOCAL_PROVIDERS: &[&str] = &["ollama"];

/// Token reserve assumed per tool schema when estimating prompt size.
const TOKENS_PER_TOOL: u64 = 512;

/// Recognized router hints.  Unrecognized keys are carried but ignored.
pub mod hints {
    /// `"true"` keeps only local-provider models.
    pub const LOCAL_ONLY: &str = "local_only";
    /// Minimum quality rank; models below it are dropped.
    pub const QUALITY_FLOOR: &str = "quality_floor";
    /// `"true"` adds a fixed bonus to the speed weight.
    pub const PREFER_SPEED: &str = "prefer_speed";
    /// Free-form caller identity recorded in the audit log.
    pub const MISSION: &str = "mission";
    /// `"disabled"` marks requests that must not be re-delegated.
    pub const DELEGATION_GATING: &str = "delegation_gating";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Background,
    Interactive,
    Critical,
}

#[derive(Debug, Clone)]
pub struct RouterRequest {
    pub query: String,
    pub needs_tools: bool,
    pub tool_count: u32,
    pub priority: Priority,
    pub hints: HashMap<String, String>,
}

impl RouterRequest {
    pub fn background(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            needs_tools: false,
            tool_count: 0,
            priority: Priority::Background,
            hints: HashMap::new(),
        }
    }

    fn hint(&self, key: &str) -> Option<&str> {
        self.hints.get(key).map(String::as_str)
    }

    fn hint_is_true(&self, key: &str) -> bool {
        self.hint(key) == Some("true")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub model: String,
    pub rationale: String,
}

/// One remembered routing decision.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    /// Leading slice of the query; enough to recognize the request.
    pub query_digest: String,
    pub needs_tools: bool,
    pub priority: Priority,
    pub mission: String,
    pub model: String,
    pub rationale: String,
}

struct Weights {
    quality: f64,
    speed: f64,
    cost_penalty: f64,
}

fn weights_for(priority: Priority) -> Weights {
    match priority {
        // Background work is plentiful; cost dominates.
        Priority::Background => Weights {
            quality: 1.0,
            speed: 0.5,
            cost_penalty: 2.0,
        },
        // A user is waiting; latency dominates.
        Priority::Interactive => Weights {
            quality: 1.5,
            speed: 2.0,
            cost_penalty: 0.5,
        },
        // Correctness at any price.
        Priority::Critical => Weights {
            quality: 3.0,
            speed: 0.5,
            cost_penalty: 0.0,
        },
    }
}

const PREFER_SPEED_BONUS: f64 = 1.5;

pub struct Router {
    default_model: String,
    local_first: bool,
    models: Vec<ModelEntry>,
    audit: Mutex<VecDeque<AuditEntry>>,
    max_audit: usize,
}

impl Router {
    pub fn new(cfg: &RouterConfig) -> Self {
        Self {
            default_model: cfg.default_model.clone(),
            local_first: cfg.local_first,
            models: cfg.models.clone(),
            audit: Mutex::new(VecDeque::new()),
            max_audit: cfg.max_audit_log,
        }
    }

    /// Pick a model for the request.  Never fails: when no catalog entry
    /// survives the hard filters, the configured default model is returned
    /// with a fallback rationale.
    pub fn select(&self, req: &RouterRequest) -> Decision {
        let decision = self.score(req);
        debug!(model = %decision.model, rationale = %decision.rationale, "routing decision");
        self.record(req, &decision);
        decision
    }

    fn score(&self, req: &RouterRequest) -> Decision {
        // Per-tool schema reserve applies only when the request will
        // actually carry tools.
        let mut estimated_prompt = (req.query.len() as u64) / 4;
        if req.needs_tools {
            estimated_prompt += TOKENS_PER_TOOL * u64::from(req.tool_count);
        }

        let quality_floor: u8 = match req.hint(hints::QUALITY_FLOOR) {
            Some(raw) => match raw.parse() {
                Ok(n) => n,
                Err(_) => {
                    warn!(value = raw, "unparseable quality_floor hint; ignoring");
                    0
                }
            },
            None => 0,
        };
        let local_only = req.hint_is_true(hints::LOCAL_ONLY);

        let candidates: Vec<&ModelEntry> = self
            .models
            .iter()
            .filter(|m| !req.needs_tools || m.supports_tools)
            .filter(|m| m.context_window == 0 || u64::from(m.context_window) >= estimated_prompt)
            .filter(|m| m.max_tools == 0 || m.max_tools >= req.tool_count)
            .filter(|m| !local_only || is_local(m))
            .filter(|m| m.quality >= quality_floor)
            .collect();

        if candidates.is_empty() {
            return Decision {
                model: self.default_model.clone(),
                rationale: "fallback: no candidate met constraints".into(),
            };
        }

        let mut w = weights_for(req.priority);
        if req.hint_is_true(hints::PREFER_SPEED) {
            w.speed += PREFER_SPEED_BONUS;
        }

        let mut scored: Vec<(f64, &ModelEntry)> = candidates
            .into_iter()
            .map(|m| {
                let score = w.quality * f64::from(m.quality) + w.speed * f64::from(m.speed)
                    - w.cost_penalty * f64::from(m.cost_tier);
                (score, m)
            })
            .collect();

        // Score descending, then local preference, lower cost, and finally
        // lexicographic name order so the choice is deterministic.
        scored.sort_by(|(sa, a), (sb, b)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    if self.local_first {
                        is_local(b).cmp(&is_local(a))
                    } else {
                        std::cmp::Ordering::Equal
                    }
                })
                .then_with(|| a.cost_tier.cmp(&b.cost_tier))
                .then_with(|| a.name.cmp(&b.name))
        });

        let (score, best) = &scored[0];
        Decision {
            model: best.name.clone(),
            rationale: format!(
                "score {score:.1} (quality {} speed {} cost {}) for {:?} priority",
                best.quality, best.speed, best.cost_tier, req.priority
            ),
        }
    }

    fn record(&self, req: &RouterRequest, decision: &Decision) {
        let mut digest: String = req.query.chars().take(64).collect();
        if digest.len() < req.query.len() {
            digest.push('…');
        }
        let entry = AuditEntry {
            at: Utc::now(),
            query_digest: digest,
            needs_tools: req.needs_tools,
            priority: req.priority,
            mission: req.hint(hints::MISSION).unwrap_or_default().to_string(),
            model: decision.model.clone(),
            rationale: decision.rationale.clone(),
        };
        let mut audit = self.audit.lock().unwrap();
        audit.push_back(entry);
        while audit.len() > self.max_audit {
            audit.pop_front();
        }
    }

    /// Snapshot of the decision audit, oldest first.
    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.audit.lock().unwrap().iter().cloned().collect()
    }
}

fn is_local(m: &ModelEntry) -> bool {
    LOCAL_PROVIDERS.contains(&m.provider.as_str())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
