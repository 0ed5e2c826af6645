// Copyright (c) 2025-2026 Astrid Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Narrow interfaces to external collaborators.
//!
//! The core never talks to the archive backend, the clock/weather
//! formatter, or the temp-label store directly — hosts implement these
//! traits and hand them in.  All archive failures are log-and-continue:
//! a run's result must never depend on a background store being healthy.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::OnceLock;

use astrid_model::Message;
use astrid_store::IterationRecord;

/// Metadata opening one archived conversation session.
#[derive(Debug, Clone)]
pub struct ArchiveSessionMeta {
    pub conversation_id: String,
    pub parent_session_id: String,
    pub parent_tool_call_id: String,
    pub task: String,
    pub profile: String,
    pub model: String,
    pub started_at: DateTime<Utc>,
}

/// Sink for full execution traces (messages, iteration records, session
/// lifecycle).  The physical backend is a host concern.
#[async_trait]
pub trait Archiver: Send + Sync {
    async fn begin_session(&self, meta: &ArchiveSessionMeta) -> anyhow::Result<()>;
    async fn record_messages(
        &self,
        conversation_id: &str,
        messages: &[Message],
    ) -> anyhow::Result<()>;
    async fn record_iterations(
        &self,
        conversation_id: &str,
        iterations: &[IterationRecord],
    ) -> anyhow::Result<()>;
    async fn end_session(&self, conversation_id: &str, reason: &str) -> anyhow::Result<()>;
}

/// Source of the "current conditions" block appended to delegate system
/// prompts (local time, timezone, whatever the host deems current).
pub trait ConditionsSource: Send + Sync {
    fn current_conditions(&self) -> String;
}

/// Lookup for `temp:LABEL` tokens in task and guidance text.
pub trait LabelStore: Send + Sync {
    fn get(&self, label: &str) -> Option<String>;
}

fn label_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"temp:([A-Za-z0-9_\-]+)").expect("static regex"))
}

/// Replace every `temp:LABEL` token that resolves in `store`.
/// Unresolvable tokens are left verbatim so the model can see what was
/// referenced.
pub fn expand_labels(text: &str, store: &dyn LabelStore) -> String {
    label_regex()
        .replace_all(text, |caps: &regex::Captures<'_>| {
            match store.get(&caps[1]) {
                Some(value) => value,
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}
