// Copyright (c) 2025-2026 Astrid Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! The metacognitive loop: a perpetual, self-scheduled background task.
//!
//! Each iteration is independent — fresh conversation id, fresh prompt, no
//! message carryover.  Continuity lives in a markdown state file that the
//! model rewrites through a tool; the loop appends a machine-readable
//! iteration log as HTML comments and prunes old log blocks while
//! preserving the model's own notes byte-identical.
//!
//! The sleep between iterations is chosen by the model itself (via the
//! `set_next_sleep` tool), clamped to configured bounds and jittered so
//! iterations do not phase-lock with other periodic work.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use astrid_config::MetacogConfig;
use astrid_model::{apply_salvage, ChatClient, ChatRequest, Message};
use astrid_router::{hints, Priority, Router, RouterRequest};
use astrid_store::{UsageRecorder, UsageRole};
use astrid_tools::scope::KEY_CONVERSATION_ID;
use astrid_tools::{Scope, Tool, ToolView};

use crate::prompts::metacognitive_prompt;

const ITER_LOG_PREFIX: &str = "<!-- iteration_log:";
const ITER_LOG_SUFFIX: &str = "-->\n";
const STATE_READ_CAP: usize = 16 * 1024;
const TRUNCATION_MARKER: &str = "\n\n[... state truncated ...]";
const RETAINED_LOG_BLOCKS: usize = 5;
const METACOG_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// What one iteration did, for callers that surface loop health.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub conversation_id: String,
    pub model: String,
    pub supervisor: bool,
    pub tools_called: Vec<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub summary: String,
    pub sleep: Duration,
    pub elapsed: Duration,
}

pub struct MetacogLoop {
    client: Arc<dyn ChatClient>,
    tools: ToolView,
    router: Option<Arc<Router>>,
    default_model: String,
    config: MetacogConfig,
    usage: Option<Arc<UsageRecorder>>,
    state_path: PathBuf,
    /// Written by `set_next_sleep`, consumed once per iteration.
    next_sleep: Arc<Mutex<Option<Duration>>>,
    /// Conversation id of the in-flight iteration, for observers.
    current_conversation_id: Arc<Mutex<String>>,
}

impl MetacogLoop {
    pub fn new(
        client: Arc<dyn ChatClient>,
        tools: ToolView,
        config: MetacogConfig,
        default_model: impl Into<String>,
    ) -> Self {
        let state_path = PathBuf::from(&config.state_file);
        Self {
            client,
            tools,
            router: None,
            default_model: default_model.into(),
            config,
            usage: None,
            state_path,
            next_sleep: Arc::new(Mutex::new(None)),
            current_conversation_id: Arc::new(Mutex::new(String::new())),
        }
    }

    pub fn with_router(mut self, router: Arc<Router>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_usage(mut self, usage: Arc<UsageRecorder>) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Override the state-file path (tests point this at a temp dir).
    pub fn with_state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_path = path.into();
        self
    }

    pub fn current_conversation_id(&self) -> String {
        self.current_conversation_id.lock().unwrap().clone()
    }

    /// Run until the scope is cancelled.  Iteration failures are logged and
    /// the loop sleeps its default interval before trying again.
    pub async fn run(&self, scope: &Scope) {
        info!(state_file = %self.state_path.display(), "metacognitive loop starting");
        loop {
            if scope.err().is_some() {
                return;
            }
            let sleep = match self.step(scope).await {
                Ok(report) => {
                    debug!(
                        conversation_id = %report.conversation_id,
                        supervisor = report.supervisor,
                        sleep_secs = report.sleep.as_secs(),
                        "metacognitive iteration complete"
                    );
                    report.sleep
                }
                Err(e) => {
                    warn!("metacognitive iteration failed: {e}");
                    compute_sleep(None, &self.config, rand::random::<f64>())
                }
            };
            tokio::select! {
                _ = scope.cancelled() => return,
                _ = tokio::time::sleep(sleep) => {}
            }
        }
    }

    /// One iteration: read state, reflect, record, schedule the next wake.
    pub async fn step(&self, scope: &Scope) -> anyhow::Result<StepReport> {
        let t0 = Instant::now();
        // A stale request from the previous iteration must never leak into
        // this one.
        *self.next_sleep.lock().unwrap() = None;

        let supervisor = rand::random::<f64>() < self.config.supervisor_probability;
        let state = read_state_capped(&self.state_path);
        let prompt = metacognitive_prompt(&state, supervisor);

        let view = self
            .tools
            .excluding(&self.config.exclude_tools)
            .with_tool(Arc::new(SetNextSleepTool {
                next_sleep: Arc::clone(&self.next_sleep),
            }))
            .with_tool(Arc::new(UpdateStateTool {
                path: self.state_path.clone(),
            }));

        let model = self.select_model(&prompt, supervisor, &view);
        let conversation_id = format!("metacog-{}", Utc::now().timestamp_millis());
        *self.current_conversation_id.lock().unwrap() = conversation_id.clone();
        let iter_scope = scope.with_value(KEY_CONVERSATION_ID, conversation_id.clone());

        let (summary, tools_called, input_tokens, output_tokens) =
            self.run_reflection(&iter_scope, &view, &model, &prompt).await?;

        // Append the iteration log to the *current* file content — the
        // model may have rewritten its state mid-iteration.  This read is
        // uncapped: user state must never be silently dropped on rewrite.
        let elapsed = t0.elapsed();
        let sleep_requested = *self.next_sleep.lock().unwrap();
        let block = format_iteration_log(
            &conversation_id,
            &model,
            supervisor,
            elapsed,
            &tools_called,
            input_tokens,
            output_tokens,
            sleep_requested,
        );
        let existing = std::fs::read_to_string(&self.state_path).unwrap_or_default();
        let updated = prune_iteration_logs(&format!("{existing}{block}"), RETAINED_LOG_BLOCKS);
        if let Err(e) = std::fs::write(&self.state_path, updated) {
            warn!(path = %self.state_path.display(), "state file write failed: {e}");
        }

        if let Some(usage) = &self.usage {
            let provider = self.client.provider_for(&model).to_string();
            if let Err(e) = usage.record(
                &conversation_id,
                &conversation_id,
                &model,
                &provider,
                input_tokens,
                output_tokens,
                UsageRole::Metacognitive,
                None,
            ) {
                warn!("usage write failed: {e}");
            }
        }

        let sleep = compute_sleep(sleep_requested, &self.config, rand::random::<f64>());
        Ok(StepReport {
            conversation_id,
            model,
            supervisor,
            tools_called,
            input_tokens,
            output_tokens,
            summary,
            sleep,
            elapsed,
        })
    }

    fn select_model(&self, prompt: &str, supervisor: bool, view: &ToolView) -> String {
        let Some(router) = &self.router else {
            return self.default_model.clone();
        };
        let quality_floor = if supervisor {
            self.config.supervisor_router.quality_floor
        } else {
            self.config.router.quality_floor
        };
        let mut req = RouterRequest {
            query: prompt.to_string(),
            needs_tools: true,
            tool_count: view.len() as u32,
            priority: Priority::Background,
            hints: Default::default(),
        };
        // Routine iterations stay local; supervisor iterations may escalate
        // to a stronger (possibly remote) model.
        req.hints
            .insert(hints::LOCAL_ONLY.into(), (!supervisor).to_string());
        req.hints
            .insert(hints::QUALITY_FLOOR.into(), quality_floor.to_string());
        req.hints
            .insert(hints::MISSION.into(), "metacognitive".into());
        req.hints
            .insert(hints::DELEGATION_GATING.into(), "disabled".into());
        let decision = router.select(&req);
        if decision.model.is_empty() {
            self.default_model.clone()
        } else {
            decision.model
        }
    }

    /// The iteration's inner tool loop: bounded, serial, scope-raced.
    async fn run_reflection(
        &self,
        scope: &Scope,
        view: &ToolView,
        model: &str,
        prompt: &str,
    ) -> anyhow::Result<(String, Vec<String>, u64, u64)> {
        let schemas: Vec<astrid_model::ToolSchema> = view
            .schemas()
            .into_iter()
            .map(|s| astrid_model::ToolSchema {
                name: s.name,
                description: s.description,
                parameters: s.parameters,
            })
            .collect();
        let view_names = view.names();

        let mut messages = vec![Message::user(prompt)];
        let mut tools_called: Vec<String> = Vec::new();
        let mut input_tokens = 0u64;
        let mut output_tokens = 0u64;

        for _ in 0..self.config.max_iter {
            scope.check()?;
            let req = ChatRequest {
                model: model.to_string(),
                messages: messages.clone(),
                tools: schemas.clone(),
                timeout: scope.remaining(),
            };
            let outcome = tokio::select! {
                biased;
                _ = scope.cancelled() => None,
                r = self.client.chat_stream(req, None) => Some(r),
            };
            let mut resp = match outcome {
                None => anyhow::bail!("metacognitive iteration interrupted"),
                Some(r) => r?,
            };
            apply_salvage(&mut resp, &view_names);
            input_tokens += resp.input_tokens;
            output_tokens += resp.output_tokens;

            let calls = resp.message.tool_calls.clone();
            let text = resp.message.content.clone();
            messages.push(resp.message);

            if calls.is_empty() {
                return Ok((text, tools_called, input_tokens, output_tokens));
            }
            for call in &calls {
                tools_called.push(call.function.name.clone());
                let args = Value::Object(call.function.arguments.clone());
                let result = match tokio::time::timeout(
                    METACOG_TOOL_TIMEOUT,
                    view.execute(scope, &call.function.name, args),
                )
                .await
                {
                    Err(_elapsed) => format!(
                        "tool {} timed out after {}s",
                        call.function.name,
                        METACOG_TOOL_TIMEOUT.as_secs()
                    ),
                    Ok(Err(e)) => format!("Error: {e}"),
                    Ok(Ok(output)) => output,
                };
                messages.push(Message::tool_result(&call.id, result));
            }
        }
        // The model kept calling tools until the cap; treat whatever state
        // it left behind as the iteration's outcome.
        Ok((String::new(), tools_called, input_tokens, output_tokens))
    }
}

// ─── Loop-private tools ───────────────────────────────────────────────────────

struct SetNextSleepTool {
    next_sleep: Arc<Mutex<Option<Duration>>>,
}

#[async_trait]
impl Tool for SetNextSleepTool {
    fn name(&self) -> &str {
        "set_next_sleep"
    }
    fn description(&self) -> &str {
        "Set how many seconds the metacognitive loop sleeps before its next \
         iteration. Clamped to the configured bounds."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "seconds": {
                    "type": "integer",
                    "description": "Sleep duration in seconds"
                }
            },
            "required": ["seconds"]
        })
    }
    async fn execute(&self, _scope: &Scope, args: Value) -> anyhow::Result<String> {
        let seconds = args["seconds"]
            .as_u64()
            .ok_or_else(|| anyhow::anyhow!("seconds must be a non-negative integer"))?;
        *self.next_sleep.lock().unwrap() = Some(Duration::from_secs(seconds));
        Ok(format!("next sleep set to {seconds}s"))
    }
}

struct UpdateStateTool {
    path: PathBuf,
}

#[async_trait]
impl Tool for UpdateStateTool {
    fn name(&self) -> &str {
        "update_metacognitive_state"
    }
    fn description(&self) -> &str {
        "Replace the metacognitive state file with new markdown content. \
         Keep it short; it is re-read every iteration."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": "Full new state file content"
                }
            },
            "required": ["content"]
        })
    }
    async fn execute(&self, _scope: &Scope, args: Value) -> anyhow::Result<String> {
        let content = args["content"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("content must be a string"))?;
        tokio::fs::write(&self.path, content).await?;
        Ok("state updated".into())
    }
}

// ─── State file handling ──────────────────────────────────────────────────────

/// Read the state file for prompt composition, capped at 16 KiB with a
/// truncation marker on overflow.  Absence is a normal first run.
fn read_state_capped(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(s) if s.len() > STATE_READ_CAP => {
            let mut end = STATE_READ_CAP;
            while !s.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}{TRUNCATION_MARKER}", &s[..end])
        }
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no metacognitive state file yet");
            String::new()
        }
        Err(e) => {
            warn!(path = %path.display(), "state file read failed: {e}");
            String::new()
        }
    }
}

/// `[a x3, b]` in first-call order.
fn format_tools_called(calls: &[String]) -> String {
    let mut order: Vec<&str> = Vec::new();
    let mut counts: std::collections::HashMap<&str, u32> = std::collections::HashMap::new();
    for name in calls {
        if !counts.contains_key(name.as_str()) {
            order.push(name);
        }
        *counts.entry(name).or_insert(0) += 1;
    }
    let entries: Vec<String> = order
        .into_iter()
        .map(|name| match counts[name] {
            1 => name.to_string(),
            n => format!("{name} x{n}"),
        })
        .collect();
    format!("[{}]", entries.join(", "))
}

#[allow(clippy::too_many_arguments)]
fn format_iteration_log(
    conversation_id: &str,
    model: &str,
    supervisor: bool,
    elapsed: Duration,
    tools_called: &[String],
    tokens_in: u64,
    tokens_out: u64,
    sleep_set: Option<Duration>,
) -> String {
    let sleep = match sleep_set {
        Some(d) => format!("{}s", d.as_secs()),
        None => "(default)".to_string(),
    };
    format!(
        "{ITER_LOG_PREFIX}\nconversation_id: {conversation_id}\nmodel: {model}\n\
         supervisor: {supervisor}\ntimestamp: {}\nelapsed: {:.1}s\n\
         tools_called: {}\ntokens_in: {tokens_in}\ntokens_out: {tokens_out}\n\
         sleep_set: {sleep}\n{ITER_LOG_SUFFIX}",
        Utc::now().to_rfc3339(),
        elapsed.as_secs_f64(),
        format_tools_called(tools_called),
    )
}

/// Drop the oldest iteration-log blocks so at most `keep` remain.
/// Everything outside the dropped spans — the model's own notes, and any
/// content interleaved between blocks — is preserved byte-identical.
fn prune_iteration_logs(content: &str, keep: usize) -> String {
    let mut spans: Vec<(usize, usize)> = Vec::new();
    let mut idx = 0;
    while let Some(rel) = content[idx..].find(ITER_LOG_PREFIX) {
        let start = idx + rel;
        match content[start..].find(ITER_LOG_SUFFIX) {
            Some(end_rel) => {
                let end = start + end_rel + ITER_LOG_SUFFIX.len();
                spans.push((start, end));
                idx = end;
            }
            // Unterminated block: stop scanning, touch nothing past here.
            None => break,
        }
    }
    if spans.len() <= keep {
        return content.to_string();
    }
    let drop = &spans[..spans.len() - keep];
    let mut out = String::with_capacity(content.len());
    let mut cursor = 0;
    for (start, end) in drop {
        out.push_str(&content[cursor..*start]);
        cursor = *end;
    }
    out.push_str(&content[cursor..]);
    out
}

/// `clamp(requested_or_default, min, max)`, then symmetric jitter
/// `1 + jitter·(2r−1)` with `r ∈ [0, 1)`, then re-clamp.
fn compute_sleep(requested: Option<Duration>, cfg: &MetacogConfig, r: f64) -> Duration {
    let base = requested.unwrap_or_else(|| cfg.default_sleep());
    let clamped = base.clamp(cfg.min_sleep(), cfg.max_sleep());
    let factor = (1.0 + cfg.jitter * (2.0 * r - 1.0)).max(0.0);
    clamped.mul_f64(factor).clamp(cfg.min_sleep(), cfg.max_sleep())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> MetacogConfig {
        MetacogConfig {
            min_sleep_secs: 60,
            max_sleep_secs: 3600,
            default_sleep_secs: 600,
            jitter: 0.1,
            ..Default::default()
        }
    }

    // ── compute_sleep ─────────────────────────────────────────────────────────

    #[test]
    fn sleep_defaults_when_unset() {
        let s = compute_sleep(None, &cfg(), 0.5);
        assert_eq!(s, Duration::from_secs(600));
    }

    #[test]
    fn sleep_clamps_below_minimum() {
        let s = compute_sleep(Some(Duration::from_secs(1)), &cfg(), 0.5);
        assert_eq!(s, Duration::from_secs(60));
    }

    #[test]
    fn sleep_clamps_above_maximum() {
        let s = compute_sleep(Some(Duration::from_secs(86_400)), &cfg(), 0.5);
        assert_eq!(s, Duration::from_secs(3600));
    }

    #[test]
    fn jitter_stays_within_bounds_for_all_r() {
        let c = cfg();
        for r in [0.0, 0.1, 0.5, 0.9, 0.999] {
            for req in [1u64, 60, 600, 3600, 100_000] {
                let s = compute_sleep(Some(Duration::from_secs(req)), &c, r);
                assert!(s >= c.min_sleep(), "r={r} req={req} gave {s:?}");
                assert!(s <= c.max_sleep(), "r={r} req={req} gave {s:?}");
            }
        }
    }

    #[test]
    fn jitter_is_symmetric_around_request() {
        let c = cfg();
        let low = compute_sleep(Some(Duration::from_secs(600)), &c, 0.0);
        let high = compute_sleep(Some(Duration::from_secs(600)), &c, 0.999);
        // jitter 0.1: r=0 → ×0.9, r→1 → ×~1.1
        assert_eq!(low, Duration::from_secs(540));
        assert!(high > Duration::from_secs(659) && high < Duration::from_secs(661));
    }

    // ── iteration log formatting and pruning ──────────────────────────────────

    fn block(n: usize) -> String {
        format_iteration_log(
            &format!("metacog-{n}"),
            "qwen2.5:14b",
            false,
            Duration::from_secs(3),
            &["set_next_sleep".to_string()],
            500,
            80,
            Some(Duration::from_secs(600)),
        )
    }

    #[test]
    fn log_block_has_exact_markers() {
        let b = block(1);
        assert!(b.starts_with("<!-- iteration_log:\n"));
        assert!(b.ends_with("-->\n"));
        assert!(b.contains("conversation_id: metacog-1"));
        assert!(b.contains("sleep_set: 600s"));
    }

    #[test]
    fn tools_called_formats_counts_in_first_call_order() {
        let calls = vec![
            "update_metacognitive_state".to_string(),
            "set_next_sleep".to_string(),
            "update_metacognitive_state".to_string(),
            "update_metacognitive_state".to_string(),
        ];
        assert_eq!(
            format_tools_called(&calls),
            "[update_metacognitive_state x3, set_next_sleep]"
        );
        assert_eq!(format_tools_called(&[]), "[]");
    }

    #[test]
    fn prune_keeps_at_most_five_blocks() {
        let mut content = String::from("# My notes\n\n");
        for n in 0..8 {
            content.push_str(&block(n));
        }
        let pruned = prune_iteration_logs(&content, RETAINED_LOG_BLOCKS);
        let count = pruned.matches(ITER_LOG_PREFIX).count();
        assert_eq!(count, 5);
        // Oldest blocks went first.
        assert!(!pruned.contains("metacog-0"));
        assert!(!pruned.contains("metacog-2"));
        assert!(pruned.contains("metacog-3"));
        assert!(pruned.contains("metacog-7"));
    }

    #[test]
    fn prune_preserves_interleaved_content_byte_identical() {
        let content = format!(
            "# Notes head\n{}middle user text\n{}tail notes\n{}{}{}{}",
            block(0),
            block(1),
            block(2),
            block(3),
            block(4),
            block(5),
        );
        let pruned = prune_iteration_logs(&content, RETAINED_LOG_BLOCKS);
        assert!(pruned.starts_with("# Notes head\n"));
        assert!(pruned.contains("middle user text\n"));
        assert!(pruned.contains("tail notes\n"));
        // Exactly one block (the oldest) was dropped.
        assert_eq!(pruned.matches(ITER_LOG_PREFIX).count(), 5);
        assert!(!pruned.contains("metacog-0"));
    }

    #[test]
    fn prune_is_noop_under_the_cap() {
        let content = format!("notes\n{}{}", block(0), block(1));
        assert_eq!(prune_iteration_logs(&content, 5), content);
    }

    #[test]
    fn prune_leaves_unterminated_blocks_alone() {
        let content = format!("{}<!-- iteration_log:\nbroken", block(0));
        let pruned = prune_iteration_logs(&content, 0);
        // The terminated block is dropped; the unterminated tail survives.
        assert!(pruned.contains("broken"));
        assert!(!pruned.contains("metacog-0"));
    }

    // ── state file read cap ───────────────────────────────────────────────────

    #[test]
    fn read_state_caps_large_files_with_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.md");
        std::fs::write(&path, "x".repeat(STATE_READ_CAP * 2)).unwrap();
        let s = read_state_capped(&path);
        assert!(s.ends_with(TRUNCATION_MARKER));
        assert!(s.len() <= STATE_READ_CAP + TRUNCATION_MARKER.len());
    }

    #[test]
    fn read_state_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_state_capped(&dir.path().join("absent.md")), "");
    }

    #[test]
    fn read_state_small_file_is_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.md");
        std::fs::write(&path, "short notes").unwrap();
        assert_eq!(read_state_capped(&path), "short notes");
    }
}
