// Copyright (c) 2025-2026 Astrid Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! The delegate executor: a bounded tool-calling sub-loop.
//!
//! Each run derives a fresh child conversation from a [`Profile`], enforces
//! four budgets simultaneously (iterations, cumulative output tokens, wall
//! clock, per-tool execution time), and always records its completion
//! exactly once — whether it ended in a clean answer, a budget exhaustion,
//! or an error.
//!
//! Exhaustion is not an error.  Every failure class except external
//! cancellation is recovered into either a tool-result message the model
//! can react to, or an exhausted result with a distinguished reason.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail};
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use astrid_model::{apply_salvage, ChatClient, ChatRequest, Message};
use astrid_router::{Priority, Router, RouterRequest};
use astrid_store::{
    extract_tools_called, DelegationRecord, DelegationStore, ExhaustReason, IterationRecord,
    UsageRecorder, UsageRole,
};
use astrid_tools::scope::{KEY_CONVERSATION_ID, KEY_PARENT_TOOL_CALL_ID, KEY_REQUEST_ID};
use astrid_tools::{Scope, ScopeError, ToolError, ToolView};

use crate::interfaces::{expand_labels, Archiver, ArchiveSessionMeta, ConditionsSource, LabelStore};
use crate::profile::{Profile, ProfileSet};
use crate::prompts::{delegate_system_prompt, delegate_user_message};

/// Name of the meta-tool that enters this executor.  It must never appear
/// in a delegate's own registry view — that is what keeps delegates from
/// recursing into themselves.
pub const DELEGATE_TOOL_NAME: &str = "delegate";

const TIME_LIMIT_MESSAGE: &str =
    "Delegate was unable to complete the task within its time limit.";
const BUDGET_MESSAGE: &str = "Delegate was unable to complete the task within its budget.";

/// Grace window for the force-final call when the wall clock has nothing
/// left to lend it.
const FORCE_FINAL_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default)]
pub struct DelegateRequest {
    pub task: String,
    pub profile: String,
    pub guidance: String,
    /// Capability tags; when non-empty these select the registry view
    /// instead of the profile's allow-list.
    pub tags: Vec<String>,
}

impl DelegateRequest {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..Default::default()
        }
    }
}

/// What a delegate run produced.
#[derive(Debug, Clone)]
pub struct DelegateOutcome {
    pub delegate_id: String,
    pub conversation_id: String,
    pub content: String,
    pub model: String,
    pub iterations: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub exhausted: bool,
    pub exhaust_reason: Option<ExhaustReason>,
    pub duration: Duration,
}

pub struct DelegateExecutor {
    client: Arc<dyn ChatClient>,
    tools: ToolView,
    profiles: ProfileSet,
    default_model: String,
    router: Option<Arc<Router>>,
    always_active_tags: Vec<String>,
    store: Option<Arc<DelegationStore>>,
    usage: Option<Arc<UsageRecorder>>,
    archiver: Option<Arc<dyn Archiver>>,
    conditions: Option<Arc<dyn ConditionsSource>>,
    labels: Option<Arc<dyn LabelStore>>,
}

impl DelegateExecutor {
    pub fn new(
        client: Arc<dyn ChatClient>,
        tools: ToolView,
        profiles: ProfileSet,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            tools,
            profiles,
            default_model: default_model.into(),
            router: None,
            always_active_tags: Vec::new(),
            store: None,
            usage: None,
            archiver: None,
            conditions: None,
            labels: None,
        }
    }

    pub fn with_router(mut self, router: Arc<Router>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_always_active_tags(mut self, tags: Vec<String>) -> Self {
        self.always_active_tags = tags;
        self
    }

    pub fn with_store(mut self, store: Arc<DelegationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_usage(mut self, usage: Arc<UsageRecorder>) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_archiver(mut self, archiver: Arc<dyn Archiver>) -> Self {
        self.archiver = Some(archiver);
        self
    }

    pub fn with_conditions(mut self, conditions: Arc<dyn ConditionsSource>) -> Self {
        self.conditions = Some(conditions);
        self
    }

    pub fn with_labels(mut self, labels: Arc<dyn LabelStore>) -> Self {
        self.labels = Some(labels);
        self
    }

    /// Run one delegate to completion.
    ///
    /// Only external cancellation (and the empty-task precondition) surface
    /// as errors; every budget produces an exhausted [`DelegateOutcome`]
    /// instead.  Completion recording runs exactly once per run, whatever
    /// the exit path.
    pub async fn execute(
        &self,
        scope: &Scope,
        req: DelegateRequest,
    ) -> anyhow::Result<DelegateOutcome> {
        if req.task.trim().is_empty() {
            bail!("task is required");
        }

        let profile = self.profiles.resolve(&req.profile);
        let view = self.compose_view(profile, &req.tags);
        let model = self.select_model(profile, &req, &view);

        let delegate_id = Uuid::now_v7().simple().to_string();
        let conversation_id = format!("delegate-{}", &delegate_id[..8]);
        let parent_session_id = scope.session_id();
        let parent_tool_call_id = scope.parent_tool_call_id();

        let run_scope = scope
            .with_value(KEY_CONVERSATION_ID, conversation_id.clone())
            .with_value(KEY_REQUEST_ID, delegate_id.clone())
            .with_timeout(profile.max_duration);

        let started_at = Utc::now();
        let t0 = Instant::now();

        if let Some(archiver) = &self.archiver {
            let meta = ArchiveSessionMeta {
                conversation_id: conversation_id.clone(),
                parent_session_id: parent_session_id.clone(),
                parent_tool_call_id: parent_tool_call_id.clone(),
                task: req.task.clone(),
                profile: profile.name.clone(),
                model: model.clone(),
                started_at,
            };
            if let Err(e) = archiver.begin_session(&meta).await {
                warn!(conversation_id = %meta.conversation_id, "archive begin failed: {e}");
            }
        }

        let task = self.expand(&req.task);
        let guidance = self.expand(&req.guidance);
        let system = delegate_system_prompt(
            &profile.system_prompt,
            self.conditions
                .as_ref()
                .map(|c| c.current_conditions())
                .as_deref(),
        );
        let messages = vec![
            Message::system(system),
            Message::user(delegate_user_message(&task, &guidance)),
        ];

        debug!(
            delegate_id = %delegate_id,
            profile = %profile.name,
            model = %model,
            tools = view.len(),
            "starting delegate run"
        );

        let mut guard = CompletionGuard::new(&delegate_id);
        let run = self.run_loop(&run_scope, &view, profile, &model, messages).await;
        let duration = t0.elapsed();

        let record = DelegationRecord {
            id: delegate_id.clone(),
            conversation_id: conversation_id.clone(),
            parent_session_id,
            parent_tool_call_id,
            task: req.task.clone(),
            guidance: if req.guidance.is_empty() {
                None
            } else {
                Some(req.guidance.clone())
            },
            profile: profile.name.clone(),
            model: model.clone(),
            iterations: run.iterations,
            max_iterations: profile.max_iter,
            input_tokens: run.input_tokens,
            output_tokens: run.output_tokens,
            exhausted: run.exhaust.is_some(),
            exhaust_reason: run.exhaust,
            tools_called: extract_tools_called(&run.messages),
            messages: run.messages.clone(),
            result_content: run.content.clone(),
            started_at,
            completed_at: Utc::now(),
            duration_ms: duration.as_millis() as u64,
            error: run.error.as_ref().map(|e| e.to_string()),
        };

        self.finish(&mut guard, &record, &run.iteration_records).await;

        match run.error {
            Some(e) => Err(e),
            None => Ok(DelegateOutcome {
                delegate_id,
                conversation_id,
                content: run.content,
                model,
                iterations: run.iterations,
                input_tokens: run.input_tokens,
                output_tokens: run.output_tokens,
                exhausted: run.exhaust.is_some(),
                exhaust_reason: run.exhaust,
                duration,
            }),
        }
    }

    /// Registry view for one run.
    ///
    /// Explicit tags win over the profile's allow-list; the tag set used is
    /// the union with `always_active_tags` so infrastructure tools stay
    /// reachable.  Whatever the path, the delegate-entry tool is excluded.
    fn compose_view(&self, profile: &Profile, tags: &[String]) -> ToolView {
        let no_delegate = [DELEGATE_TOOL_NAME.to_string()];
        if !tags.is_empty() {
            let mut union: Vec<String> = tags.to_vec();
            for t in &self.always_active_tags {
                if !union.contains(t) {
                    union.push(t.clone());
                }
            }
            self.tools.with_tags(&union).excluding(&no_delegate)
        } else if let Some(allowed) = profile.allowed_tools.as_ref().filter(|a| !a.is_empty()) {
            self.tools.including(allowed).excluding(&no_delegate)
        } else {
            self.tools.excluding(&no_delegate)
        }
    }

    fn select_model(&self, profile: &Profile, req: &DelegateRequest, view: &ToolView) -> String {
        match &self.router {
            Some(router) => {
                let decision = router.select(&RouterRequest {
                    query: req.task.clone(),
                    needs_tools: !view.is_empty(),
                    tool_count: view.len() as u32,
                    priority: Priority::Background,
                    hints: profile.router_hints.clone(),
                });
                if decision.model.is_empty() {
                    self.default_model.clone()
                } else {
                    decision.model
                }
            }
            None => self.default_model.clone(),
        }
    }

    fn expand(&self, text: &str) -> String {
        match &self.labels {
            Some(store) => expand_labels(text, store.as_ref()),
            None => text.to_string(),
        }
    }

    async fn run_loop(
        &self,
        run_scope: &Scope,
        view: &ToolView,
        profile: &Profile,
        model: &str,
        mut messages: Vec<Message>,
    ) -> LoopRun {
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

        let mut iterations = 0u32;
        let mut input_tokens = 0u64;
        let mut output_tokens = 0u64;
        let mut iteration_records: Vec<IterationRecord> = Vec::new();
        let mut exhaust: Option<ExhaustReason> = None;
        let mut error: Option<anyhow::Error> = None;
        let mut content: Option<String> = None;

        'outer: for i in 0..profile.max_iter {
            // Liveness gate: caller cancellation propagates, an expired wall
            // clock is an exhaustion.  The deadline is also re-checked here
            // manually so scheduling jitter between await points cannot buy
            // the loop a free iteration.
            match run_scope.err() {
                Some(ScopeError::Cancelled) => {
                    error = Some(anyhow!("delegate cancelled"));
                    break;
                }
                Some(ScopeError::DeadlineExceeded) => {
                    exhaust = Some(ExhaustReason::WallClock);
                    break;
                }
                None => {}
            }

            let iter_started_at = Utc::now();
            let iter_t0 = Instant::now();

            let chat_req = ChatRequest {
                model: model.to_string(),
                messages: messages.clone(),
                tools: schemas.clone(),
                timeout: run_scope.remaining(),
            };
            let outcome = tokio::select! {
                biased;
                _ = run_scope.cancelled() => None,
                r = self.client.chat_stream(chat_req, None) => Some(r),
            };
            let mut resp = match outcome {
                None => {
                    match run_scope.err() {
                        Some(ScopeError::Cancelled) => {
                            error = Some(anyhow!("delegate cancelled"))
                        }
                        _ => exhaust = Some(ExhaustReason::WallClock),
                    }
                    break;
                }
                Some(Err(e)) => {
                    if run_scope.is_cancelled() {
                        error = Some(anyhow!("delegate cancelled"));
                    } else if run_scope.is_deadline_exceeded() {
                        exhaust = Some(ExhaustReason::WallClock);
                    } else {
                        error = Some(e.context("model call failed"));
                    }
                    break;
                }
                Some(Ok(resp)) => resp,
            };

            // Some local models emit their calls as text.
            apply_salvage(&mut resp, &view_names);

            input_tokens += resp.input_tokens;
            output_tokens += resp.output_tokens;
            iterations = i + 1;

            let calls = resp.message.tool_calls.clone();
            let text = resp.message.content.clone();
            messages.push(resp.message);

            let mut record = IterationRecord {
                index: i,
                model: model.to_string(),
                input_tokens: resp.input_tokens,
                output_tokens: resp.output_tokens,
                tool_call_ids: calls.iter().map(|c| c.id.clone()).collect(),
                started_at: iter_started_at,
                duration_ms: 0,
                has_tool_calls: !calls.is_empty(),
                break_reason: String::new(),
            };

            if calls.is_empty() {
                // An empty final answer after tool work is a silent failure;
                // an empty answer on the very first turn is just a terse
                // model.
                if text.is_empty() && i > 0 {
                    exhaust = Some(ExhaustReason::NoOutput);
                    record.break_reason = ExhaustReason::NoOutput.as_str().into();
                } else {
                    content = Some(text);
                }
                record.duration_ms = iter_t0.elapsed().as_millis() as u64;
                iteration_records.push(record);
                break;
            }

            if output_tokens >= profile.max_tokens {
                exhaust = Some(ExhaustReason::TokenBudget);
                record.break_reason = ExhaustReason::TokenBudget.as_str().into();
                record.duration_ms = iter_t0.elapsed().as_millis() as u64;
                iteration_records.push(record);
                break;
            }

            // Dispatch every call in the order the model emitted it.  Tool
            // failures are information for the model; only a dead loop scope
            // stops the batch.
            let mut illegal_tool = false;
            for call in &calls {
                let tool_scope = run_scope
                    .with_value(KEY_PARENT_TOOL_CALL_ID, call.id.clone())
                    .with_timeout(profile.tool_timeout);
                let args = Value::Object(call.function.arguments.clone());
                let name = call.function.name.as_str();

                let tool_outcome = tokio::select! {
                    biased;
                    _ = run_scope.cancelled() => None,
                    r = tokio::time::timeout(
                        profile.tool_timeout,
                        view.execute(&tool_scope, name, args),
                    ) => Some(r),
                };

                let result_text = match tool_outcome {
                    None => {
                        match run_scope.err() {
                            Some(ScopeError::Cancelled) => {
                                error = Some(anyhow!("delegate cancelled"))
                            }
                            _ => {
                                exhaust = Some(ExhaustReason::WallClock);
                                record.break_reason = ExhaustReason::WallClock.as_str().into();
                            }
                        }
                        record.duration_ms = iter_t0.elapsed().as_millis() as u64;
                        iteration_records.push(record);
                        break 'outer;
                    }
                    Some(Err(_elapsed)) => {
                        warn!(tool = name, "tool timed out");
                        format!(
                            "tool {name} timed out after {}s",
                            profile.tool_timeout.as_secs()
                        )
                    }
                    Some(Ok(Err(ToolError::Unavailable(missing)))) => {
                        // The model called outside its toolset.  Tell it,
                        // finish the batch, then force-final.
                        illegal_tool = true;
                        format!(
                            "Error: tool '{missing}' is not available in this context"
                        )
                    }
                    Some(Ok(Err(e))) => format!("Error: {e}"),
                    Some(Ok(Ok(output))) => output,
                };
                messages.push(Message::tool_result(&call.id, result_text));
            }

            if illegal_tool {
                exhaust = Some(ExhaustReason::IllegalTool);
                record.break_reason = ExhaustReason::IllegalTool.as_str().into();
                record.duration_ms = iter_t0.elapsed().as_millis() as u64;
                iteration_records.push(record);
                break;
            }

            // Wall-clock re-check after the batch: tools may have eaten the
            // whole budget without any single one timing out.
            if run_scope.is_deadline_exceeded() {
                exhaust = Some(ExhaustReason::WallClock);
                record.break_reason = ExhaustReason::WallClock.as_str().into();
                record.duration_ms = iter_t0.elapsed().as_millis() as u64;
                iteration_records.push(record);
                break;
            }

            record.duration_ms = iter_t0.elapsed().as_millis() as u64;
            iteration_records.push(record);
        }

        if content.is_none() && exhaust.is_none() && error.is_none() {
            // Fell off the end of the iteration budget.
            exhaust = Some(ExhaustReason::MaxIterations);
        }

        let final_content = match (&content, exhaust, &error) {
            (Some(text), _, _) => text.clone(),
            (None, Some(ExhaustReason::WallClock), _) => {
                // The clock is already spent; a summary call would only
                // fail.  Substitute the fixed answer.
                TIME_LIMIT_MESSAGE.to_string()
            }
            (None, Some(_), _) => {
                let (text, ff_in, ff_out) =
                    self.force_final(run_scope, model, &mut messages).await;
                input_tokens += ff_in;
                output_tokens += ff_out;
                text
            }
            (None, None, _) => String::new(),
        };

        LoopRun {
            content: final_content,
            iterations,
            input_tokens,
            output_tokens,
            exhaust,
            messages,
            iteration_records,
            error,
        }
    }

    /// One more tool-free call to coerce a textual summary after an
    /// exhaustion.  Best-effort: any failure substitutes the fixed budget
    /// message.
    async fn force_final(
        &self,
        run_scope: &Scope,
        model: &str,
        messages: &mut Vec<Message>,
    ) -> (String, u64, u64) {
        messages.push(Message::user(
            "You have exhausted your task budget. Do not call any more tools. \
             Reply now with your best final answer from the work so far.",
        ));
        let timeout = run_scope
            .remaining()
            .filter(|d| !d.is_zero())
            .unwrap_or(FORCE_FINAL_GRACE);
        let req = ChatRequest {
            model: model.to_string(),
            messages: messages.clone(),
            tools: Vec::new(),
            timeout: Some(timeout),
        };
        match self.client.chat(req).await {
            Ok(resp) if !resp.message.content.is_empty() => {
                let text = resp.message.content.clone();
                messages.push(resp.message);
                (text, resp.input_tokens, resp.output_tokens)
            }
            Ok(resp) => {
                messages.push(Message::assistant(BUDGET_MESSAGE));
                (BUDGET_MESSAGE.to_string(), resp.input_tokens, resp.output_tokens)
            }
            Err(e) => {
                warn!("force-final call failed: {e}");
                messages.push(Message::assistant(BUDGET_MESSAGE));
                (BUDGET_MESSAGE.to_string(), 0, 0)
            }
        }
    }

    /// Completion recording: store, usage, archive.  Background failures
    /// log a warning and never fail the run.
    async fn finish(
        &self,
        guard: &mut CompletionGuard,
        record: &DelegationRecord,
        iteration_records: &[IterationRecord],
    ) {
        if let Some(store) = &self.store {
            if let Err(e) = store.record(record) {
                warn!(delegate_id = %record.id, "delegation store write failed: {e}");
            }
        }
        if let Some(usage) = &self.usage {
            let provider = self.client.provider_for(&record.model).to_string();
            if let Err(e) = usage.record(
                &record.id,
                &record.conversation_id,
                &record.model,
                &provider,
                record.input_tokens,
                record.output_tokens,
                UsageRole::Delegate,
                Some(record.task.clone()),
            ) {
                warn!(delegate_id = %record.id, "usage write failed: {e}");
            }
        }
        if let Some(archiver) = &self.archiver {
            let cid = &record.conversation_id;
            if let Err(e) = archiver.record_messages(cid, &record.messages).await {
                warn!(conversation_id = %cid, "archive messages failed: {e}");
            }
            if let Err(e) = archiver.record_iterations(cid, iteration_records).await {
                warn!(conversation_id = %cid, "archive iterations failed: {e}");
            }
            let end_reason = match (&record.error, record.exhaust_reason) {
                (Some(_), _) => "error",
                (None, Some(reason)) => reason.as_str(),
                (None, None) => "completed",
            };
            if let Err(e) = archiver.end_session(cid, end_reason).await {
                warn!(conversation_id = %cid, "archive end failed: {e}");
            }
        }
        guard.mark();
    }
}

struct LoopRun {
    content: String,
    iterations: u32,
    input_tokens: u64,
    output_tokens: u64,
    exhaust: Option<ExhaustReason>,
    messages: Vec<Message>,
    iteration_records: Vec<IterationRecord>,
    error: Option<anyhow::Error>,
}

/// Safety net: every run must record its completion exactly once.  If a
/// future refactor adds an early return that skips [`DelegateExecutor::finish`],
/// this drop check makes the omission loud instead of silent.
struct CompletionGuard {
    delegate_id: String,
    recorded: bool,
}

impl CompletionGuard {
    fn new(delegate_id: &str) -> Self {
        Self {
            delegate_id: delegate_id.to_string(),
            recorded: false,
        }
    }

    fn mark(&mut self) {
        self.recorded = true;
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if !self.recorded {
            warn!(
                delegate_id = %self.delegate_id,
                "delegate run finished without completion recording"
            );
        }
    }
}
