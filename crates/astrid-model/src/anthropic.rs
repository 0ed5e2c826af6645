// Copyright (c) 2025-2026 Astrid Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Block-structured provider: typed content blocks over server-sent events.
//!
//! Speaks `POST /v1/messages` where message content is a list of typed
//! blocks (`text`, `tool_use`, `tool_result`).  The conversion layer maps
//! the flat [`Message`] history onto that shape and back; the streaming
//! layer drives the event state machine
//! `message_start → content_block_* → message_delta → message_stop`.

use anyhow::{bail, Context};
use futures::StreamExt;
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::provider::clip_error_body;
use crate::{
    ensure_call_ids, ChatClient, ChatRequest, ChatResponse, FunctionCall, Message, Role,
    StreamCallback, StreamEvent, ToolCall, ToolSchema,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const PROTOCOL_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    api_key: Option<String>,
    base_url: String,
    max_tokens: u32,
    client: reqwest::Client,
}

impl AnthropicClient {
    pub fn new(api_key: Option<String>, base_url: Option<String>, max_tokens: Option<u32>) -> Self {
        Self {
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.into()),
            max_tokens: max_tokens.unwrap_or(4096),
            client: reqwest::Client::new(),
        }
    }

    fn body(&self, req: &ChatRequest, stream: bool) -> Value {
        let (system, messages) = build_block_messages(&req.messages);
        let mut body = json!({
            "model": req.model,
            "messages": messages,
            "max_tokens": self.max_tokens,
            "stream": stream,
        });
        if !system.is_empty() {
            body["system"] = json!(system);
        }
        if !req.tools.is_empty() {
            body["tools"] = json!(req.tools.iter().map(wire_tool).collect::<Vec<_>>());
        }
        body
    }

    async fn send(&self, req: &ChatRequest, stream: bool) -> anyhow::Result<reqwest::Response> {
        let key = self.api_key.as_deref().context("API key not configured")?;
        let mut builder = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", key)
            .header("anthropic-version", PROTOCOL_VERSION)
            .json(&self.body(req, stream));
        if let Some(t) = req.timeout {
            builder = builder.timeout(t);
        }
        let resp = builder.send().await.context("messages request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("anthropic error {status}: {}", clip_error_body(&body));
        }
        Ok(resp)
    }
}

fn wire_tool(t: &ToolSchema) -> Value {
    json!({
        "name": t.name,
        "description": t.description,
        "input_schema": t.parameters,
    })
}

#[async_trait::async_trait]
impl ChatClient for AnthropicClient {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn chat(&self, req: ChatRequest) -> anyhow::Result<ChatResponse> {
        let resp = self.send(&req, false).await?;
        let v: Value = resp.json().await.context("invalid messages response body")?;
        Ok(parse_block_response(&req.model, &v))
    }

    async fn chat_stream(
        &self,
        req: ChatRequest,
        callback: Option<StreamCallback<'_>>,
    ) -> anyhow::Result<ChatResponse> {
        let Some(cb) = callback else {
            return self.chat(req).await;
        };

        let resp = self.send(&req, true).await?;
        let mut byte_stream = resp.bytes_stream();

        // SSE lines can split across TCP chunks; carry the remainder forward
        // and parse only complete lines.
        let mut buf = String::new();
        let mut machine = StreamMachine::default();

        'recv: while let Some(chunk) = byte_stream.next().await {
            let bytes = match chunk {
                Ok(b) => b,
                Err(e) => {
                    warn!("messages stream read error: {e}");
                    break 'recv;
                }
            };
            buf.push_str(&String::from_utf8_lossy(&bytes));
            while let Some(pos) = buf.find('\n') {
                let line = buf[..pos].trim_end_matches('\r').to_string();
                buf.drain(..=pos);
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if let Ok(v) = serde_json::from_str::<Value>(data.trim()) {
                    if machine.feed(&v, cb) {
                        break 'recv;
                    }
                }
            }
        }

        Ok(machine.finish(&req.model, cb))
    }

    async fn ping(&self) -> anyhow::Result<()> {
        // There is no cheap unauthenticated probe; a HEAD-equivalent GET on
        // the API root confirms reachability of the endpoint host.
        let resp = self
            .client
            .get(self.base_url.clone())
            .send()
            .await
            .context("ping request failed")?;
        // Any HTTP answer proves the host is reachable.
        let _ = resp.status();
        Ok(())
    }
}

// ─── Message conversion ───────────────────────────────────────────────────────

/// Convert the flat message history into the block wire shape.
///
/// Returns `(system_text, messages)`.  System messages must not appear in
/// the message list; they are collected and joined with blank-line
/// separation into the single top-level `system` field.
pub fn build_block_messages(messages: &[Message]) -> (String, Vec<Value>) {
    let mut system_parts: Vec<&str> = Vec::new();
    let mut out: Vec<Value> = Vec::new();

    for m in messages {
        match m.role {
            Role::System => {
                system_parts.push(&m.content);
            }
            Role::Assistant if m.has_tool_calls() => {
                // Optional text block first, then one tool_use per call,
                // preserving the order the model emitted them.
                let mut blocks: Vec<Value> = Vec::new();
                if !m.content.is_empty() {
                    blocks.push(json!({ "type": "text", "text": m.content }));
                }
                for (i, call) in m.tool_calls.iter().enumerate() {
                    let id = if call.id.is_empty() {
                        // A missing id would be rejected by the API; the
                        // synthesized form is deterministic so the paired
                        // tool_result can reference it.
                        let synthesized = format!("tool_{}_{}", call.function.name, i);
                        warn!(
                            tool_name = %call.function.name,
                            "tool call without id in history; synthesizing {synthesized}"
                        );
                        synthesized
                    } else {
                        call.id.clone()
                    };
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": id,
                        "name": call.function.name,
                        "input": Value::Object(call.function.arguments.clone()),
                    }));
                }
                out.push(json!({ "role": "assistant", "content": blocks }));
            }
            Role::Tool => {
                // Tool results ride in a synthetic user message.
                out.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": m.tool_call_id.clone().unwrap_or_default(),
                        "content": m.content,
                    }]
                }));
            }
            Role::User | Role::Assistant => {
                let role = if m.role == Role::User { "user" } else { "assistant" };
                out.push(json!({ "role": role, "content": m.content }));
            }
        }
    }

    (system_parts.join("\n\n"), out)
}

/// Convert a block wire message list (plus top-level system text) back into
/// the flat history shape.  Inverse of [`build_block_messages`] modulo the
/// system field placement.
pub fn parse_block_messages(system: &str, messages: &[Value]) -> Vec<Message> {
    let mut out = Vec::new();
    if !system.is_empty() {
        out.push(Message::system(system));
    }
    for m in messages {
        let role = m["role"].as_str().unwrap_or("user");
        match &m["content"] {
            Value::String(text) => out.push(match role {
                "assistant" => Message::assistant(text.clone()),
                _ => Message::user(text.clone()),
            }),
            Value::Array(blocks) => {
                let mut text = String::new();
                let mut calls: Vec<ToolCall> = Vec::new();
                let mut results: Vec<Message> = Vec::new();
                for b in blocks {
                    match b["type"].as_str().unwrap_or("") {
                        "text" => text.push_str(b["text"].as_str().unwrap_or("")),
                        "tool_use" => calls.push(ToolCall {
                            id: b["id"].as_str().unwrap_or("").to_string(),
                            function: FunctionCall {
                                name: b["name"].as_str().unwrap_or("").to_string(),
                                arguments: b["input"]
                                    .as_object()
                                    .cloned()
                                    .unwrap_or_default(),
                            },
                        }),
                        "tool_result" => results.push(Message::tool_result(
                            b["tool_use_id"].as_str().unwrap_or(""),
                            b["content"].as_str().unwrap_or("").to_string(),
                        )),
                        _ => {}
                    }
                }
                if !calls.is_empty() {
                    out.push(Message::assistant_with_calls(text, calls));
                } else if !results.is_empty() {
                    out.extend(results);
                } else if role == "assistant" {
                    out.push(Message::assistant(text));
                } else {
                    out.push(Message::user(text));
                }
            }
            _ => {}
        }
    }
    out
}

/// Parse a complete (non-streaming) response document.
pub(crate) fn parse_block_response(model: &str, v: &Value) -> ChatResponse {
    let mut text = String::new();
    let mut calls: Vec<ToolCall> = Vec::new();
    if let Some(blocks) = v["content"].as_array() {
        for b in blocks {
            match b["type"].as_str().unwrap_or("") {
                "text" => text.push_str(b["text"].as_str().unwrap_or("")),
                "tool_use" => calls.push(ToolCall {
                    id: b["id"].as_str().unwrap_or("").to_string(),
                    function: FunctionCall {
                        name: b["name"].as_str().unwrap_or("").to_string(),
                        arguments: b["input"].as_object().cloned().unwrap_or_default(),
                    },
                }),
                _ => {}
            }
        }
    }
    ensure_call_ids(&mut calls);
    ChatResponse {
        model: v["model"].as_str().unwrap_or(model).to_string(),
        created_at: None,
        message: Message::assistant_with_calls(text, calls),
        done: true,
        input_tokens: v["usage"]["input_tokens"].as_u64().unwrap_or(0),
        output_tokens: v["usage"]["output_tokens"].as_u64().unwrap_or(0),
        total_duration: 0,
        load_duration: 0,
        eval_duration: 0,
    }
}

// ─── Streaming state machine ──────────────────────────────────────────────────

/// One in-flight content block, keyed by stream index.
enum BlockState {
    Text,
    ToolUse {
        id: String,
        name: String,
        /// Accumulated partial JSON from `input_json_delta` events.
        json_buf: String,
    },
}

#[derive(Default)]
struct StreamMachine {
    text: String,
    calls: Vec<ToolCall>,
    open: std::collections::HashMap<u64, BlockState>,
    input_tokens: u64,
    output_tokens: u64,
    stopped: bool,
}

impl StreamMachine {
    /// Apply one SSE event.  Returns `true` on `message_stop`.
    fn feed(&mut self, v: &Value, cb: StreamCallback<'_>) -> bool {
        match v["type"].as_str().unwrap_or("") {
            "message_start" => {
                if let Some(n) = v["message"]["usage"]["input_tokens"].as_u64() {
                    self.input_tokens = n;
                }
            }
            "content_block_start" => {
                let index = v["index"].as_u64().unwrap_or(0);
                let block = &v["content_block"];
                if block["type"].as_str() == Some("tool_use") {
                    let name = block["name"].as_str().unwrap_or("").to_string();
                    cb(StreamEvent::ToolCallStart { name: name.clone() });
                    self.open.insert(
                        index,
                        BlockState::ToolUse {
                            id: block["id"].as_str().unwrap_or("").to_string(),
                            name,
                            json_buf: String::new(),
                        },
                    );
                } else {
                    self.open.insert(index, BlockState::Text);
                }
            }
            "content_block_delta" => {
                let index = v["index"].as_u64().unwrap_or(0);
                let delta = &v["delta"];
                match delta["type"].as_str().unwrap_or("") {
                    "text_delta" => {
                        let t = delta["text"].as_str().unwrap_or("");
                        if !t.is_empty() {
                            self.text.push_str(t);
                            cb(StreamEvent::Token(t.to_string()));
                        }
                    }
                    "input_json_delta" => {
                        if let Some(BlockState::ToolUse { json_buf, .. }) =
                            self.open.get_mut(&index)
                        {
                            json_buf.push_str(delta["partial_json"].as_str().unwrap_or(""));
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                let index = v["index"].as_u64().unwrap_or(0);
                if let Some(BlockState::ToolUse { id, name, json_buf }) = self.open.remove(&index)
                {
                    let call = ToolCall {
                        id,
                        function: FunctionCall {
                            name,
                            arguments: parse_accumulated_input(&json_buf),
                        },
                    };
                    cb(StreamEvent::ToolCallDone(call.clone()));
                    self.calls.push(call);
                }
            }
            "message_delta" => {
                if let Some(n) = v["usage"]["output_tokens"].as_u64() {
                    self.output_tokens = n;
                }
            }
            "message_stop" => {
                self.stopped = true;
                return true;
            }
            _ => {}
        }
        false
    }

    fn finish(mut self, model: &str, cb: StreamCallback<'_>) -> ChatResponse {
        // Flush blocks the stream ended without closing (read error paths).
        let mut dangling: Vec<(u64, BlockState)> = self.open.drain().collect();
        dangling.sort_by_key(|(idx, _)| *idx);
        for (_, state) in dangling {
            if let BlockState::ToolUse { id, name, json_buf } = state {
                self.calls.push(ToolCall {
                    id,
                    function: FunctionCall {
                        name,
                        arguments: parse_accumulated_input(&json_buf),
                    },
                });
            }
        }
        ensure_call_ids(&mut self.calls);
        cb(StreamEvent::Done);
        ChatResponse {
            model: model.to_string(),
            created_at: None,
            message: Message::assistant_with_calls(self.text, self.calls),
            done: self.stopped,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            total_duration: 0,
            load_duration: 0,
            eval_duration: 0,
        }
    }
}

/// Parse the JSON accumulated from `input_json_delta` events.  A malformed
/// buffer is preserved under `_raw` rather than failing the request — the
/// tool handler (or the model, via the error result) decides what to do
/// with it.
fn parse_accumulated_input(buf: &str) -> Map<String, Value> {
    if buf.is_empty() {
        return Map::new();
    }
    match serde_json::from_str::<Value>(buf) {
        Ok(Value::Object(map)) => map,
        _ => {
            warn!("malformed tool input buffer; wrapping as _raw");
            let mut map = Map::new();
            map.insert("_raw".into(), Value::String(buf.to_string()));
            map
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> impl Fn(StreamEvent) + Send + Sync {
        |_| {}
    }

    // ── Message conversion ────────────────────────────────────────────────────

    #[test]
    fn system_messages_join_with_blank_line() {
        let (system, msgs) = build_block_messages(&[
            Message::system("first"),
            Message::system("second"),
            Message::user("hi"),
        ]);
        assert_eq!(system, "first\n\nsecond");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0]["role"], "user");
    }

    #[test]
    fn assistant_tool_calls_become_ordered_tool_use_blocks() {
        let mut args = Map::new();
        args.insert("entity_id".into(), json!("light.office"));
        let m = Message::assistant_with_calls(
            "checking",
            vec![
                ToolCall {
                    id: "call-a".into(),
                    function: FunctionCall {
                        name: "get_state".into(),
                        arguments: args,
                    },
                },
                ToolCall {
                    id: "call-b".into(),
                    function: FunctionCall {
                        name: "list_entities".into(),
                        arguments: Map::new(),
                    },
                },
            ],
        );
        let (_, msgs) = build_block_messages(&[m]);
        let content = msgs[0]["content"].as_array().unwrap();
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[1]["type"], "tool_use");
        assert_eq!(content[1]["id"], "call-a");
        assert_eq!(content[1]["input"]["entity_id"], "light.office");
        assert_eq!(content[2]["id"], "call-b");
    }

    #[test]
    fn missing_call_id_is_synthesized_in_blocks() {
        let m = Message::assistant_with_calls("", vec![ToolCall::new("get_state", Map::new())]);
        let (_, msgs) = build_block_messages(&[m]);
        assert_eq!(msgs[0]["content"][0]["id"], "tool_get_state_0");
    }

    #[test]
    fn tool_message_becomes_synthetic_user_tool_result() {
        let (_, msgs) = build_block_messages(&[Message::tool_result("call-a", "State: on")]);
        assert_eq!(msgs[0]["role"], "user");
        let block = &msgs[0]["content"][0];
        assert_eq!(block["type"], "tool_result");
        assert_eq!(block["tool_use_id"], "call-a");
        assert_eq!(block["content"], "State: on");
    }

    #[test]
    fn conversion_round_trips_full_exchange() {
        let mut args = Map::new();
        args.insert("entity_id".into(), json!("sun.sun"));
        let original = vec![
            Message::system("be helpful"),
            Message::user("is the sun up?"),
            Message::assistant_with_calls(
                "",
                vec![ToolCall {
                    id: "call-1".into(),
                    function: FunctionCall {
                        name: "get_state".into(),
                        arguments: args,
                    },
                }],
            ),
            Message::tool_result("call-1", "above_horizon"),
        ];
        let (system, wire) = build_block_messages(&original);
        let back = parse_block_messages(&system, &wire);
        assert_eq!(back, original);
    }

    // ── Non-streaming response parse ──────────────────────────────────────────

    #[test]
    fn response_with_text_and_tool_use_parses() {
        let v = json!({
            "id": "msg_01",
            "role": "assistant",
            "model": "claude-sonnet-4-5",
            "content": [
                { "type": "text", "text": "Let me check." },
                { "type": "tool_use", "id": "toolu_01", "name": "get_state",
                  "input": { "entity_id": "light.office" } }
            ],
            "stop_reason": "tool_use",
            "usage": { "input_tokens": 120, "output_tokens": 40 }
        });
        let resp = parse_block_response("claude-sonnet-4-5", &v);
        assert!(resp.done);
        assert_eq!(resp.message.content, "Let me check.");
        assert_eq!(resp.message.tool_calls[0].id, "toolu_01");
        assert_eq!(resp.input_tokens, 120);
        assert_eq!(resp.output_tokens, 40);
    }

    // ── Streaming state machine ───────────────────────────────────────────────

    fn feed_all(machine: &mut StreamMachine, events: &[Value]) -> bool {
        let cb = sink();
        let mut stopped = false;
        for ev in events {
            stopped = machine.feed(ev, &cb);
        }
        stopped
    }

    #[test]
    fn stream_accumulates_text_and_usage() {
        let mut m = StreamMachine::default();
        let stopped = feed_all(
            &mut m,
            &[
                json!({ "type": "message_start",
                        "message": { "usage": { "input_tokens": 42 } } }),
                json!({ "type": "content_block_start", "index": 0,
                        "content_block": { "type": "text" } }),
                json!({ "type": "content_block_delta", "index": 0,
                        "delta": { "type": "text_delta", "text": "hello " } }),
                json!({ "type": "content_block_delta", "index": 0,
                        "delta": { "type": "text_delta", "text": "world" } }),
                json!({ "type": "content_block_stop", "index": 0 }),
                json!({ "type": "message_delta", "usage": { "output_tokens": 7 } }),
                json!({ "type": "message_stop" }),
            ],
        );
        assert!(stopped);
        let resp = m.finish("m", &sink());
        assert_eq!(resp.message.content, "hello world");
        assert_eq!(resp.input_tokens, 42);
        assert_eq!(resp.output_tokens, 7);
        assert!(resp.done);
    }

    #[test]
    fn stream_assembles_tool_call_from_json_deltas() {
        let mut m = StreamMachine::default();
        feed_all(
            &mut m,
            &[
                json!({ "type": "content_block_start", "index": 0,
                        "content_block": { "type": "tool_use", "id": "toolu_9", "name": "get_state" } }),
                json!({ "type": "content_block_delta", "index": 0,
                        "delta": { "type": "input_json_delta", "partial_json": "{\"entity" } }),
                json!({ "type": "content_block_delta", "index": 0,
                        "delta": { "type": "input_json_delta", "partial_json": "_id\":\"sun.sun\"}" } }),
                json!({ "type": "content_block_stop", "index": 0 }),
                json!({ "type": "message_stop" }),
            ],
        );
        let resp = m.finish("m", &sink());
        let call = &resp.message.tool_calls[0];
        assert_eq!(call.id, "toolu_9");
        assert_eq!(call.function.arguments["entity_id"], "sun.sun");
    }

    #[test]
    fn malformed_input_buffer_wraps_as_raw() {
        let mut m = StreamMachine::default();
        feed_all(
            &mut m,
            &[
                json!({ "type": "content_block_start", "index": 0,
                        "content_block": { "type": "tool_use", "id": "toolu_1", "name": "get_state" } }),
                json!({ "type": "content_block_delta", "index": 0,
                        "delta": { "type": "input_json_delta", "partial_json": "{\"truncat" } }),
                json!({ "type": "content_block_stop", "index": 0 }),
                json!({ "type": "message_stop" }),
            ],
        );
        let resp = m.finish("m", &sink());
        assert_eq!(
            resp.message.tool_calls[0].function.arguments["_raw"],
            "{\"truncat"
        );
    }

    #[test]
    fn empty_input_buffer_yields_empty_arguments() {
        assert!(parse_accumulated_input("").is_empty());
    }

    #[test]
    fn stream_read_error_returns_accumulated_state() {
        // No message_stop: simulate the stream dying mid-response.
        let mut m = StreamMachine::default();
        feed_all(
            &mut m,
            &[
                json!({ "type": "message_start",
                        "message": { "usage": { "input_tokens": 10 } } }),
                json!({ "type": "content_block_start", "index": 0,
                        "content_block": { "type": "text" } }),
                json!({ "type": "content_block_delta", "index": 0,
                        "delta": { "type": "text_delta", "text": "partial answ" } }),
            ],
        );
        let resp = m.finish("m", &sink());
        assert_eq!(resp.message.content, "partial answ");
        assert!(!resp.done, "interrupted stream must not claim completion");
    }

    #[test]
    fn stream_callback_receives_tagged_events() {
        use std::sync::Mutex;
        let seen: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());
        let cb = |ev: StreamEvent| {
            let tag = match ev {
                StreamEvent::Token(_) => "token",
                StreamEvent::ToolCallStart { .. } => "start",
                StreamEvent::ToolCallDone(_) => "done",
                StreamEvent::Done => "end",
            };
            seen.lock().unwrap().push(tag);
        };
        let mut m = StreamMachine::default();
        m.feed(
            &json!({ "type": "content_block_start", "index": 0,
                     "content_block": { "type": "tool_use", "id": "t1", "name": "get_state" } }),
            &cb,
        );
        m.feed(&json!({ "type": "content_block_stop", "index": 0 }), &cb);
        m.feed(&json!({ "type": "message_stop" }), &cb);
        m.finish("m", &cb);
        assert_eq!(*seen.lock().unwrap(), vec!["start", "done", "end"]);
    }

    #[test]
    fn wire_tool_uses_input_schema_field() {
        let t = ToolSchema {
            name: "get_state".into(),
            description: "read entity state".into(),
            parameters: json!({ "type": "object" }),
        };
        let v = wire_tool(&t);
        assert_eq!(v["input_schema"], json!({ "type": "object" }));
        assert!(v.get("parameters").is_none());
    }
}
