// Copyright (c) 2025-2026 Astrid Contributors
//
// SPDX-License-Identifier: MIT
//! Flat-protocol provider: line-delimited JSON chat with native tool calls.
//!
//! Speaks `POST /api/chat` where the response is one JSON document
//! (non-streaming) or a newline-delimited sequence of chunk documents
//! (streaming).  Tokens arrive in intermediate `message.content` chunks;
//! tool calls and token counts arrive in the terminal `done` chunk.

use anyhow::{bail, Context};
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::warn;

use crate::provider::clip_error_body;
use crate::{
    ensure_call_ids, ChatClient, ChatRequest, ChatResponse, Message, StreamCallback, StreamEvent,
    ToolSchema,
};

pub struct OllamaClient {
    base_url: String,
    client: reqwest::Client,
}

impl OllamaClient {
    pub fn new(base_url: Option<String>) -> Self {
        Self {
            base_url: base_url.unwrap_or_else(|| "http://localhost:11434".into()),
            client: reqwest::Client::new(),
        }
    }

    fn chat_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": req.model,
            "messages": req.messages,
            "stream": stream,
        });
        if !req.tools.is_empty() {
            body["tools"] = json!(req.tools.iter().map(wire_tool).collect::<Vec<_>>());
        }
        body
    }

    async fn send(&self, req: &ChatRequest, stream: bool) -> anyhow::Result<reqwest::Response> {
        let mut builder = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&self.chat_body(req, stream));
        // Bind the remaining scope budget onto the request so a deadline
        // aborts the call in flight.
        if let Some(t) = req.timeout {
            builder = builder.timeout(t);
        }
        let resp = builder.send().await.context("chat request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("ollama error {status}: {}", clip_error_body(&body));
        }
        Ok(resp)
    }
}

fn wire_tool(t: &ToolSchema) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": t.name,
            "description": t.description,
            "parameters": t.parameters,
        }
    })
}

#[async_trait::async_trait]
impl ChatClient for OllamaClient {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn chat(&self, req: ChatRequest) -> anyhow::Result<ChatResponse> {
        let resp = self.send(&req, false).await?;
        let mut parsed: ChatResponse = resp.json().await.context("invalid chat response body")?;
        ensure_call_ids(&mut parsed.message.tool_calls);
        Ok(parsed)
    }

    async fn chat_stream(
        &self,
        req: ChatRequest,
        callback: Option<StreamCallback<'_>>,
    ) -> anyhow::Result<ChatResponse> {
        // Without a consumer for intermediate tokens a single exchange is
        // equivalent and cheaper.
        let Some(cb) = callback else {
            return self.chat(req).await;
        };

        let resp = self.send(&req, true).await?;
        let mut byte_stream = resp.bytes_stream();

        // Chunk documents are newline-delimited but a document may split
        // across TCP reads, so carry the remainder forward.
        let mut buf = String::new();
        let mut content = String::new();
        let mut terminal = ChatResponse {
            model: req.model.clone(),
            ..Default::default()
        };

        'recv: while let Some(chunk) = byte_stream.next().await {
            let bytes = match chunk {
                Ok(b) => b,
                Err(e) => {
                    // A read error ends the stream; whatever accumulated is
                    // still returned so the caller can make a decision.
                    warn!("chat stream read error: {e}");
                    break 'recv;
                }
            };
            buf.push_str(&String::from_utf8_lossy(&bytes));
            while let Some(pos) = buf.find('\n') {
                let line = buf[..pos].trim().to_string();
                buf.drain(..=pos);
                if line.is_empty() {
                    continue;
                }
                let parsed: ChatResponse = match serde_json::from_str(&line) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("skipping malformed stream chunk: {e}");
                        continue;
                    }
                };
                if !parsed.message.content.is_empty() {
                    content.push_str(&parsed.message.content);
                    cb(StreamEvent::Token(parsed.message.content.clone()));
                }
                if parsed.done {
                    terminal = parsed;
                    break 'recv;
                }
            }
        }

        let mut calls = terminal.message.tool_calls;
        ensure_call_ids(&mut calls);
        for call in &calls {
            cb(StreamEvent::ToolCallDone(call.clone()));
        }
        cb(StreamEvent::Done);

        Ok(ChatResponse {
            model: terminal.model,
            created_at: terminal.created_at,
            message: Message::assistant_with_calls(content, calls),
            done: true,
            input_tokens: terminal.input_tokens,
            output_tokens: terminal.output_tokens,
            total_duration: terminal.total_duration,
            load_duration: terminal.load_duration,
            eval_duration: terminal.eval_duration,
        })
    }

    async fn ping(&self) -> anyhow::Result<()> {
        let resp = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
            .context("ping request failed")?;
        if !resp.status().is_success() {
            bail!("ollama ping failed: {}", resp.status());
        }
        Ok(())
    }
}
