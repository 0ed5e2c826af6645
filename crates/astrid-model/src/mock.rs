// Copyright (c) 2025-2026 Astrid Contributors
//
// SPDX-License-Identifier: MIT
use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::bail;
use serde_json::{Map, Value};

use crate::{
    ensure_call_ids, ChatClient, ChatRequest, ChatResponse, Message, StreamCallback, StreamEvent,
    ToolCall,
};

/// A pre-scripted chat client.  Each call pops the next scripted reply from
/// the front of the queue, so tests specify exact response sequences —
/// including tool calls and provider errors — without network access.
pub struct ScriptedClient {
    scripts: Mutex<VecDeque<Result<ChatResponse, String>>>,
    /// Reply repeated forever once the queue is drained.
    fallback: Option<ChatResponse>,
    /// Every request seen, in call order, so tests can inspect what was sent
    /// (e.g. that a forced-final call carried no tools).
    pub requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedClient {
    pub fn new(replies: Vec<ChatResponse>) -> Self {
        Self {
            scripts: Mutex::new(replies.into_iter().map(Ok).collect()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue mixing successful replies and provider errors.
    pub fn with_results(replies: Vec<Result<ChatResponse, String>>) -> Self {
        Self {
            scripts: Mutex::new(replies.into()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Client that answers every call with the same text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            fallback: Some(Self::text(reply, 5, 5)),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Client that answers every call with the same tool-call reply.
    pub fn always_tool_call(
        name: impl Into<String>,
        arguments: Map<String, Value>,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            fallback: Some(Self::tool_call(name, arguments, input_tokens, output_tokens)),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Append a scripted reply; queued replies run before any fallback.
    pub fn push(&self, reply: ChatResponse) {
        self.scripts.lock().unwrap().push_back(Ok(reply));
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Scripted reply: a plain text answer.
    pub fn text(content: impl Into<String>, input_tokens: u64, output_tokens: u64) -> ChatResponse {
        ChatResponse {
            model: "test-model".into(),
            message: Message::assistant(content),
            done: true,
            input_tokens,
            output_tokens,
            ..Default::default()
        }
    }

    /// Scripted reply: one tool call with parsed arguments.
    pub fn tool_call(
        name: impl Into<String>,
        arguments: Map<String, Value>,
        input_tokens: u64,
        output_tokens: u64,
    ) -> ChatResponse {
        let mut calls = vec![ToolCall::new(name, arguments)];
        ensure_call_ids(&mut calls);
        ChatResponse {
            model: "test-model".into(),
            message: Message::assistant_with_calls("", calls),
            done: true,
            input_tokens,
            output_tokens,
            ..Default::default()
        }
    }

    fn next(&self, req: ChatRequest) -> anyhow::Result<ChatResponse> {
        self.requests.lock().unwrap().push(req);
        let popped = self.scripts.lock().unwrap().pop_front();
        match popped {
            Some(Ok(resp)) => Ok(resp),
            Some(Err(msg)) => bail!("{msg}"),
            None => match &self.fallback {
                Some(resp) => Ok(resp.clone()),
                None => bail!("scripted client: reply queue exhausted"),
            },
        }
    }
}

#[async_trait::async_trait]
impl ChatClient for ScriptedClient {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat(&self, req: ChatRequest) -> anyhow::Result<ChatResponse> {
        self.next(req)
    }

    async fn chat_stream(
        &self,
        req: ChatRequest,
        callback: Option<StreamCallback<'_>>,
    ) -> anyhow::Result<ChatResponse> {
        let resp = self.next(req)?;
        if let Some(cb) = callback {
            if !resp.message.content.is_empty() {
                cb(StreamEvent::Token(resp.message.content.clone()));
            }
            for call in &resp.message.tool_calls {
                cb(StreamEvent::ToolCallDone(call.clone()));
            }
            cb(StreamEvent::Done);
        }
        Ok(resp)
    }

    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A client whose calls never complete.  Used to exercise wall-clock
/// deadlines: the caller's scope must abort the in-flight call.
pub struct HangingClient;

#[async_trait::async_trait]
impl ChatClient for HangingClient {
    fn name(&self) -> &str {
        "hanging"
    }

    async fn chat(&self, _req: ChatRequest) -> anyhow::Result<ChatResponse> {
        futures::future::pending().await
    }

    async fn chat_stream(
        &self,
        _req: ChatRequest,
        _callback: Option<StreamCallback<'_>>,
    ) -> anyhow::Result<ChatResponse> {
        futures::future::pending().await
    }

    async fn ping(&self) -> anyhow::Result<()> {
        futures::future::pending().await
    }
}
