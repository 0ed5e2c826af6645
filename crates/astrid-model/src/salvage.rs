// Copyright (c) 2025-2026 Astrid Contributors
//
// SPDX-License-Identifier: MIT
//! Recovery of tool calls emitted as free text.
//!
//! Models served without a structured tool-call protocol (and some
//! fine-tunes even with one) occasionally write their function calls into
//! the text stream.  When a response carries no structured calls but
//! non-empty content, this module tries a fixed sequence of envelope
//! shapes and, on success, replaces the content with the recovered calls.

use serde_json::{Map, Value};
use tracing::debug;

use crate::{ensure_call_ids, ChatResponse, FunctionCall, ToolCall};

/// Attempt to recover tool calls from free text.
///
/// Envelope shapes are tried in order:
/// 1. `<tool_call>…</tool_call>` wrappers (stripped, then re-tried)
/// 2. JSON array of `{name, arguments}` objects
/// 3. single JSON object `{name, arguments}`
/// 4. concatenated `}{` JSON object run
/// 5. `toolname {json}` prefix, where `toolname` is on the whitelist
///
/// When `valid_tools` is non-empty every recovered name must be on it,
/// otherwise the whole salvage is rejected — JSON-shaped prose must not
/// turn into phantom tool calls.
pub fn salvage_tool_calls(content: &str, valid_tools: &[String]) -> Option<Vec<ToolCall>> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return None;
    }

    // 1. Tagged wrapper: strip and retry the remaining shapes on the inner text.
    if let Some(inner) = strip_tagged_wrapper(trimmed) {
        return salvage_tool_calls(inner, valid_tools);
    }

    // 2. JSON array.
    if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(trimmed) {
        let calls: Option<Vec<ToolCall>> = items.iter().map(call_from_value).collect();
        return validate(calls?, valid_tools);
    }

    // 3. Single JSON object.
    if let Ok(v @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return validate(vec![call_from_value(&v)?], valid_tools);
    }

    // 4. Concatenated `}{` run: a stream deserializer consumes back-to-back
    //    JSON documents.
    if trimmed.starts_with('{') && trimmed.contains("}{") {
        let mut calls = Vec::new();
        for item in serde_json::Deserializer::from_str(trimmed).into_iter::<Value>() {
            match item {
                Ok(v) => calls.push(call_from_value(&v)?),
                Err(_) => return None,
            }
        }
        if !calls.is_empty() {
            return validate(calls, valid_tools);
        }
    }

    // 5. `toolname {json}` prefix — only whitelisted names qualify, which
    //    keeps ordinary prose followed by a brace from matching.
    if let Some((name, rest)) = trimmed.split_once(' ') {
        if is_tool_name(name) && valid_tools.iter().any(|t| t == name) {
            let rest = rest.trim_start();
            if rest.starts_with('{') {
                if let Ok(Value::Object(args)) = serde_json::from_str::<Value>(rest) {
                    return Some(vec![ToolCall {
                        id: String::new(),
                        function: FunctionCall {
                            name: name.to_string(),
                            arguments: args,
                        },
                    }]);
                }
            }
        }
    }

    None
}

/// Apply salvage to a response in place.  No-op (and `false`) when the
/// response already carries structured tool calls or has empty content —
/// salvage is idempotent on structured responses.
pub fn apply_salvage(resp: &mut ChatResponse, valid_tools: &[String]) -> bool {
    if resp.message.has_tool_calls() || resp.message.content.is_empty() {
        return false;
    }
    match salvage_tool_calls(&resp.message.content, valid_tools) {
        Some(mut calls) => {
            debug!(count = calls.len(), "salvaged tool calls from text content");
            ensure_call_ids(&mut calls);
            resp.message.content.clear();
            resp.message.tool_calls = calls;
            true
        }
        None => false,
    }
}

fn strip_tagged_wrapper(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("<tool_call>")?;
    let inner = inner.rsplit_once("</tool_call>").map(|(a, _)| a).unwrap_or(inner);
    Some(inner.trim())
}

fn call_from_value(v: &Value) -> Option<ToolCall> {
    let obj = v.as_object()?;
    let name = obj.get("name")?.as_str()?;
    if !is_tool_name(name) {
        return None;
    }
    let arguments: Map<String, Value> = match obj.get("arguments") {
        Some(Value::Object(m)) => m.clone(),
        Some(Value::Null) | None => Map::new(),
        Some(_) => return None,
    };
    Some(ToolCall {
        id: String::new(),
        function: FunctionCall {
            name: name.to_string(),
            arguments,
        },
    })
}

/// Registry tool names match `[a-z_][a-z0-9_]*`; anything else in a `name`
/// field is JSON-shaped prose, not a call.
fn is_tool_name(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn validate(calls: Vec<ToolCall>, valid_tools: &[String]) -> Option<Vec<ToolCall>> {
    if calls.is_empty() {
        return None;
    }
    if !valid_tools.is_empty()
        && calls
            .iter()
            .any(|c| !valid_tools.iter().any(|t| *t == c.function.name))
    {
        return None;
    }
    Some(calls)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
