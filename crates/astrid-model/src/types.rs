use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ─── Message types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single message in the conversation history.
///
/// `tool_calls` is populated only on assistant messages; `tool_call_id` only
/// on tool messages, where it must reference a prior assistant's
/// [`ToolCall::id`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: text.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// An assistant message that requests tool invocations.
    pub fn assistant_with_calls(text: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
            tool_calls: calls,
            tool_call_id: None,
        }
    }

    /// A tool-result message referencing the call it answers.
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    /// Provider-assigned identifier.  Required for block-structured
    /// `tool_use`/`tool_result` correlation; synthesized when absent
    /// (see [`ensure_call_ids`]).
    #[serde(default)]
    pub id: String,
    pub function: FunctionCall,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            id: String::new(),
            function: FunctionCall {
                name: name.into(),
                arguments,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    /// Parsed argument object.  Dynamic by design: tool schemas are
    /// JSON-schema shaped and arguments arrive as free-form JSON objects.
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

/// Fill in synthesized ids (`tool_<name>_<index>`) for calls the provider
/// left unidentified.  Existing ids are preserved verbatim.
pub fn ensure_call_ids(calls: &mut [ToolCall]) {
    for (i, call) in calls.iter_mut().enumerate() {
        if call.id.is_empty() {
            call.id = format!("tool_{}_{}", call.function.name, i);
        }
    }
}

// ─── Chat exchange types ──────────────────────────────────────────────────────

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: Value,
}

/// Request sent to a chat client.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    /// Remaining wall-clock budget of the calling scope.  Bound onto the
    /// HTTP request so a deadline aborts the call in flight rather than at
    /// the next iteration boundary.
    pub timeout: Option<Duration>,
}

/// One completed (or terminal streamed) model response.
///
/// Duration fields are in monotonic nanoseconds; zero is valid and simply
/// means the provider did not report the figure (intermediate stream chunks
/// routinely carry zeros).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatResponse {
    #[serde(default)]
    pub model: String,
    /// Absent or empty on intermediate chunks; never a parse error.
    #[serde(default, deserialize_with = "de_lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default = "empty_assistant")]
    pub message: Message,
    #[serde(default)]
    pub done: bool,
    #[serde(default, rename = "prompt_eval_count")]
    pub input_tokens: u64,
    #[serde(default, rename = "eval_count")]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_duration: u64,
    #[serde(default)]
    pub load_duration: u64,
    #[serde(default)]
    pub eval_duration: u64,
}

fn empty_assistant() -> Message {
    Message::assistant("")
}

impl Default for ChatResponse {
    fn default() -> Self {
        Self {
            model: String::new(),
            created_at: None,
            message: empty_assistant(),
            done: false,
            input_tokens: 0,
            output_tokens: 0,
            total_duration: 0,
            load_duration: 0,
            eval_duration: 0,
        }
    }
}

/// Accept RFC-3339 strings, the empty string, or null — the flat provider
/// omits `created_at` on intermediate chunks and some builds send `""`.
fn de_lenient_timestamp<'de, D>(de: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(de)?;
    Ok(raw
        .filter(|s| !s.is_empty())
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc)))
}

// ─── Streaming callback ───────────────────────────────────────────────────────

/// Tagged event stream delivered to an optional [`ChatClient::chat_stream`]
/// callback.  When the caller passes no callback the provider may skip
/// streaming entirely.
///
/// [`ChatClient::chat_stream`]: crate::ChatClient::chat_stream
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A text delta from the model.
    Token(String),
    /// The model opened a tool-use block; arguments are still streaming.
    ToolCallStart { name: String },
    /// A tool call finished accumulating and parsed.
    ToolCallDone(ToolCall),
    /// The stream completed.
    Done,
}

pub type StreamCallback<'a> = &'a (dyn Fn(StreamEvent) + Send + Sync);

// ─── Unit tests ──────────────────────────────────────────────────────────────
