// Copyright (c) 2025-2026 Astrid Contributors
//
// SPDX-License-Identifier: MIT
//! Model-agnostic chat client layer.
//!
//! Two concrete wire protocols are supported: the flat line-delimited JSON
//! protocol with native tool calls ([`OllamaClient`]) and the
//! block-structured SSE protocol ([`AnthropicClient`]).  The
//! [`MultiClient`] routes by model name across both; [`salvage`] recovers
//! tool calls that models emit as free text.

pub mod salvage;

mod anthropic;
mod mock;
mod multiplex;
mod ollama;
mod provider;
mod types;

pub use anthropic::{build_block_messages, parse_block_messages, AnthropicClient};
pub use mock::{HangingClient, ScriptedClient};
pub use multiplex::MultiClient;
pub use ollama::OllamaClient;
pub use provider::ChatClient;
pub use salvage::{apply_salvage, salvage_tool_calls};
pub use types::*;
