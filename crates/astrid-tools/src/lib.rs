// Copyright (c) 2025-2026 Astrid Contributors
//
// SPDX-License-Identifier: MIT
//! Named-tool storage with filtered views, plus the cancellation scope the
//! whole runtime shares.

pub mod registry;
pub mod scope;
pub mod tool;

pub use registry::{ToolError, ToolRegistry, ToolSchema, ToolView};
pub use scope::{Scope, ScopeError};
pub use tool::{valid_tool_name, Tool};
