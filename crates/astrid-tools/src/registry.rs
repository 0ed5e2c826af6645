// Copyright (c) 2025-2026 Astrid Contributors
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::scope::Scope;
use crate::tool::{valid_tool_name, Tool};

/// A tool schema exported for the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// Lookup failed.  The delegate loop catches this variant to trigger
    /// illegal-tool exhaustion.
    #[error("tool not available: {0}")]
    Unavailable(String),

    #[error("invalid tool name: {0:?}")]
    InvalidName(String),

    /// The handler itself failed; information for the model, not fatal.
    #[error("{0}")]
    Execution(#[from] anyhow::Error),
}

/// Central registry holding all available tools.
///
/// Registration happens during initialization; afterwards the registry is
/// read-mostly and consumed through immutable [`ToolView`] lenses.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<(), ToolError> {
        let name = tool.name().to_string();
        if !valid_tool_name(&name) {
            return Err(ToolError::InvalidName(name));
        }
        self.tools.insert(name, Arc::new(tool));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Read-only view over every registered tool.
    pub fn view(&self) -> ToolView {
        ToolView {
            tools: self.tools.clone(),
        }
    }

    /// View restricted to the named tools.  Unknown names are skipped —
    /// a profile may allow tools that this deployment does not register.
    pub fn filtered(&self, include: &[String]) -> ToolView {
        ToolView {
            tools: include
                .iter()
                .filter_map(|n| self.tools.get(n).map(|t| (n.clone(), Arc::clone(t))))
                .collect(),
        }
    }

    /// View with the named tools removed.
    pub fn filtered_excluding(&self, exclude: &[String]) -> ToolView {
        ToolView {
            tools: self
                .tools
                .iter()
                .filter(|(n, _)| !exclude.iter().any(|e| e == *n))
                .map(|(n, t)| (n.clone(), Arc::clone(t)))
                .collect(),
        }
    }

    /// Union of tools carrying at least one of `tags`.
    /// Tag membership is case-sensitive.
    pub fn filter_by_tags(&self, tags: &[String]) -> ToolView {
        ToolView {
            tools: self
                .tools
                .iter()
                .filter(|(_, t)| t.tags().iter().any(|tag| tags.iter().any(|q| q == tag)))
                .map(|(n, t)| (n.clone(), Arc::clone(t)))
                .collect(),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// An immutable lens over a tool set.
///
/// Views share the parent registry's handler storage (`Arc`s into the same
/// tools) but hold their own name table: registering into the parent after
/// a view was taken does not change the view.
#[derive(Clone)]
pub struct ToolView {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolView {
    pub fn empty() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Schema export for the model, sorted by name for a stable prompt.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Derive a further-restricted view from this one.
    pub fn excluding(&self, exclude: &[String]) -> ToolView {
        ToolView {
            tools: self
                .tools
                .iter()
                .filter(|(n, _)| !exclude.iter().any(|e| e == *n))
                .map(|(n, t)| (n.clone(), Arc::clone(t)))
                .collect(),
        }
    }

    /// Derive a view restricted to the named tools.  Unknown names are
    /// skipped.
    pub fn including(&self, include: &[String]) -> ToolView {
        ToolView {
            tools: include
                .iter()
                .filter_map(|n| self.tools.get(n).map(|t| (n.clone(), Arc::clone(t))))
                .collect(),
        }
    }

    /// Derive the union of tools carrying at least one of `tags`.
    pub fn with_tags(&self, tags: &[String]) -> ToolView {
        ToolView {
            tools: self
                .tools
                .iter()
                .filter(|(_, t)| t.tags().iter().any(|tag| tags.iter().any(|q| q == tag)))
                .map(|(n, t)| (n.clone(), Arc::clone(t)))
                .collect(),
        }
    }

    /// Derive a view with one additional tool.  Used by loops that carry
    /// private tools (e.g. a sleep-setting tool) alongside a shared view.
    pub fn with_tool(&self, tool: Arc<dyn Tool>) -> ToolView {
        let mut tools = self.tools.clone();
        tools.insert(tool.name().to_string(), tool);
        ToolView { tools }
    }

    /// Resolve and run one tool.  Lookup is case-sensitive.
    pub async fn execute(
        &self,
        scope: &Scope,
        name: &str,
        args: Value,
    ) -> Result<String, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::Unavailable(name.to_string()))?;
        Ok(tool.execute(scope, args).await?)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
