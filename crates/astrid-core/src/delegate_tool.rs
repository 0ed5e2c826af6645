use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use astrid_tools::{Scope, Tool};

use crate::delegate::{DelegateExecutor, DelegateRequest, DELEGATE_TOOL_NAME};

/// The meta-tool that spawns a delegate run.
///
/// Registered in the outer agent's registry only; the executor excludes it
/// from every delegate view, so delegates cannot delegate further.
pub struct DelegateTool {
    executor: Arc<DelegateExecutor>,
}

impl DelegateTool {
    pub fn new(executor: Arc<DelegateExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Tool for DelegateTool {
    fn name(&self) -> &str {
        DELEGATE_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Hand a focused task to a background delegate with its own tool \
         subset and budgets, and return its final answer. Use for work that \
         can proceed independently of the current conversation."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "The task for the delegate to complete"
                },
                "profile": {
                    "type": "string",
                    "description": "Named delegate profile (default: general)"
                },
                "guidance": {
                    "type": "string",
                    "description": "Optional extra guidance appended to the task"
                },
                "tags": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Capability tags selecting the delegate's toolset"
                }
            },
            "required": ["task"]
        })
    }

    fn tags(&self) -> &[&str] {
        &["delegation"]
    }

    async fn execute(&self, scope: &Scope, args: Value) -> anyhow::Result<String> {
        let req = DelegateRequest {
            task: args["task"].as_str().unwrap_or_default().to_string(),
            profile: args["profile"].as_str().unwrap_or_default().to_string(),
            guidance: args["guidance"].as_str().unwrap_or_default().to_string(),
            tags: args["tags"]
                .as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
        };
        debug!(profile = %req.profile, "delegate tool invoked");
        let outcome = self.executor.execute(scope, req).await?;
        Ok(outcome.content)
    }
}
