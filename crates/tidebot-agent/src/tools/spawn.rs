//! Spawn tool: hand a task to a background subagent.
//!
//! The origin (channel, chat, session, correlation id) comes from the
//! calling turn's [`ToolContext`], so one tool instance serves every session.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::base::{
    optional_string, optional_string_list, optional_u64, require_string, Tool, ToolArgs,
    ToolContext,
};
use crate::sandbox::Sandbox;
use crate::subagent::{SpawnError, SubagentManager, SubagentTask};

/// Delegates work to the [`SubagentManager`].
pub struct SpawnTool {
    manager: Arc<SubagentManager>,
    description: String,
}

impl SpawnTool {
    pub fn new(manager: Arc<SubagentManager>) -> Self {
        let description = format!(
            "Spawn a subagent to work on a task in the background. \
             It reports back to this chat when done. \
             Pick a cheaper model, a custom system prompt or a smaller tool set for simple jobs. \
             Available tools: {}",
            manager.available_tools().join(", ")
        );
        Self {
            manager,
            description,
        }
    }
}

#[async_trait]
impl Tool for SpawnTool {
    fn name(&self) -> &str {
        "spawn"
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "The task for the subagent to complete"
                },
                "label": {
                    "type": "string",
                    "description": "Short label for display"
                },
                "model": {
                    "type": "string",
                    "description": "Model to use instead of the default"
                },
                "system_prompt": {
                    "type": "string",
                    "description": "Custom system prompt for the subagent"
                },
                "tools": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": format!(
                        "Tools to enable (default: all of {})",
                        self.manager.available_tools().join(", ")
                    )
                },
                "max_iterations": {
                    "type": "integer",
                    "description": format!(
                        "Maximum tool-call rounds (default and cap {})",
                        self.manager.max_iterations()
                    )
                }
            },
            "required": ["task"]
        })
    }

    async fn execute(&self, args: &ToolArgs, ctx: &ToolContext, _sandbox: &Sandbox) -> anyhow::Result<String> {
        let mut task = SubagentTask::new(
            &ctx.session_key,
            &ctx.channel,
            &ctx.chat_id,
            require_string(args, "task")?,
        )
        .with_correlation_id(ctx.correlation_id.clone());

        if let Some(label) = optional_string(args, "label") {
            task = task.with_label(label);
        }
        if let Some(model) = optional_string(args, "model") {
            task = task.with_model(model);
        }
        if let Some(prompt) = optional_string(args, "system_prompt") {
            task = task.with_system_prompt(prompt);
        }
        if let Some(tools) = optional_string_list(args, "tools") {
            task = task.with_tools(tools);
        }
        if let Some(n) = optional_u64(args, "max_iterations") {
            task = task.with_max_iterations(u32::try_from(n).unwrap_or(u32::MAX));
        }

        match self.manager.spawn(task) {
            Ok(handle) => Ok(format!(
                "Subagent [{}] started (id: {}). I'll notify you when it completes.",
                handle.label, handle.id
            )),
            Err(SpawnError::UnknownTools(invalid)) => anyhow::bail!(
                "Invalid tools: {}. Available: {}",
                invalid.join(", "),
                self.manager.available_tools().join(", ")
            ),
            Err(e) => Err(e.into()),
        }
    }
}
