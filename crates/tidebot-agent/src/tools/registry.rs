//! Tool Registry: named capabilities behind one policy gate.
//!
//! `execute` is the only way a tool runs. It checks the name, validates the
//! arguments, vets sandbox targets, enforces the timeout and cancellation,
//! and writes one audit record per call whatever the outcome.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use tidebot_core::audit::{security_event, AuditLog, SecurityCategory, ToolCallRecord};
use tidebot_core::error::{SandboxViolation, ToolError};
use tidebot_core::types::{ToolDefinition, ToolOutcome};

use super::base::{validate_arguments, SandboxTarget, Tool, ToolContext};
use crate::sandbox::Sandbox;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

// ─────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────

/// Stores tools keyed by name and dispatches calls.
///
/// Owns `Arc<dyn Tool>` so tools can be shared with child registries.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    sandbox: Arc<Sandbox>,
    audit: Option<Arc<AuditLog>>,
    timeout: Duration,
}

impl ToolRegistry {
    /// Create an empty registry bound to a sandbox.
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            sandbox,
            audit: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn sandbox(&self) -> &Arc<Sandbox> {
        &self.sandbox
    }

    pub fn audit(&self) -> Option<&Arc<AuditLog>> {
        self.audit.as_ref()
    }

    /// Register a tool. A name that is already taken keeps its tool and
    /// `false` is returned.
    pub fn register(&self, tool: Arc<dyn Tool>) -> bool {
        let mut tools = self.tools.write().unwrap_or_else(PoisonError::into_inner);
        let name = tool.name().to_string();
        if tools.contains_key(&name) {
            debug!(tool = %name, "tool already registered, keeping existing entry");
            return false;
        }
        info!(tool = %name, "registered tool");
        tools.insert(name, tool);
        true
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.read().get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Names of all registered tools, sorted for determinism.
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Tool schemas for the model, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> =
            self.read().values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// A child registry with only `names`, sharing tools, sandbox and audit log.
    ///
    /// Names this registry does not have are refused, so a child can never
    /// hold more than its parent.
    pub fn subset(&self, names: &[String]) -> Result<ToolRegistry, ToolError> {
        let tools = self.read();
        let mut picked = HashMap::new();
        for name in names {
            let tool = tools
                .get(name)
                .ok_or_else(|| ToolError::UnknownTool(name.clone()))?;
            picked.insert(name.clone(), tool.clone());
        }
        Ok(self.child(picked))
    }

    /// A child registry with every tool of this one. Later registrations do
    /// not flow back to the parent.
    pub fn fork(&self) -> ToolRegistry {
        self.child(self.read().clone())
    }

    fn child(&self, tools: HashMap<String, Arc<dyn Tool>>) -> ToolRegistry {
        ToolRegistry {
            tools: RwLock::new(tools),
            sandbox: self.sandbox.clone(),
            audit: self.audit.clone(),
            timeout: self.timeout,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<dyn Tool>>> {
        self.tools.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Execute a tool call and audit it.
    pub async fn execute(
        &self,
        name: &str,
        args: &Value,
        ctx: &ToolContext,
    ) -> Result<String, ToolError> {
        let start = Instant::now();
        let result = self.run(name, args, ctx).await;
        let elapsed = start.elapsed();

        match &result {
            Ok(output) => debug!(
                tool = name,
                session = %ctx.session_key,
                turn = ctx.turn,
                duration_ms = elapsed.as_millis() as u64,
                output_len = output.len(),
                "tool executed"
            ),
            Err(e) => warn!(
                tool = name,
                session = %ctx.session_key,
                turn = ctx.turn,
                duration_ms = elapsed.as_millis() as u64,
                error = %e,
                "tool call failed"
            ),
        }

        self.record(name, args, ctx, &result, elapsed);
        result
    }

    async fn run(&self, name: &str, args: &Value, ctx: &ToolContext) -> Result<String, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;

        validate_arguments(&tool.parameters(), args).map_err(|violations| {
            ToolError::InvalidArguments {
                tool: name.to_string(),
                violations,
            }
        })?;
        let empty = serde_json::Map::new();
        let params = args.as_object().unwrap_or(&empty);

        if self.sandbox.is_restricted() {
            for target in tool.sandbox_targets(params) {
                self.vet(name, &target)?;
            }
        }

        let call = tool.execute(params, ctx, &self.sandbox);
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(ToolError::Cancelled(name.to_string())),
            res = tokio::time::timeout(self.timeout, call) => match res {
                Err(_) => Err(ToolError::Timeout {
                    tool: name.to_string(),
                    secs: self.timeout.as_secs(),
                }),
                Ok(Ok(output)) => Ok(output),
                Ok(Err(e)) => Err(match e.downcast::<SandboxViolation>() {
                    Ok(violation) => {
                        security_event(SecurityCategory::PathSecurity, name, &violation.to_string(), true);
                        ToolError::SandboxViolation(violation)
                    }
                    Err(e) => ToolError::Failed {
                        tool: name.to_string(),
                        message: format!("{e:#}"),
                    },
                }),
            },
        }
    }

    fn vet(&self, tool: &str, target: &SandboxTarget) -> Result<(), SandboxViolation> {
        let (category, checked) = match target {
            SandboxTarget::Path(path) => {
                (SecurityCategory::PathSecurity, self.sandbox.resolve(path).map(|_| ()))
            }
            SandboxTarget::Command {
                command,
                working_dir,
            } => (
                SecurityCategory::ShellSecurity,
                self.sandbox
                    .check_command(command, working_dir.as_deref())
                    .map(|_| ()),
            ),
        };
        if let Err(violation) = &checked {
            security_event(category, tool, &violation.to_string(), true);
        }
        checked
    }

    fn record(
        &self,
        name: &str,
        args: &Value,
        ctx: &ToolContext,
        result: &Result<String, ToolError>,
        elapsed: Duration,
    ) {
        let Some(audit) = &self.audit else {
            return;
        };
        let (mut text, outcome) = match result {
            Ok(output) => (output.clone(), ToolOutcome::Success),
            Err(e) => (e.observation(), ToolOutcome::Error),
        };
        let mut arguments = args.clone();
        if let Some(tool) = self.get(name) {
            tool.redact(&mut arguments, &mut text);
        }
        let record = ToolCallRecord {
            timestamp: Utc::now(),
            session_key: ctx.session_key.clone(),
            turn: ctx.turn,
            tool: name.to_string(),
            arguments,
            result: text,
            duration_ms: elapsed.as_millis() as u64,
            outcome,
        };
        if let Err(e) = audit.append(record) {
            warn!(tool = name, session = %ctx.session_key, error = %e, "failed to write audit record");
        }
    }
}
