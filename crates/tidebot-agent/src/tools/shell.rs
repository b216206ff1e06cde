//! Shell tool: execute commands in a subprocess.
//!
//! Dangerous patterns are always refused. Workspace confinement of the
//! working directory and path tokens is the registry's sandbox job.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::info;

use tidebot_core::audit::{security_event, SecurityCategory};

use super::base::{
    optional_string, require_string, Capability, SandboxTarget, Tool, ToolArgs, ToolContext,
};
use crate::sandbox::Sandbox;

/// Maximum output length before truncation (characters).
const MAX_OUTPUT_LEN: usize = 10_000;

/// Default command timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Dangerous command patterns that are always blocked.
const DENY_PATTERNS: &[&str] = &[
    r"\brm\s+-[rf]{1,2}\b",
    r"\bdel\s+/[fq]\b",
    r"\brmdir\s+/s\b",
    r"\b(format|mkfs|diskpart)\b",
    r"\bdd\s+if=",
    r">\s*/dev/sd",
    r"\b(shutdown|reboot|poweroff)\b",
    r":\(\)\s*\{.*\};\s*:", // fork bomb
];

// ─────────────────────────────────────────────
// ExecTool
// ─────────────────────────────────────────────

/// Execute shell commands in a subprocess.
pub struct ExecTool {
    timeout: Duration,
    /// Compiled deny regexes (built once at construction).
    deny_regexes: Vec<Regex>,
}

impl ExecTool {
    pub fn new(timeout_secs: Option<u64>) -> Self {
        let deny_regexes = DENY_PATTERNS
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect();

        Self {
            timeout: Duration::from_secs(timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)),
            deny_regexes,
        }
    }

    /// The deny pattern `command` matches, if any.
    fn denied_by(&self, command: &str) -> Option<&str> {
        let lower = command.to_lowercase();
        self.deny_regexes
            .iter()
            .find(|re| re.is_match(&lower))
            .map(|re| re.as_str())
    }
}

impl Default for ExecTool {
    fn default() -> Self {
        Self::new(None)
    }
}

fn truncate_output(mut combined: String) -> String {
    if combined.chars().count() <= MAX_OUTPUT_LEN {
        return combined;
    }
    let cut = combined
        .char_indices()
        .nth(MAX_OUTPUT_LEN)
        .map_or(combined.len(), |(i, _)| i);
    let remaining = combined[cut..].chars().count();
    combined.truncate(cut);
    combined.push_str(&format!("\n... (truncated, {remaining} more chars)"));
    combined
}

#[async_trait]
impl Tool for ExecTool {
    fn name(&self) -> &str {
        "exec"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return its output. \
         Use this for running builds, tests, git, or any CLI tool."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "working_dir": {
                    "type": "string",
                    "description": "Optional working directory (defaults to the workspace root)"
                }
            },
            "required": ["command"]
        })
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Process, Capability::Filesystem]
    }

    fn sandbox_targets(&self, args: &ToolArgs) -> Vec<SandboxTarget> {
        match optional_string(args, "command") {
            Some(command) => vec![SandboxTarget::Command {
                command,
                working_dir: optional_string(args, "working_dir"),
            }],
            None => Vec::new(),
        }
    }

    async fn execute(&self, args: &ToolArgs, ctx: &ToolContext, sandbox: &Sandbox) -> anyhow::Result<String> {
        let command = require_string(args, "command")?;

        if let Some(pattern) = self.denied_by(&command) {
            security_event(
                SecurityCategory::ShellSecurity,
                self.name(),
                &format!("command matched deny pattern {pattern}"),
                true,
            );
            anyhow::bail!("Command blocked by safety guard (dangerous pattern detected)");
        }

        let working_dir = optional_string(args, "working_dir");
        let cwd = sandbox.check_command(&command, working_dir.as_deref())?;

        info!(command = %command, cwd = %cwd.display(), session = %ctx.session_key, "executing shell command");

        let (shell, flag) = if cfg!(target_os = "windows") {
            ("cmd", "/C")
        } else {
            ("sh", "-c")
        };
        let child = Command::new(shell)
            .args([flag, command.as_str()])
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow::anyhow!("Failed to spawn command: {e}"))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| anyhow::anyhow!("Command failed: {e}"))?,
            Err(_) => anyhow::bail!("Command timed out after {} seconds", self.timeout.as_secs()),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let code = output.status.code().unwrap_or(-1);

        let mut parts = Vec::new();
        if !stdout.is_empty() {
            parts.push(stdout.into_owned());
        }
        if !stderr.is_empty() {
            parts.push(format!("STDERR:\n{stderr}"));
        }
        if code != 0 {
            parts.push(format!("Exit code: {code}"));
        }

        if parts.is_empty() {
            return Ok("(no output)".to_string());
        }
        Ok(truncate_output(parts.join("\n")))
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
