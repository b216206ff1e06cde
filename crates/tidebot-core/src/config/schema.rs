//! Configuration schema.
//!
//! Hierarchy: `Config` → `AgentsConfig`, `ProviderConfig`, channel access
//! rules, `ToolsConfig`.
//!
//! JSON on disk uses **camelCase** keys; Rust uses snake_case.
//! We use `#[serde(rename_all = "camelCase")]` to handle the conversion.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::utils;

// ─────────────────────────────────────────────
// Root Config
// ─────────────────────────────────────────────

/// Root configuration, loaded once at startup from `~/.tidebot/config.json`
/// plus env vars and then passed by reference.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub agents: AgentsConfig,
    pub provider: ProviderConfig,
    /// Per-channel access rules, keyed by channel name.
    pub channels: HashMap<String, ChannelConfig>,
    pub tools: ToolsConfig,
}

impl Config {
    /// Allow-list for `channel`; empty when the channel is not configured.
    pub fn allow_list(&self, channel: &str) -> &[String] {
        self.channels
            .get(channel)
            .map(|c| c.allow_from.as_slice())
            .unwrap_or(&[])
    }
}

// ─────────────────────────────────────────────
// Agents
// ─────────────────────────────────────────────

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentsConfig {
    pub defaults: AgentDefaults,
}

/// Default agent settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentDefaults {
    /// Workspace root; also the sandbox boundary.
    pub workspace: String,
    /// Default LLM model identifier.
    pub model: String,
    /// Maximum tokens to generate per response.
    pub max_tokens: u32,
    /// Sampling temperature (0.0 to 2.0).
    pub temperature: f64,
    /// Model calls allowed per turn before the answer is truncated.
    pub max_tool_iterations: u32,
    /// How many past turns are replayed to the model.
    pub history_turns: usize,
    /// Directive files loaded into the system prompt, in this order.
    pub bootstrap_files: Vec<String>,
    /// Character budget for the assembled context.
    pub context_char_budget: usize,
    /// Upper bound on a single model call.
    pub model_timeout_secs: u64,
    pub subagent: SubagentConfig,
}

impl AgentDefaults {
    /// Workspace path with `~` expanded.
    pub fn workspace_path(&self) -> PathBuf {
        utils::expand_home(&self.workspace)
    }
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            workspace: "~/.tidebot/workspace".to_string(),
            model: "anthropic/claude-sonnet-4-20250514".to_string(),
            max_tokens: 8192,
            temperature: 0.7,
            max_tool_iterations: 20,
            history_turns: 25,
            bootstrap_files: ["AGENTS.md", "SOUL.md", "USER.md", "TOOLS.md", "IDENTITY.md"]
                .into_iter()
                .map(String::from)
                .collect(),
            context_char_budget: 48_000,
            model_timeout_secs: 120,
            subagent: SubagentConfig::default(),
        }
    }
}

/// Limits for background subagents.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubagentConfig {
    /// Default iteration budget of a spawned task.
    pub max_iterations: u32,
    /// Tasks allowed to run at once.
    pub max_concurrent: usize,
    /// Finished tasks remembered for introspection.
    pub recent_completions: usize,
}

impl Default for SubagentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 15,
            max_concurrent: 8,
            recent_completions: 16,
        }
    }
}

// ─────────────────────────────────────────────
// Provider
// ─────────────────────────────────────────────

/// Connection settings for the LLM provider (API key, base URL, headers).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfig {
    /// API key for authentication.
    pub api_key: String,
    /// Custom API base URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
    /// Extra HTTP headers to send with each request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_headers: Option<HashMap<String, String>>,
    pub retry: RetryConfig,
}

impl ProviderConfig {
    /// Whether this provider has a configured API key.
    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }
}

/// Backoff for transport failures.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
        }
    }
}

// ─────────────────────────────────────────────
// Channels
// ─────────────────────────────────────────────

/// Access rules for one channel. Adapter-specific keys are kept in `extra`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelConfig {
    pub enabled: bool,
    /// Sender ids allowed to talk to the agent. Empty = everyone.
    pub allow_from: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

// ─────────────────────────────────────────────
// Tools
// ─────────────────────────────────────────────

/// Tool configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolsConfig {
    /// Shell exec tool configuration.
    pub exec: ExecToolConfig,
    /// Whether to restrict file/exec operations to the workspace directory.
    pub restrict_to_workspace: bool,
    /// Upper bound on any single tool call.
    pub timeout_secs: u64,
    /// Characters of each tool result kept in the audit log.
    pub audit_result_max_chars: usize,
    /// Where the secrets tool keeps its values. Defaults to `~/.tidebot/secrets.json`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secrets_path: Option<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            exec: ExecToolConfig::default(),
            restrict_to_workspace: false,
            timeout_secs: 120,
            audit_result_max_chars: 2000,
            secrets_path: None,
        }
    }
}

impl ToolsConfig {
    pub fn secrets_file(&self) -> PathBuf {
        match &self.secrets_path {
            Some(p) => utils::expand_home(p),
            None => utils::get_data_path().join("secrets.json"),
        }
    }
}

/// Shell exec tool configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecToolConfig {
    /// Timeout in seconds for shell commands.
    pub timeout: u64,
}

impl Default for ExecToolConfig {
    fn default() -> Self {
        Self { timeout: 60 }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
