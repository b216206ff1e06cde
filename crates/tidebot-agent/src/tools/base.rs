//! Tool trait: the interface every agent capability implements.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use tidebot_core::types::ToolDefinition;

use crate::sandbox::Sandbox;

pub type ToolArgs = Map<String, Value>;

// ─────────────────────────────────────────────
// Tool trait
// ─────────────────────────────────────────────

/// What a tool can touch. Shown to the model and used for sandbox decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Filesystem,
    Process,
    Network,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Filesystem => write!(f, "filesystem"),
            Self::Process => write!(f, "process"),
            Self::Network => write!(f, "network"),
        }
    }
}

/// Something a tool call will touch, checked against the sandbox before it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxTarget {
    Path(String),
    Command {
        command: String,
        working_dir: Option<String>,
    },
}

/// Every agent tool implements this trait.
///
/// The registry validates arguments against [`parameters`](Tool::parameters)
/// and checks [`sandbox_targets`](Tool::sandbox_targets) before calling
/// [`execute`](Tool::execute), so tools can assume well-typed input.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name used by the model to call this tool (e.g. `"read_file"`).
    fn name(&self) -> &str;

    /// Human-readable description shown to the model.
    fn description(&self) -> &str;

    /// JSON Schema of the argument object:
    /// `{"type": "object", "properties": {...}, "required": [...]}`.
    fn parameters(&self) -> Value;

    fn capabilities(&self) -> &'static [Capability] {
        &[]
    }

    /// Targets to vet before the call runs. Empty for tools that touch nothing local.
    fn sandbox_targets(&self, _args: &ToolArgs) -> Vec<SandboxTarget> {
        Vec::new()
    }

    /// Run the tool. Errors become an observation for the model.
    async fn execute(
        &self,
        args: &ToolArgs,
        ctx: &ToolContext,
        sandbox: &Sandbox,
    ) -> anyhow::Result<String>;

    /// Scrub sensitive values from a call before it is written to the audit log.
    fn redact(&self, _args: &mut Value, _result: &mut String) {}

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), self.description(), self.parameters())
    }
}

// ─────────────────────────────────────────────
// Execution context
// ─────────────────────────────────────────────

/// Who is calling a tool, and on behalf of which turn.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub session_key: String,
    pub turn: u64,
    pub channel: String,
    pub chat_id: String,
    /// Id of the inbound message driving the turn.
    pub correlation_id: Option<String>,
    pub cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(session_key: impl Into<String>, turn: u64) -> Self {
        ToolContext {
            session_key: session_key.into(),
            turn,
            ..Default::default()
        }
    }

    pub fn with_origin(mut self, channel: impl Into<String>, chat_id: impl Into<String>) -> Self {
        self.channel = channel.into();
        self.chat_id = chat_id.into();
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

// ─────────────────────────────────────────────
// Argument validation
// ─────────────────────────────────────────────

/// Check `args` against the JSON Schema subset tools use: object type,
/// `required`, per-property `type` and `enum`. Returns every violation found.
pub fn validate_arguments(schema: &Value, args: &Value) -> Result<(), Vec<String>> {
    let Some(obj) = args.as_object() else {
        return Err(vec![format!(
            "arguments must be a JSON object, got {}",
            json_type_name(args)
        )]);
    };

    let mut violations = Vec::new();

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if !obj.contains_key(field) {
                violations.push(format!("missing required field '{field}'"));
            }
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);
    for (field, value) in obj {
        let Some(prop) = properties.and_then(|p| p.get(field)) else {
            continue;
        };
        if let Some(expected) = prop.get("type").and_then(Value::as_str) {
            if !matches_type(expected, value) {
                violations.push(format!(
                    "field '{field}' must be {expected}, got {}",
                    json_type_name(value)
                ));
                continue;
            }
        }
        if let Some(allowed) = prop.get("enum").and_then(Value::as_array) {
            if !allowed.contains(value) {
                let options: Vec<String> = allowed.iter().map(Value::to_string).collect();
                violations.push(format!(
                    "field '{field}' must be one of [{}], got {value}",
                    options.join(", ")
                ));
            }
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

fn matches_type(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ─────────────────────────────────────────────
// Param helpers
// ─────────────────────────────────────────────

/// Extract a required `String` param, returning a user-friendly error.
pub fn require_string(params: &ToolArgs, key: &str) -> anyhow::Result<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("Missing required parameter: {key}"))
}

pub fn optional_string(params: &ToolArgs, key: &str) -> Option<String> {
    params.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

pub fn optional_u64(params: &ToolArgs, key: &str) -> Option<u64> {
    params.get(key).and_then(|v| v.as_u64())
}

/// String array param; non-string entries are ignored.
pub fn optional_string_list(params: &ToolArgs, key: &str) -> Option<Vec<String>> {
    params.get(key).and_then(|v| v.as_array()).map(|items| {
        items
            .iter()
            .filter_map(|i| i.as_str().map(String::from))
            .collect()
    })
}
