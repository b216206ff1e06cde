//! Secrets tool: a small key/value store for credentials the agent needs.
//!
//! Values live in a JSON object on disk. The agent protects the file in its
//! sandbox, and audit records of this tool carry no values.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::base::{optional_string, require_string, Tool, ToolArgs, ToolContext};
use crate::sandbox::Sandbox;

/// Placeholder written to the audit log instead of a secret value.
pub const REDACTED: &str = "[redacted]";

/// Store, fetch, list and delete named secrets.
pub struct SecretsTool {
    path: PathBuf,
    /// Held across load-modify-save.
    write_lock: Mutex<()>,
}

impl SecretsTool {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> anyhow::Result<BTreeMap<String, String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) if text.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(text) => serde_json::from_str(&text)
                .with_context(|| format!("secrets file {} is not valid JSON", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e).context("failed to read secrets file"),
        }
    }

    /// Rewrite the whole file through a temp file so readers never see a partial write.
    async fn save(&self, secrets: &BTreeMap<String, String>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("failed to create secrets directory")?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_string_pretty(secrets)?;
        tokio::fs::write(&tmp, body)
            .await
            .context("failed to write secrets file")?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .context("failed to replace secrets file")?;
        debug!(path = %self.path.display(), count = secrets.len(), "secrets saved");
        Ok(())
    }
}

#[async_trait]
impl Tool for SecretsTool {
    fn name(&self) -> &str {
        "secrets"
    }

    fn description(&self) -> &str {
        "Manage stored secrets such as API keys and tokens. \
         Actions: store (key + value), get (key), list, delete (key)."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["store", "get", "list", "delete"],
                    "description": "What to do"
                },
                "key": {
                    "type": "string",
                    "description": "Secret name"
                },
                "value": {
                    "type": "string",
                    "description": "Secret value (store only)"
                }
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, args: &ToolArgs, ctx: &ToolContext, _sandbox: &Sandbox) -> anyhow::Result<String> {
        let action = require_string(args, "action")?;
        let key = optional_string(args, "key").filter(|k| !k.is_empty());

        match action.as_str() {
            "store" => {
                let (Some(key), Some(value)) = (key, optional_string(args, "value")) else {
                    anyhow::bail!("key and value are required");
                };
                let _guard = self.write_lock.lock().await;
                let mut secrets = self.load().await?;
                secrets.insert(key.clone(), value);
                self.save(&secrets).await?;
                info!(key = %key, session = %ctx.session_key, "secret stored");
                Ok(format!("Secret '{key}' stored successfully"))
            }
            "get" => {
                let key = key.ok_or_else(|| anyhow::anyhow!("key is required"))?;
                let secrets = self.load().await?;
                match secrets.get(&key) {
                    Some(value) => Ok(value.clone()),
                    None => Ok(format!("Secret '{key}' not found")),
                }
            }
            "list" => {
                let secrets = self.load().await?;
                if secrets.is_empty() {
                    return Ok("No secrets stored".to_string());
                }
                let names: Vec<&str> = secrets.keys().map(String::as_str).collect();
                Ok(format!("Stored secrets ({}): {}", names.len(), names.join(", ")))
            }
            "delete" => {
                let key = key.ok_or_else(|| anyhow::anyhow!("key is required"))?;
                let _guard = self.write_lock.lock().await;
                let mut secrets = self.load().await?;
                if secrets.remove(&key).is_none() {
                    return Ok(format!("Secret '{key}' not found"));
                }
                self.save(&secrets).await?;
                info!(key = %key, session = %ctx.session_key, "secret deleted");
                Ok(format!("Secret '{key}' deleted"))
            }
            other => anyhow::bail!("unknown action '{other}'"),
        }
    }

    fn redact(&self, args: &mut Value, result: &mut String) {
        if let Some(value) = args.get_mut("value") {
            *value = Value::String(REDACTED.to_string());
        }
        if args.get("action").and_then(Value::as_str) == Some("get") {
            *result = REDACTED.to_string();
        }
    }
}
