//! Filesystem tools: read, write, edit, list directory.
//!
//! Paths are resolved through the registry's [`Sandbox`], so relative paths
//! land in the workspace and restricted registries refuse anything outside it.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::base::{require_string, Capability, SandboxTarget, Tool, ToolArgs, ToolContext};
use crate::sandbox::Sandbox;

const FS: &[Capability] = &[Capability::Filesystem];

fn path_target(args: &ToolArgs) -> Vec<SandboxTarget> {
    args.get("path")
        .and_then(Value::as_str)
        .map(|p| vec![SandboxTarget::Path(p.to_string())])
        .unwrap_or_default()
}

// ─────────────────────────────────────────────
// ReadFileTool
// ─────────────────────────────────────────────

/// Reads and returns the entire content of a file.
pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file at the given path. Returns the full text content."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file, absolute or relative to the workspace"
                }
            },
            "required": ["path"]
        })
    }

    fn capabilities(&self) -> &'static [Capability] {
        FS
    }

    fn sandbox_targets(&self, args: &ToolArgs) -> Vec<SandboxTarget> {
        path_target(args)
    }

    async fn execute(&self, args: &ToolArgs, _ctx: &ToolContext, sandbox: &Sandbox) -> anyhow::Result<String> {
        let path = sandbox.resolve(&require_string(args, "path")?)?;

        if !path.exists() {
            anyhow::bail!("File not found: {}", path.display());
        }
        if !path.is_file() {
            anyhow::bail!("Not a file: {}", path.display());
        }

        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {e}", path.display()))
    }
}

// ─────────────────────────────────────────────
// WriteFileTool
// ─────────────────────────────────────────────

/// Creates or overwrites a file with the given content.
pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file, creating it if it doesn't exist or overwriting if it does. \
         Parent directories are created automatically."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path for the file, absolute or relative to the workspace"
                },
                "content": {
                    "type": "string",
                    "description": "Content to write to the file"
                }
            },
            "required": ["path", "content"]
        })
    }

    fn capabilities(&self) -> &'static [Capability] {
        FS
    }

    fn sandbox_targets(&self, args: &ToolArgs) -> Vec<SandboxTarget> {
        path_target(args)
    }

    async fn execute(&self, args: &ToolArgs, _ctx: &ToolContext, sandbox: &Sandbox) -> anyhow::Result<String> {
        let path = sandbox.resolve(&require_string(args, "path")?)?;
        let content = require_string(args, "content")?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                anyhow::anyhow!("Failed to create directory {}: {e}", parent.display())
            })?;
        }

        tokio::fs::write(&path, &content)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to write {}: {e}", path.display()))?;
        Ok(format!(
            "Successfully wrote {} bytes to {}",
            content.len(),
            path.display()
        ))
    }
}

// ─────────────────────────────────────────────
// EditFileTool
// ─────────────────────────────────────────────

/// Replaces a text snippet within a file (first occurrence).
pub struct EditFileTool;

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Edit a file by replacing the first occurrence of `old_text` with `new_text`. \
         Include enough context in `old_text` to uniquely identify the replacement site."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file to edit"
                },
                "old_text": {
                    "type": "string",
                    "description": "Exact text to find (include surrounding context for uniqueness)"
                },
                "new_text": {
                    "type": "string",
                    "description": "Text to replace old_text with"
                }
            },
            "required": ["path", "old_text", "new_text"]
        })
    }

    fn capabilities(&self) -> &'static [Capability] {
        FS
    }

    fn sandbox_targets(&self, args: &ToolArgs) -> Vec<SandboxTarget> {
        path_target(args)
    }

    async fn execute(&self, args: &ToolArgs, _ctx: &ToolContext, sandbox: &Sandbox) -> anyhow::Result<String> {
        let path = sandbox.resolve(&require_string(args, "path")?)?;
        let old_text = require_string(args, "old_text")?;
        let new_text = require_string(args, "new_text")?;

        if !path.is_file() {
            anyhow::bail!("File not found: {}", path.display());
        }
        if old_text.is_empty() {
            anyhow::bail!("old_text must not be empty");
        }

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {e}", path.display()))?;

        let count = content.matches(&old_text).count();
        if count == 0 {
            anyhow::bail!("old_text not found in {}", path.display());
        }

        let warning = if count > 1 {
            format!("Warning: old_text appears {count} times; only the first occurrence was replaced. ")
        } else {
            String::new()
        };

        let updated = content.replacen(&old_text, &new_text, 1);
        tokio::fs::write(&path, &updated)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to write {}: {e}", path.display()))?;

        Ok(format!("{warning}Successfully edited {}", path.display()))
    }
}

// ─────────────────────────────────────────────
// ListDirTool
// ─────────────────────────────────────────────

/// Lists the contents of a directory, folders marked with a trailing `/`.
pub struct ListDirTool;

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List the contents of a directory. Directories are shown with a trailing '/'."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the directory to list (defaults to the workspace)"
                }
            }
        })
    }

    fn capabilities(&self) -> &'static [Capability] {
        FS
    }

    fn sandbox_targets(&self, args: &ToolArgs) -> Vec<SandboxTarget> {
        path_target(args)
    }

    async fn execute(&self, args: &ToolArgs, _ctx: &ToolContext, sandbox: &Sandbox) -> anyhow::Result<String> {
        let raw = args.get("path").and_then(Value::as_str).unwrap_or(".");
        let path = sandbox.resolve(raw)?;

        if !path.is_dir() {
            anyhow::bail!("Not a directory: {}", path.display());
        }

        let mut entries: Vec<(String, bool)> = Vec::new();
        let mut dir = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read directory {}: {e}", path.display()))?;
        while let Some(entry) = dir.next_entry().await? {
            let is_dir = entry.file_type().await.map(|ft| ft.is_dir()).unwrap_or(false);
            entries.push((entry.file_name().to_string_lossy().into_owned(), is_dir));
        }
        entries.sort();

        if entries.is_empty() {
            return Ok("(empty directory)".into());
        }
        Ok(entries
            .into_iter()
            .map(|(name, is_dir)| if is_dir { format!("{name}/") } else { name })
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
