//! Slash commands answered without calling the model.
//!
//! The table is built once at startup from plain `fn` handlers; a
//! duplicate name fails the build. A message is a command only when its
//! first word names a registered command, so `/unknown` still reaches the
//! model.

use std::collections::HashMap;

use thiserror::Error;

use tidebot_core::session::SessionManager;

use crate::subagent::SubagentManager;
use crate::tools::ToolRegistry;

/// What a handler can see and touch.
pub struct CommandContext<'a> {
    /// Session key derived from the inbound message, before any switch.
    pub base_key: &'a str,
    /// Text after the command word, trimmed.
    pub args: &'a str,
    pub sessions: &'a SessionManager,
    pub tools: &'a ToolRegistry,
    pub subagents: &'a SubagentManager,
    pub default_model: &'a str,
    pub table: &'a CommandTable,
}

pub type CommandHandler = fn(&CommandContext<'_>) -> String;

#[derive(Clone, Copy)]
pub struct Command {
    pub name: &'static str,
    pub usage: &'static str,
    pub description: &'static str,
    pub handler: CommandHandler,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandTableError {
    #[error("duplicate command '/{0}'")]
    Duplicate(String),
}

/// Name → handler lookup, in registration order for `/help`.
pub struct CommandTable {
    commands: Vec<Command>,
    index: HashMap<&'static str, usize>,
}

impl CommandTable {
    pub fn new(commands: Vec<Command>) -> Result<Self, CommandTableError> {
        let mut index = HashMap::with_capacity(commands.len());
        for (i, command) in commands.iter().enumerate() {
            if index.insert(command.name, i).is_some() {
                return Err(CommandTableError::Duplicate(command.name.to_string()));
            }
        }
        Ok(Self { commands, index })
    }

    /// `/session`, `/clear`, `/model`, `/tools` and `/help`.
    pub fn builtin() -> Result<Self, CommandTableError> {
        Self::new(vec![
            Command {
                name: "session",
                usage: "/session [name|default]",
                description: "Show the active session, or switch to a named one",
                handler: session_command,
            },
            Command {
                name: "clear",
                usage: "/clear",
                description: "Clear the active session's history",
                handler: clear_command,
            },
            Command {
                name: "model",
                usage: "/model [id|default]",
                description: "Show or set the model for this session",
                handler: model_command,
            },
            Command {
                name: "tools",
                usage: "/tools",
                description: "List tools and subagents",
                handler: tools_command,
            },
            Command {
                name: "help",
                usage: "/help",
                description: "List commands",
                handler: help_command,
            },
        ])
    }

    pub fn get(&self, name: &str) -> Option<&Command> {
        self.index.get(name).map(|&i| &self.commands[i])
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// The command `text` invokes and its argument string, if any.
    pub fn parse<'t>(&self, text: &'t str) -> Option<(&Command, &'t str)> {
        let rest = text.trim().strip_prefix('/')?;
        let (word, args) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        self.get(word).map(|command| (command, args.trim()))
    }
}

// ─────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────

fn session_command(ctx: &CommandContext<'_>) -> String {
    match ctx.args {
        "" => {
            let key = ctx.sessions.active_key(ctx.base_key);
            match ctx.sessions.load(&key) {
                Ok(session) => format!(
                    "Session: {key}\nTurns: {}\nMessages: {}\nModel: {}",
                    session.turns,
                    session.messages.len(),
                    session.model_override.as_deref().unwrap_or(ctx.default_model)
                ),
                Err(e) => format!("Session: {key}\n(unreadable: {e})"),
            }
        }
        "default" => {
            let key = ctx.sessions.switch(ctx.base_key, None);
            format!("Switched back to session {key}")
        }
        name if !is_session_name(name) => format!(
            "Invalid session name '{name}': use up to {MAX_SESSION_NAME} letters, digits, '-' or '_'"
        ),
        name => {
            let key = ctx.sessions.switch(ctx.base_key, Some(name));
            format!("Switched to session {key}")
        }
    }
}

const MAX_SESSION_NAME: usize = 64;

/// Names that cannot form a subagent key or another session's key.
fn is_session_name(name: &str) -> bool {
    name.len() <= MAX_SESSION_NAME
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

fn clear_command(ctx: &CommandContext<'_>) -> String {
    let key = ctx.sessions.active_key(ctx.base_key);
    match ctx.sessions.clear(&key) {
        Ok(()) => format!("Cleared history of session {key}"),
        Err(e) => format!("Failed to clear session {key}: {e}"),
    }
}

fn model_command(ctx: &CommandContext<'_>) -> String {
    let key = ctx.sessions.active_key(ctx.base_key);
    let change = match ctx.args {
        "" => {
            let session = ctx.sessions.get_or_create(&key);
            return match session.model_override {
                Some(model) => format!("Model: {model} (session override)"),
                None => format!("Model: {} (default)", ctx.default_model),
            };
        }
        "default" => None,
        model => Some(model.to_string()),
    };
    let reply = match &change {
        Some(model) => format!("Model set to {model}"),
        None => format!("Model reset to default ({})", ctx.default_model),
    };
    match ctx.sessions.set_model_override(&key, change) {
        Ok(()) => reply,
        Err(e) => format!("Failed to update model: {e}"),
    }
}

fn tools_command(ctx: &CommandContext<'_>) -> String {
    let names = ctx.tools.tool_names();
    let mut lines = vec![format!("Tools ({}): {}", names.len(), names.join(", "))];

    let running = ctx.subagents.running();
    if running.is_empty() {
        lines.push("Running subagents: none".to_string());
    } else {
        lines.push(format!("Running subagents ({}):", running.len()));
        lines.extend(running.iter().map(|s| {
            format!(
                "- [{}] {} (since {})",
                s.label,
                s.id,
                s.started_at.format("%H:%M:%S")
            )
        }));
    }

    let recent = ctx.subagents.recent();
    if !recent.is_empty() {
        lines.push("Recent subagents:".to_string());
        lines.extend(recent.iter().rev().map(|s| {
            format!(
                "- [{}] {} {} after {} round(s)",
                s.label, s.id, s.status, s.iterations
            )
        }));
    }
    lines.join("\n")
}

fn help_command(ctx: &CommandContext<'_>) -> String {
    let mut lines = vec!["Commands:".to_string()];
    lines.extend(
        ctx.table
            .commands()
            .iter()
            .map(|c| format!("{}: {}", c.usage, c.description)),
    );
    lines.join("\n")
}
