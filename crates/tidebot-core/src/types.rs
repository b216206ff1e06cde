//! Core types: the provider-neutral conversation model.
//!
//! These types describe what the agent says and hears. They are deliberately
//! not a wire format; providers translate them into whatever their API expects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// ─────────────────────────────────────────────
// Messages
// ─────────────────────────────────────────────

/// A role-tagged conversation message.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Message {
    System {
        content: String,
    },

    User {
        content: MessageContent,
    },

    Assistant {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
        /// How the turn ended, when it did not end normally.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        marker: Option<TurnMarker>,
    },

    Tool {
        tool_call_id: String,
        name: String,
        content: String,
        #[serde(default)]
        outcome: ToolOutcome,
    },
}

impl Message {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Message::System {
            content: content.into(),
        }
    }

    /// Create a user message with text content.
    pub fn user(content: impl Into<String>) -> Self {
        Message::User {
            content: MessageContent::Text(content.into()),
        }
    }

    /// Create a user message with mixed text/media content.
    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Message::User {
            content: MessageContent::Parts(parts),
        }
    }

    /// Create an assistant message with text content.
    pub fn assistant(content: impl Into<String>) -> Self {
        Message::Assistant {
            content: Some(content.into()),
            tool_calls: Vec::new(),
            marker: None,
        }
    }

    /// Create an assistant message requesting tool calls.
    pub fn assistant_tool_calls(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Message::Assistant {
            content,
            tool_calls,
            marker: None,
        }
    }

    /// Create an assistant message that closes an abnormal turn.
    pub fn assistant_marked(content: impl Into<String>, marker: TurnMarker) -> Self {
        Message::Assistant {
            content: Some(content.into()),
            tool_calls: Vec::new(),
            marker: Some(marker),
        }
    }

    /// Create a tool result message.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
        outcome: ToolOutcome,
    ) -> Self {
        Message::Tool {
            tool_call_id: tool_call_id.into(),
            name: name.into(),
            content: content.into(),
            outcome,
        }
    }

    pub fn is_user(&self) -> bool {
        matches!(self, Message::User { .. })
    }

    /// Plain-text rendering of the message body (media parts are skipped).
    pub fn text(&self) -> String {
        match self {
            Message::System { content } | Message::Tool { content, .. } => content.clone(),
            Message::User { content } => content.text(),
            Message::Assistant { content, .. } => content.clone().unwrap_or_default(),
        }
    }

    /// Rough size used for context budgeting.
    pub fn char_len(&self) -> usize {
        match self {
            Message::User { content } => content.char_len(),
            Message::Assistant {
                content, tool_calls, ..
            } => {
                content.as_deref().map_or(0, |c| c.chars().count())
                    + tool_calls
                        .iter()
                        .map(|c| c.name.len() + c.arguments.to_string().len())
                        .sum::<usize>()
            }
            other => other.text().chars().count(),
        }
    }
}

/// How an abnormal turn ended. Stored on the closing assistant message.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnMarker {
    /// The iteration budget ran out before a final answer.
    Truncated,
    /// The turn ended in the terminal error state.
    Failed { class: String },
    /// A timeout or shutdown interrupted the turn.
    Cancelled,
}

/// Result of a single tool execution.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolOutcome {
    #[default]
    Success,
    Error,
}

// ─────────────────────────────────────────────
// Message Content (text or mixed media)
// ─────────────────────────────────────────────

/// User message content: plain text, or an ordered list of text/media parts.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Concatenated text parts.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::Media { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    fn char_len(&self) -> usize {
        match self {
            MessageContent::Text(t) => t.chars().count(),
            MessageContent::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.chars().count(),
                    ContentPart::Media { data, .. } => data.len(),
                })
                .sum(),
        }
    }
}

/// A single part of a mixed message.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    /// Inline media, base64-encoded and tagged with its media type.
    Media {
        media_type: String,
        data: String,
    },
}

// ─────────────────────────────────────────────
// Tool calls and definitions
// ─────────────────────────────────────────────

/// A tool invocation requested by the model.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    /// Provider-assigned id, used to match the result.
    pub id: String,
    pub name: String,
    /// Decoded arguments. Normally an object; anything else fails validation.
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Tool schema advertised to the model.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the argument object.
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        ToolDefinition {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

// ─────────────────────────────────────────────
// LLM Response
// ─────────────────────────────────────────────

/// Response from an LLM provider after a chat call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LlmResponse {
    /// Text content from the assistant (None if only tool calls).
    pub content: Option<String>,
    /// Tool calls requested by the assistant.
    pub tool_calls: Vec<ToolCall>,
    /// Why the model stopped generating.
    pub finish_reason: Option<String>,
    /// Token usage statistics.
    pub usage: Option<UsageInfo>,
}

impl LlmResponse {
    /// A plain text answer.
    pub fn text(content: impl Into<String>) -> Self {
        LlmResponse {
            content: Some(content.into()),
            finish_reason: Some("stop".into()),
            ..Default::default()
        }
    }

    /// A response that only requests tools.
    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        LlmResponse {
            tool_calls: calls,
            finish_reason: Some("tool_calls".into()),
            ..Default::default()
        }
    }

    /// Whether the response contains tool calls.
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Token usage statistics from the LLM.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UsageInfo {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

// ─────────────────────────────────────────────
// Media attachments
// ─────────────────────────────────────────────

/// Where an attachment's bytes live.
#[derive(Clone, Debug, PartialEq)]
pub enum MediaSource {
    Path(PathBuf),
    Bytes(Arc<[u8]>),
}

/// A media attachment (photo, voice, document) from a channel message.
#[derive(Clone, Debug, PartialEq)]
pub struct MediaAttachment {
    pub source: MediaSource,
    /// MIME type (e.g. "image/jpeg"). Guessed from the filename when absent.
    pub mime_type: Option<String>,
    pub filename: Option<String>,
}

impl MediaAttachment {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        MediaAttachment {
            source: MediaSource::Path(path),
            mime_type: None,
            filename,
        }
    }

    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>, mime_type: impl Into<String>) -> Self {
        MediaAttachment {
            source: MediaSource::Bytes(bytes.into()),
            mime_type: Some(mime_type.into()),
            filename: None,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// Path of the attachment, if it is file-backed.
    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            MediaSource::Path(p) => Some(p),
            MediaSource::Bytes(_) => None,
        }
    }
}

// ─────────────────────────────────────────────
// Session types
// ─────────────────────────────────────────────

/// A conversation session with message history.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub key: String,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Model used instead of the configured default, set by `/model`.
    #[serde(default)]
    pub model_override: Option<String>,
    /// Number of completed turns.
    #[serde(default)]
    pub turns: u64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Session {
    /// Create a new empty session.
    pub fn new(key: impl Into<String>) -> Self {
        let now = Utc::now();
        Session {
            key: key.into(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            model_override: None,
            turns: 0,
            metadata: HashMap::new(),
        }
    }

    /// Messages of the last `max_turns` turns. Always starts at a user message.
    pub fn recent_history(&self, max_turns: usize) -> &[Message] {
        if max_turns == 0 {
            return &[];
        }
        let user_positions: Vec<usize> = self
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_user())
            .map(|(i, _)| i)
            .collect();
        match user_positions.len().checked_sub(max_turns) {
            Some(skip) => &self.messages[user_positions[skip]..],
            None => match user_positions.first() {
                Some(&first) => &self.messages[first..],
                None => &[],
            },
        }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
