//! Bus event types: messages flowing between channels and the agent loop.

use crate::types::MediaAttachment;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// An inbound message from a channel to the agent.
///
/// Immutable once published; the agent loop consumes each one exactly once.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    /// Unique id, used as the correlation id of the reply.
    pub id: String,
    /// Channel name (e.g. "telegram", "discord", "cli").
    pub channel: String,
    /// Sender identifier within the channel.
    pub sender_id: String,
    /// Chat/conversation identifier.
    pub chat_id: String,
    /// Explicit session key, overriding `channel:chat_id`.
    pub session_key_override: Option<String>,
    /// Text content of the message.
    pub content: String,
    /// When the message was received.
    pub timestamp: DateTime<Utc>,
    /// Attached media, in the order the user sent them.
    pub media: Vec<MediaAttachment>,
    /// Channel-specific metadata (e.g. message_id, username).
    pub metadata: HashMap<String, String>,
}

impl InboundMessage {
    /// Create a new inbound message with minimal required fields.
    pub fn new(
        channel: impl Into<String>,
        sender_id: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        InboundMessage {
            id: uuid::Uuid::new_v4().to_string(),
            channel: channel.into(),
            sender_id: sender_id.into(),
            chat_id: chat_id.into(),
            session_key_override: None,
            content: content.into(),
            timestamp: Utc::now(),
            media: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_session_key(mut self, key: impl Into<String>) -> Self {
        self.session_key_override = Some(key.into());
        self
    }

    pub fn with_media(mut self, media: MediaAttachment) -> Self {
        self.media.push(media);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Session key: the explicit override, or `"{channel}:{chat_id}"`.
    pub fn session_key(&self) -> String {
        match &self.session_key_override {
            Some(key) => key.clone(),
            None => format!("{}:{}", self.channel, self.chat_id),
        }
    }
}

/// An outbound message from the agent (or a subagent) to a channel.
#[derive(Clone, Debug)]
pub struct OutboundMessage {
    /// Target channel name.
    pub channel: String,
    /// Target chat/conversation identifier.
    pub chat_id: String,
    /// Session the reply belongs to.
    pub session_key: String,
    /// Text content to send.
    pub content: String,
    /// Id of the inbound message (or parent turn) this answers.
    pub correlation_id: Option<String>,
    /// Set when the content is a truncated or failed result.
    pub partial: bool,
    /// Attached media to send.
    pub media: Vec<MediaAttachment>,
    /// Channel-specific metadata.
    pub metadata: HashMap<String, String>,
}

impl OutboundMessage {
    /// Create a new outbound message.
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let channel = channel.into();
        let chat_id = chat_id.into();
        OutboundMessage {
            session_key: format!("{channel}:{chat_id}"),
            channel,
            chat_id,
            content: content.into(),
            correlation_id: None,
            partial: false,
            media: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// A reply routed back to where `inbound` came from.
    pub fn reply_to(inbound: &InboundMessage, content: impl Into<String>) -> Self {
        OutboundMessage {
            channel: inbound.channel.clone(),
            chat_id: inbound.chat_id.clone(),
            session_key: inbound.session_key(),
            content: content.into(),
            correlation_id: Some(inbound.id.clone()),
            partial: false,
            media: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_partial(mut self, partial: bool) -> Self {
        self.partial = partial;
        self
    }
}
