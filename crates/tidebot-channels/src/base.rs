//! Channel trait: the interface every chat adapter implements.
//!
//! Each adapter (Telegram, Discord, a local CLI, ...) implements this trait to:
//! - `start()`: begin listening and publish `InboundMessage`s to the bus
//! - `stop()`: graceful shutdown
//! - `send()`: deliver an outbound message
//! - `name()`: channel identifier matching config keys
//!
//! Adapters gate senders through an [`AllowList`] before anything reaches the bus.

use async_trait::async_trait;
use tracing::warn;

use tidebot_core::bus::types::{InboundMessage, OutboundMessage};
use tidebot_core::bus::MessageBus;
use tidebot_core::error::BusClosed;

/// Every chat channel implements this trait.
///
/// The `ChannelManager` holds `Arc<dyn Channel>` and orchestrates
/// start/stop/send across all registered channels.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Unique channel name (e.g. "telegram", "slack").
    ///
    /// Must match the key used in config and in `OutboundMessage.channel`.
    fn name(&self) -> &str;

    /// Start listening for incoming messages. Long-running.
    async fn start(&self) -> anyhow::Result<()>;

    /// Graceful shutdown: stop listening and clean up resources.
    async fn stop(&self) -> anyhow::Result<()>;

    /// Deliver an outbound message to this channel.
    async fn send(&self, msg: &OutboundMessage) -> anyhow::Result<()>;
}

// ─────────────────────────────────────────────
// Allow-list
// ─────────────────────────────────────────────

/// Which senders a channel accepts.
///
/// Empty means everyone. Otherwise the sender id must equal an entry.
/// Composite ids such as `"12345|alice"` are not split.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AllowList {
    entries: Vec<String>,
}

impl AllowList {
    pub fn new(entries: impl IntoIterator<Item = impl Into<String>>) -> Self {
        AllowList {
            entries: entries.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_unrestricted(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `sender_id` may talk to the agent.
    pub fn is_allowed(&self, sender_id: &str) -> bool {
        self.entries.is_empty() || self.entries.iter().any(|e| e == sender_id)
    }

    /// Publish `msg` if its sender passes the list. Returns whether it was published.
    pub fn admit(&self, bus: &MessageBus, msg: InboundMessage) -> Result<bool, BusClosed> {
        if !self.is_allowed(&msg.sender_id) {
            warn!(
                channel = %msg.channel,
                sender = %msg.sender_id,
                "Dropping message from sender not on the allow-list"
            );
            return Ok(false);
        }
        bus.publish_inbound(msg)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// A mock channel for testing.
    struct MockChannel {
        started: Arc<AtomicBool>,
        stopped: Arc<AtomicBool>,
        sent: Arc<tokio::sync::Mutex<Vec<String>>>,
    }

    impl MockChannel {
        fn new() -> Self {
            Self {
                started: Arc::new(AtomicBool::new(false)),
                stopped: Arc::new(AtomicBool::new(false)),
                sent: Arc::new(tokio::sync::Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl Channel for MockChannel {
        fn name(&self) -> &str {
            "mock"
        }

        async fn start(&self) -> anyhow::Result<()> {
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> anyhow::Result<()> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn send(&self, msg: &OutboundMessage) -> anyhow::Result<()> {
            self.sent.lock().await.push(msg.content.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_mock_channel_lifecycle() {
        let ch = MockChannel::new();
        assert_eq!(ch.name(), "mock");
        ch.start().await.unwrap();
        ch.send(&OutboundMessage::new("mock", "chat_1", "Hello!"))
            .await
            .unwrap();
        ch.stop().await.unwrap();

        assert!(ch.started.load(Ordering::SeqCst));
        assert!(ch.stopped.load(Ordering::SeqCst));
        assert_eq!(*ch.sent.lock().await, vec!["Hello!".to_string()]);
    }

    #[test]
    fn test_allow_list_empty_allows_everyone() {
        let list = AllowList::default();
        assert!(list.is_unrestricted());
        assert!(list.is_allowed("anyone"));
        assert!(list.is_allowed("123|user"));
    }

    #[test]
    fn test_allow_list_exact_match_only() {
        let list = AllowList::new(["123456789", "alice", "42|bob"]);
        assert!(list.is_allowed("123456789"));
        assert!(list.is_allowed("alice"));
        assert!(list.is_allowed("42|bob"));
        assert!(!list.is_allowed("x|alice"));
        assert!(!list.is_allowed("999|alice"));
        assert!(!list.is_allowed("123456789|someone"));
        assert!(!list.is_allowed("42"));
        assert!(!list.is_allowed("000000000"));
        assert!(!list.is_allowed("alice2"));
        assert!(!list.is_allowed("|"));
    }

    #[tokio::test]
    async fn test_admit_publishes_only_allowed() {
        let bus = MessageBus::new();
        let list = AllowList::new(["42"]);

        let denied = InboundMessage::new("telegram", "7", "chat", "let me in");
        assert!(!list.admit(&bus, denied).unwrap());
        assert_eq!(bus.inbound_len(), 0);

        let spoofed = InboundMessage::new("telegram", "7|42", "chat", "me too");
        assert!(!list.admit(&bus, spoofed).unwrap());
        assert_eq!(bus.inbound_len(), 0);

        let allowed = InboundMessage::new("telegram", "42", "chat", "hello");
        assert!(list.admit(&bus, allowed).unwrap());
        assert_eq!(bus.consume_inbound().await.unwrap().content, "hello");
    }

    #[test]
    fn test_admit_after_close() {
        let bus = MessageBus::new();
        bus.close();
        let msg = InboundMessage::new("cli", "me", "direct", "hi");
        assert_eq!(AllowList::default().admit(&bus, msg), Err(BusClosed));
    }
}
