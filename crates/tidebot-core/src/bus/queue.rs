//! Async message bus connecting channels and the agent loop.
//!
//! Two independent unbounded queues with depth counters. `publish_*` never
//! blocks; `consume_*` waits until an item arrives or the bus is closed.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::types::{InboundMessage, OutboundMessage};
use crate::error::BusClosed;

struct Queue<T> {
    tx: mpsc::UnboundedSender<T>,
    rx: Mutex<mpsc::UnboundedReceiver<T>>,
    depth: AtomicUsize,
}

impl<T> Queue<T> {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Queue {
            tx,
            rx: Mutex::new(rx),
            depth: AtomicUsize::new(0),
        }
    }

    fn publish(&self, item: T, closed: &CancellationToken) -> Result<(), BusClosed> {
        if closed.is_cancelled() {
            return Err(BusClosed);
        }
        self.depth.fetch_add(1, Ordering::SeqCst);
        self.tx.send(item).map_err(|_| {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            BusClosed
        })
    }

    async fn consume(&self, closed: &CancellationToken) -> Result<T, BusClosed> {
        let mut rx = tokio::select! {
            biased;
            _ = closed.cancelled() => return Err(BusClosed),
            rx = self.rx.lock() => rx,
        };
        tokio::select! {
            biased;
            _ = closed.cancelled() => Err(BusClosed),
            item = rx.recv() => match item {
                Some(item) => {
                    self.depth.fetch_sub(1, Ordering::SeqCst);
                    Ok(item)
                }
                None => Err(BusClosed),
            },
        }
    }

    fn len(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}

/// The message bus connecting channels ↔ agent loop.
///
/// - Channels publish to `inbound` (user messages arriving)
/// - Agent loop consumes from `inbound`, processes, publishes to `outbound`
/// - Channel manager consumes from `outbound` and routes to correct channel
///
/// Each queue is FIFO and assumes a single logical consumer. Nothing is
/// ordered across the two queues.
pub struct MessageBus {
    inbound: Queue<InboundMessage>,
    outbound: Queue<OutboundMessage>,
    closed: CancellationToken,
}

impl MessageBus {
    pub fn new() -> Self {
        MessageBus {
            inbound: Queue::new(),
            outbound: Queue::new(),
            closed: CancellationToken::new(),
        }
    }

    /// Publish a message from a channel to the agent (inbound).
    pub fn publish_inbound(&self, msg: InboundMessage) -> Result<(), BusClosed> {
        self.inbound.publish(msg, &self.closed)
    }

    /// Wait for the next inbound message.
    pub async fn consume_inbound(&self) -> Result<InboundMessage, BusClosed> {
        self.inbound.consume(&self.closed).await
    }

    /// Publish a response from the agent to a channel (outbound).
    pub fn publish_outbound(&self, msg: OutboundMessage) -> Result<(), BusClosed> {
        self.outbound.publish(msg, &self.closed)
    }

    /// Wait for the next outbound message.
    pub async fn consume_outbound(&self) -> Result<OutboundMessage, BusClosed> {
        self.outbound.consume(&self.closed).await
    }

    /// Messages published inbound and not yet consumed.
    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    /// Messages published outbound and not yet consumed.
    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    /// Shut the bus down. Waiting and future consumers get [`BusClosed`];
    /// anything still queued is dropped. Idempotent.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            debug!(
                inbound_pending = self.inbound_len(),
                outbound_pending = self.outbound_len(),
                "Closing message bus"
            );
            self.closed.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_inbound_message_flow() {
        let bus = MessageBus::new();

        let msg = InboundMessage::new("telegram", "user_1", "chat_1", "Hello!");
        bus.publish_inbound(msg).unwrap();
        assert_eq!(bus.inbound_len(), 1);

        let received = bus.consume_inbound().await.unwrap();
        assert_eq!(received.content, "Hello!");
        assert_eq!(received.channel, "telegram");
        assert_eq!(bus.inbound_len(), 0);
    }

    #[tokio::test]
    async fn test_outbound_message_flow() {
        let bus = MessageBus::new();

        bus.publish_outbound(OutboundMessage::new("discord", "ch_1", "Response!"))
            .unwrap();
        assert_eq!(bus.outbound_len(), 1);
        assert_eq!(bus.inbound_len(), 0);

        let received = bus.consume_outbound().await.unwrap();
        assert_eq!(received.content, "Response!");
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let bus = MessageBus::new();
        for i in 0..50 {
            bus.publish_inbound(InboundMessage::new("cli", "u", "c", format!("msg {i}")))
                .unwrap();
        }
        for i in 0..50 {
            let msg = bus.consume_inbound().await.unwrap();
            assert_eq!(msg.content, format!("msg {i}"));
        }
    }

    #[tokio::test]
    async fn test_multiple_producers() {
        let bus = Arc::new(MessageBus::new());

        let mut handles = Vec::new();
        for p in 0..4 {
            let bus = bus.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..25 {
                    bus.publish_inbound(InboundMessage::new("p", p.to_string(), "c", i.to_string()))
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(bus.inbound_len(), 100);
        let mut last_per_producer = [-1i32; 4];
        for _ in 0..100 {
            let msg = bus.consume_inbound().await.unwrap();
            let p: usize = msg.sender_id.parse().unwrap();
            let i: i32 = msg.content.parse().unwrap();
            assert!(i > last_per_producer[p], "per-producer order must hold");
            last_per_producer[p] = i;
        }
    }

    #[tokio::test]
    async fn test_close_wakes_pending_consumer() {
        let bus = Arc::new(MessageBus::new());
        let consumer = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.consume_inbound().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.close();

        let result = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer should wake up")
            .unwrap();
        assert_eq!(result.unwrap_err(), BusClosed);
    }

    #[tokio::test]
    async fn test_publish_after_close_fails() {
        let bus = MessageBus::new();
        bus.close();
        bus.close();
        assert!(bus.is_closed());
        assert_eq!(
            bus.publish_inbound(InboundMessage::new("cli", "u", "c", "late")),
            Err(BusClosed)
        );
        assert_eq!(
            bus.publish_outbound(OutboundMessage::new("cli", "c", "late")),
            Err(BusClosed)
        );
        assert_eq!(bus.consume_outbound().await.unwrap_err(), BusClosed);
    }

    #[tokio::test]
    async fn test_queues_are_independent() {
        let bus = MessageBus::new();
        bus.publish_outbound(OutboundMessage::new("cli", "c", "out")).unwrap();

        let waited = tokio::time::timeout(Duration::from_millis(50), bus.consume_inbound()).await;
        assert!(waited.is_err(), "inbound consume must not see outbound items");
        assert_eq!(bus.consume_outbound().await.unwrap().content, "out");
    }
}
