//! Channel Manager: orchestrates channel lifecycle and outbound routing.
//!
//! Responsibilities:
//! - Register channels
//! - Start/stop all channels concurrently via `tokio::spawn`
//! - Dispatch outbound messages from the bus to the channel they name

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use tidebot_core::bus::MessageBus;

use crate::base::Channel;

// ─────────────────────────────────────────────
// ChannelManager
// ─────────────────────────────────────────────

/// Manages the lifecycle and message routing for all chat channels.
///
/// Channels are registered with `register()`, started concurrently with
/// `start_all()`, and stopped with `stop_all()`. The outbound dispatcher
/// runs until the bus closes or a stop is signalled.
pub struct ChannelManager {
    /// Registered channels, keyed by name.
    channels: HashMap<String, Arc<dyn Channel>>,
    bus: Arc<MessageBus>,
    shutdown: Arc<Notify>,
}

impl ChannelManager {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self {
            channels: HashMap::new(),
            bus,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Register a channel. Replaces any previous channel with the same name.
    pub fn register(&mut self, channel: Arc<dyn Channel>) {
        let name = channel.name().to_string();
        info!(channel = %name, "registered channel");
        self.channels.insert(name, channel);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Channel>> {
        self.channels.get(name)
    }

    /// Names of all registered channels, sorted.
    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Start every channel plus the outbound dispatcher.
    ///
    /// Returns once the dispatcher stops: the bus closed, or [`stop_all`](Self::stop_all)
    /// / [`signal_shutdown`](Self::signal_shutdown) was called.
    pub async fn start_all(&self) -> Result<()> {
        if self.channels.is_empty() {
            warn!("no channels registered, nothing to start");
            return Ok(());
        }

        info!(channels = ?self.channel_names(), "starting {} channel(s)", self.channels.len());

        for (name, channel) in &self.channels {
            let ch = channel.clone();
            let ch_name = name.clone();
            tokio::spawn(async move {
                info!(channel = %ch_name, "channel starting");
                if let Err(e) = ch.start().await {
                    error!(channel = %ch_name, error = %e, "channel start failed");
                }
                info!(channel = %ch_name, "channel stopped");
            });
        }

        Self::dispatch_outbound(self.bus.clone(), self.channels.clone(), self.shutdown.clone())
            .await;
        info!("channel manager shutting down");
        Ok(())
    }

    /// Stop the dispatcher and every channel.
    pub async fn stop_all(&self) {
        info!("stopping all channels");
        self.signal_shutdown();

        for (name, channel) in &self.channels {
            debug!(channel = %name, "stopping channel");
            if let Err(e) = channel.stop().await {
                error!(channel = %name, error = %e, "channel stop failed");
            }
        }
        info!("all channels stopped");
    }

    /// Ask the dispatcher to stop without stopping the channels.
    pub fn signal_shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Route outbound messages from the bus to their channel until stopped.
    async fn dispatch_outbound(
        bus: Arc<MessageBus>,
        channels: HashMap<String, Arc<dyn Channel>>,
        shutdown: Arc<Notify>,
    ) {
        info!("outbound dispatcher started");

        loop {
            tokio::select! {
                msg = bus.consume_outbound() => {
                    let Ok(outbound) = msg else {
                        info!("outbound bus closed, dispatcher exiting");
                        break;
                    };
                    debug!(
                        channel = %outbound.channel,
                        chat_id = %outbound.chat_id,
                        correlation_id = outbound.correlation_id.as_deref().unwrap_or("-"),
                        partial = outbound.partial,
                        content_len = outbound.content.len(),
                        "dispatching outbound message"
                    );

                    match channels.get(&outbound.channel) {
                        Some(channel) => {
                            if let Err(e) = channel.send(&outbound).await {
                                error!(
                                    channel = %outbound.channel,
                                    error = %e,
                                    "failed to send outbound message"
                                );
                            }
                        }
                        None => warn!(
                            channel = %outbound.channel,
                            "no channel registered for outbound message"
                        ),
                    }
                }
                _ = shutdown.notified() => {
                    info!("dispatcher received shutdown signal");
                    break;
                }
            }
        }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
