//! Tidebot Channels: the boundary between chat platforms and the bus.
//!
//! - **base**: the `Channel` trait every adapter implements, plus the
//!   sender allow-list adapters check before publishing inbound
//! - **manager**: `ChannelManager`, adapter lifecycle and outbound routing

pub mod base;
pub mod manager;

pub use base::{AllowList, Channel};
pub use manager::ChannelManager;
