//! Core building blocks for Tidebot: message bus, conversation types,
//! session store, tool audit log, configuration and logging setup.

pub mod audit;
pub mod bus;
pub mod config;
pub mod error;
pub mod logging;
pub mod session;
pub mod types;
pub mod utils;

pub use audit::{AuditLog, ToolCallRecord};
pub use bus::{InboundMessage, MessageBus, OutboundMessage};
pub use error::{BusClosed, ProviderError, SandboxViolation, ToolError, TurnError};
pub use session::{SessionManager, SessionSummary};
