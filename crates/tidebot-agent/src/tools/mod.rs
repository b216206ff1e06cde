//! Tools: the capabilities the model can call.

pub mod base;
pub mod filesystem;
pub mod registry;
pub mod secrets;
pub mod shell;
pub mod spawn;

pub use base::{Capability, SandboxTarget, Tool, ToolArgs, ToolContext};
pub use registry::ToolRegistry;
