//! Tidebot Agent: the orchestration core.
//!
//! This crate contains:
//! - **agent_loop**: the bus consumer that runs one turn per inbound message
//! - **runner**: the request-act-observe loop shared with subagents
//! - **commands**: slash commands answered without the model
//! - **tools**: Tool trait, registry with sandboxing and audit, built-in tools
//! - **context**: the model-facing conversation assembled under a character budget
//! - **subagent**: background child agents with their own tool subset

pub mod agent_loop;
pub mod commands;
pub mod context;
pub mod memory;
pub mod runner;
pub mod sandbox;
pub mod skills;
pub mod subagent;
pub mod tools;

pub use agent_loop::AgentLoop;
pub use commands::{CommandTable, CommandTableError};
pub use context::{ContextBuilder, ContextPayload};
pub use memory::MemoryStore;
pub use runner::{Run, RunOutcome, Runner};
pub use sandbox::Sandbox;
pub use skills::{SkillDescriptor, SkillSource, StaticSkills, WorkspaceSkills};
pub use subagent::{SpawnError, SubagentHandle, SubagentManager, SubagentTask};
pub use tools::{Tool, ToolContext, ToolRegistry};
