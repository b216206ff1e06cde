//! Error taxonomy shared by the bus, providers, tools and the agent loop.
//!
//! Each kind maps to one propagation policy:
//! - [`BusClosed`] stops consumers and is never retried.
//! - [`ProviderError::Transport`] is retried with backoff; [`ProviderError::Rejected`] is not.
//! - [`ToolError`] is reported back to the model as an observation.
//! - [`TurnError`] ends a turn with a user-visible error reply.

use thiserror::Error;

/// The bus has been shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("message bus closed")]
pub struct BusClosed;

/// Failure surfaced by a model provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// Connection problems, timeouts, rate limits and 5xx responses.
    #[error("provider transport error: {0}")]
    Transport(String),
    /// The provider understood the request and refused it (auth, bad request).
    #[error("provider rejected request: {0}")]
    Rejected(String),
}

impl ProviderError {
    /// Whether a retry could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Transport(_))
    }
}

/// A tool target resolved outside the workspace boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("sandbox violation: '{target}' {reason}")]
pub struct SandboxViolation {
    /// The path or command fragment as the model supplied it.
    pub target: String,
    pub reason: String,
}

/// Failure of a single tool call. Never fatal to the turn.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("invalid arguments for '{tool}': {}", .violations.join("; "))]
    InvalidArguments {
        tool: String,
        violations: Vec<String>,
    },

    #[error(transparent)]
    SandboxViolation(#[from] SandboxViolation),

    #[error("tool '{tool}' timed out after {secs}s")]
    Timeout { tool: String, secs: u64 },

    #[error("tool '{0}' was cancelled")]
    Cancelled(String),

    #[error("error executing {tool}: {message}")]
    Failed { tool: String, message: String },
}

impl ToolError {
    /// Text fed back to the model in place of a tool result.
    pub fn observation(&self) -> String {
        format!("Error: {self}")
    }
}

/// Failure that ends a turn in the terminal error state.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("context build failed: {0}")]
    Context(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("model call timed out after {0}s")]
    Timeout(u64),

    #[error("turn cancelled")]
    Cancelled,
}

impl TurnError {
    /// Stable failure class, used in history markers and logs.
    pub fn class(&self) -> &'static str {
        match self {
            TurnError::Context(_) => "context_unavailable",
            TurnError::Provider(ProviderError::Transport(_)) => "provider_unavailable",
            TurnError::Provider(ProviderError::Rejected(_)) => "provider_rejected",
            TurnError::Timeout(_) => "timeout",
            TurnError::Cancelled => "cancelled",
        }
    }

    /// The sentence shown to the user. Carries no internal detail.
    pub fn user_message(&self) -> &'static str {
        match self {
            TurnError::Context(_) => {
                "Sorry, I couldn't load the state of this conversation. Try /clear if it keeps happening."
            }
            TurnError::Provider(ProviderError::Transport(_)) => {
                "Sorry, the language model is unreachable right now. Please try again in a moment."
            }
            TurnError::Provider(ProviderError::Rejected(_)) => {
                "Sorry, the language model rejected this request."
            }
            TurnError::Timeout(_) => "Sorry, the language model took too long to answer.",
            TurnError::Cancelled => "This request was cancelled before it finished.",
        }
    }
}
