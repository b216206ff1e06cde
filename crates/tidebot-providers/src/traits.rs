//! LLM Provider trait: the contract every model backend implements.

use async_trait::async_trait;
use tidebot_core::error::ProviderError;
use tidebot_core::types::{LlmResponse, Message, ToolDefinition};

/// Configuration passed to each LLM call.
#[derive(Clone, Debug)]
pub struct LlmRequestConfig {
    /// Maximum tokens to generate.
    pub max_tokens: u32,
    /// Sampling temperature (0.0 to 2.0).
    pub temperature: f64,
}

impl Default for LlmRequestConfig {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            temperature: 0.7,
        }
    }
}

/// Trait that all LLM providers must implement.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a chat request.
    ///
    /// # Arguments
    /// * `messages`: Ordered, role-tagged conversation (possibly multi-modal).
    /// * `tools`: Tool schemas the model may call; empty for none.
    /// * `model`: Model identifier (e.g. `"anthropic/claude-sonnet-4-20250514"`).
    /// * `config`: Temperature, max_tokens, etc.
    ///
    /// # Errors
    /// [`ProviderError::Transport`] for failures worth retrying,
    /// [`ProviderError::Rejected`] for requests the provider refused.
    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        model: &str,
        config: &LlmRequestConfig,
    ) -> Result<LlmResponse, ProviderError>;

    /// The default model for this provider instance.
    fn default_model(&self) -> &str;

    /// Display name for logging.
    fn display_name(&self) -> &str;
}
