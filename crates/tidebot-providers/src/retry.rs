//! Retry decorator: wraps any [`LlmProvider`] and retries transport failures
//! with bounded exponential backoff. Rejections are returned immediately.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use tidebot_core::config::schema::RetryConfig;
use tidebot_core::error::ProviderError;
use tidebot_core::types::{LlmResponse, Message, ToolDefinition};

use crate::traits::{LlmProvider, LlmRequestConfig};

/// How often and how patiently to retry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Never less than 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        RetryPolicy {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-indexed): `base * 2^retry`, capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// A provider that retries its inner provider's transport errors.
pub struct RetryProvider {
    inner: Arc<dyn LlmProvider>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for RetryProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryProvider")
            .field("inner", &self.inner.display_name())
            .field("policy", &self.policy)
            .finish()
    }
}

impl RetryProvider {
    pub fn new(inner: Arc<dyn LlmProvider>, policy: RetryPolicy) -> Self {
        RetryProvider { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl LlmProvider for RetryProvider {
    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        model: &str,
        config: &LlmRequestConfig,
    ) -> Result<LlmResponse, ProviderError> {
        let mut attempt = 1;
        loop {
            match self.inner.chat(messages, tools, model, config).await {
                Ok(resp) => return Ok(resp),
                Err(err) if err.is_retryable() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_for(attempt - 1);
                    warn!(
                        provider = self.inner.display_name(),
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying chat request after transport error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn default_model(&self) -> &str {
        self.inner.default_model()
    }

    fn display_name(&self) -> &str {
        self.inner.display_name()
    }
}
