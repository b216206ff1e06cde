//! LLM provider layer for Tidebot.
//!
//! # Architecture
//!
//! - [`traits::LlmProvider`]: the provider contract, with typed transport/rejection errors
//! - [`retry::RetryProvider`]: exponential-backoff decorator over any provider
//! - [`http_provider::HttpProvider`]: OpenAI-compatible HTTP client
//! - [`wire`]: conversion between core messages and the OpenAI wire format

pub mod http_provider;
pub mod retry;
pub mod traits;
pub mod wire;

// Re-export main types for convenience
pub use http_provider::HttpProvider;
pub use retry::{RetryPolicy, RetryProvider};
pub use traits::{LlmProvider, LlmRequestConfig};
