//! Generic HTTP-based LLM provider for OpenAI-compatible APIs.
//!
//! Talks directly to any `/chat/completions` endpoint (OpenAI, OpenRouter,
//! DeepSeek, vLLM, ...) and classifies failures into transport errors and
//! rejections.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use tracing::{debug, error, warn};

use tidebot_core::config::schema::ProviderConfig;
use tidebot_core::error::ProviderError;
use tidebot_core::types::{LlmResponse, Message, ToolDefinition};

use crate::traits::{LlmProvider, LlmRequestConfig};
use crate::wire::{ChatCompletionRequest, ChatCompletionResponse};

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

// ─────────────────────────────────────────────
// HttpProvider
// ─────────────────────────────────────────────

/// A generic LLM provider that talks to any OpenAI-compatible HTTP API.
pub struct HttpProvider {
    /// HTTP client (shared, connection-pooled).
    client: reqwest::Client,
    /// API base URL (e.g. `"https://api.openai.com/v1"`).
    api_base: String,
    /// API key for Bearer authentication.
    api_key: String,
    /// Default model for this provider instance.
    default_model: String,
    /// Extra headers to send with each request.
    extra_headers: HeaderMap,
    /// Send `gpt-4o` for `openai/gpt-4o`.
    strip_model_prefix: bool,
}

impl std::fmt::Debug for HttpProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProvider")
            .field("api_base", &self.api_base)
            .field("default_model", &self.default_model)
            .finish()
    }
}

impl HttpProvider {
    /// Create a provider from the user's config.
    ///
    /// # Arguments
    /// * `config`: api_key, api_base, extra_headers
    /// * `model`: the default model to use
    pub fn new(config: &ProviderConfig, model: &str) -> anyhow::Result<Self> {
        let api_base = config
            .api_base
            .clone()
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());

        let mut extra_headers = HeaderMap::new();
        for (key, value) in config.extra_headers.iter().flatten() {
            match (
                HeaderName::from_bytes(key.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(val)) => {
                    extra_headers.insert(name, val);
                }
                _ => warn!("Invalid header: {}={}", key, value),
            }
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("failed to build HTTP client")?;

        Ok(HttpProvider {
            client,
            api_base,
            api_key: config.api_key.clone(),
            default_model: model.to_string(),
            extra_headers,
            strip_model_prefix: false,
        })
    }

    /// Drop everything up to the first `/` of model ids before sending.
    pub fn with_model_prefix_stripping(mut self, strip: bool) -> Self {
        self.strip_model_prefix = strip;
        self
    }

    /// Build the full chat completions URL.
    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.api_base.trim_end_matches('/'))
    }

    fn resolve_model<'a>(&self, model: &'a str) -> &'a str {
        match model.split_once('/') {
            Some((_, rest)) if self.strip_model_prefix => rest,
            _ => model,
        }
    }
}

/// Sort an HTTP failure into retryable and terminal.
fn classify_status(status: StatusCode, body: &str) -> ProviderError {
    let detail = format!("{status}: {}", body.chars().take(300).collect::<String>());
    match status.as_u16() {
        408 | 409 | 425 | 429 => ProviderError::Transport(detail),
        s if s >= 500 => ProviderError::Transport(detail),
        _ => ProviderError::Rejected(detail),
    }
}

#[async_trait]
impl LlmProvider for HttpProvider {
    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        model: &str,
        config: &LlmRequestConfig,
    ) -> Result<LlmResponse, ProviderError> {
        let resolved_model = self.resolve_model(model);

        debug!(
            model = %resolved_model,
            messages = messages.len(),
            tools = tools.len(),
            "Calling LLM"
        );

        let body = ChatCompletionRequest::new(
            resolved_model,
            messages,
            tools,
            config.max_tokens,
            config.temperature,
        );

        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .headers(self.extra_headers.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP request failed");
                ProviderError::Transport(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string());
            error!(status = %status, body = %error_text, "API error");
            return Err(classify_status(status, &error_text));
        }

        let parsed: ChatCompletionResponse = response.json().await.map_err(|e| {
            error!(error = %e, "Failed to parse LLM response");
            ProviderError::Transport(format!("unreadable response body: {e}"))
        })?;
        let resp = LlmResponse::try_from(parsed)?;

        debug!(
            has_content = resp.content.is_some(),
            tool_calls = resp.tool_calls.len(),
            finish_reason = resp.finish_reason.as_deref().unwrap_or("?"),
            "LLM response received"
        );
        Ok(resp)
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn display_name(&self) -> &str {
        "OpenAI-compatible"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tidebot_core::types::ContentPart;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn make_config(api_key: &str, api_base: Option<&str>) -> ProviderConfig {
        ProviderConfig {
            api_key: api_key.to_string(),
            api_base: api_base.map(String::from),
            ..Default::default()
        }
    }

    fn text_reply(content: &str) -> serde_json::Value {
        serde_json::json!({
            "id": "chatcmpl-test",
            "choices": [{
                "message": { "content": content, "tool_calls": null },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15 }
        })
    }

    // ── Unit tests ──

    #[test]
    fn test_completions_url_trailing_slash() {
        let provider =
            HttpProvider::new(&make_config("key", Some("https://api.example.com/v1/")), "m").unwrap();
        assert_eq!(
            provider.completions_url(),
            "https://api.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn test_default_api_base() {
        let provider = HttpProvider::new(&make_config("key", None), "gpt-4o").unwrap();
        assert_eq!(provider.api_base, DEFAULT_API_BASE);
        assert_eq!(provider.default_model(), "gpt-4o");
    }

    #[test]
    fn test_model_prefix_stripping() {
        let provider = HttpProvider::new(&make_config("key", None), "m").unwrap();
        assert_eq!(provider.resolve_model("opencode/gemini-3"), "opencode/gemini-3");

        let provider = provider.with_model_prefix_stripping(true);
        assert_eq!(provider.resolve_model("opencode/gemini-3"), "gemini-3");
        assert_eq!(provider.resolve_model("gpt-4o"), "gpt-4o");
    }

    #[test]
    fn test_extra_headers() {
        let mut headers = HashMap::new();
        headers.insert("X-App-Code".to_string(), "my-app-code".to_string());
        headers.insert("bad header".to_string(), "x".to_string());
        let config = ProviderConfig {
            api_key: "key".to_string(),
            extra_headers: Some(headers),
            ..Default::default()
        };
        let provider = HttpProvider::new(&config, "gpt-4o").unwrap();
        assert!(provider.extra_headers.contains_key("x-app-code"));
        assert_eq!(provider.extra_headers.len(), 1);
    }

    #[test]
    fn test_classify_status() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_retryable());
        assert!(!classify_status(StatusCode::UNAUTHORIZED, "").is_retryable());
        assert!(!classify_status(StatusCode::BAD_REQUEST, "").is_retryable());
    }

    // ── Integration tests with mock server ──

    #[tokio::test]
    async fn test_chat_success() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("Authorization", "Bearer test-key-123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(text_reply("Hello! I'm Tidebot.")))
            .mount(&mock_server)
            .await;

        let provider =
            HttpProvider::new(&make_config("test-key-123", Some(&mock_server.uri())), "gpt-4o")
                .unwrap();
        let messages = vec![Message::system("You are Tidebot."), Message::user("Hello")];

        let resp = provider
            .chat(&messages, &[], "gpt-4o", &LlmRequestConfig::default())
            .await
            .unwrap();

        assert_eq!(resp.content.as_deref(), Some("Hello! I'm Tidebot."));
        assert!(!resp.has_tool_calls());
        assert_eq!(resp.finish_reason.as_deref(), Some("stop"));
        assert_eq!(resp.usage.as_ref().unwrap().total_tokens, 15);
    }

    #[tokio::test]
    async fn test_chat_with_tool_calls() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(serde_json::json!({
                "tool_choice": "auto",
                "tools": [{"type": "function", "function": {"name": "read_file"}}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{
                    "message": {
                        "content": null,
                        "tool_calls": [{
                            "id": "call_abc123",
                            "type": "function",
                            "function": {
                                "name": "read_file",
                                "arguments": "{\"path\": \"notes.md\"}"
                            }
                        }]
                    },
                    "finish_reason": "tool_calls"
                }]
            })))
            .mount(&mock_server)
            .await;

        let provider =
            HttpProvider::new(&make_config("key", Some(&mock_server.uri())), "gpt-4o").unwrap();
        let tool_def = ToolDefinition::new(
            "read_file",
            "Read a file",
            serde_json::json!({"type": "object", "properties": {"path": {"type": "string"}}}),
        );

        let resp = provider
            .chat(
                &[Message::user("Read my notes")],
                &[tool_def],
                "gpt-4o",
                &LlmRequestConfig::default(),
            )
            .await
            .unwrap();

        assert!(resp.has_tool_calls());
        assert_eq!(resp.tool_calls[0].id, "call_abc123");
        assert_eq!(resp.tool_calls[0].name, "read_file");
        assert_eq!(resp.tool_calls[0].arguments["path"], "notes.md");
    }

    #[tokio::test]
    async fn test_media_is_sent_as_data_uri() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({
                "model": "gpt-4o",
                "messages": [{
                    "role": "user",
                    "content": [
                        {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAA"}},
                        {"type": "text", "text": "describe"}
                    ]
                }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(text_reply("a square")))
            .mount(&mock_server)
            .await;

        let provider = HttpProvider::new(&make_config("key", Some(&mock_server.uri())), "m")
            .unwrap()
            .with_model_prefix_stripping(true);
        let msg = Message::user_parts(vec![
            ContentPart::Media {
                media_type: "image/png".into(),
                data: "AAAA".into(),
            },
            ContentPart::Text {
                text: "describe".into(),
            },
        ]);

        let resp = provider
            .chat(&[msg], &[], "openai/gpt-4o", &LlmRequestConfig::default())
            .await
            .unwrap();
        assert_eq!(resp.content.as_deref(), Some("a square"));
    }

    #[tokio::test]
    async fn test_auth_failure_is_rejected() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
            .mount(&mock_server)
            .await;

        let provider =
            HttpProvider::new(&make_config("bad", Some(&mock_server.uri())), "m").unwrap();
        let err = provider
            .chat(&[Message::user("hi")], &[], "m", &LlmRequestConfig::default())
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::Rejected(ref d) if d.contains("invalid api key")));
    }

    #[tokio::test]
    async fn test_server_error_is_transport() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&mock_server)
            .await;

        let provider = HttpProvider::new(&make_config("k", Some(&mock_server.uri())), "m").unwrap();
        let err = provider
            .chat(&[Message::user("hi")], &[], "m", &LlmRequestConfig::default())
            .await
            .unwrap_err();

        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport() {
        let provider =
            HttpProvider::new(&make_config("k", Some("http://127.0.0.1:1")), "m").unwrap();
        let err = provider
            .chat(&[Message::user("hi")], &[], "m", &LlmRequestConfig::default())
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::Transport(_)));
    }

    #[tokio::test]
    async fn test_garbage_body_is_transport() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>proxy error</html>"))
            .mount(&mock_server)
            .await;

        let provider = HttpProvider::new(&make_config("k", Some(&mock_server.uri())), "m").unwrap();
        let err = provider
            .chat(&[Message::user("hi")], &[], "m", &LlmRequestConfig::default())
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::Transport(_)));
    }
}
