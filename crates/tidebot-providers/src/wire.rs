//! OpenAI chat-completions wire format.
//!
//! Core messages are provider-neutral; this module renders them into the
//! JSON shape of `/chat/completions` and parses the response back.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use tidebot_core::error::ProviderError;
use tidebot_core::types::{
    ContentPart, LlmResponse, Message, MessageContent, ToolCall, ToolDefinition, UsageInfo,
};

// ─────────────────────────────────────────────
// Request
// ─────────────────────────────────────────────

/// Request body for an OpenAI-compatible chat completion API.
#[derive(Debug, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
    pub max_tokens: u32,
    pub temperature: f64,
}

impl ChatCompletionRequest {
    pub fn new(
        model: &str,
        messages: &[Message],
        tools: &[ToolDefinition],
        max_tokens: u32,
        temperature: f64,
    ) -> Self {
        let tools = (!tools.is_empty()).then(|| tools.iter().map(tool_to_wire).collect());
        ChatCompletionRequest {
            model: model.to_string(),
            messages: messages.iter().map(message_to_wire).collect(),
            tool_choice: tools.as_ref().map(|_| "auto".to_string()),
            tools,
            max_tokens,
            temperature,
        }
    }
}

/// Render one message in OpenAI form.
pub fn message_to_wire(msg: &Message) -> Value {
    match msg {
        Message::System { content } => json!({"role": "system", "content": content}),
        Message::User { content } => json!({"role": "user", "content": content_to_wire(content)}),
        Message::Assistant {
            content, tool_calls, ..
        } => {
            let mut obj = json!({
                "role": "assistant",
                "content": content.clone().unwrap_or_default(),
            });
            if !tool_calls.is_empty() {
                obj["tool_calls"] = tool_calls.iter().map(tool_call_to_wire).collect();
            }
            obj
        }
        Message::Tool {
            tool_call_id,
            name,
            content,
            ..
        } => json!({
            "role": "tool",
            "tool_call_id": tool_call_id,
            "name": name,
            "content": content,
        }),
    }
}

fn content_to_wire(content: &MessageContent) -> Value {
    match content {
        MessageContent::Text(text) => Value::String(text.clone()),
        MessageContent::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => json!({"type": "text", "text": text}),
                ContentPart::Media { media_type, data } if media_type.starts_with("image/") => {
                    json!({
                        "type": "image_url",
                        "image_url": {"url": format!("data:{media_type};base64,{data}")},
                    })
                }
                ContentPart::Media { media_type, .. } => {
                    json!({"type": "text", "text": format!("[attachment: {media_type}]")})
                }
            })
            .collect(),
    }
}

fn tool_call_to_wire(call: &ToolCall) -> Value {
    json!({
        "id": call.id,
        "type": "function",
        "function": {
            "name": call.name,
            "arguments": call.arguments.to_string(),
        },
    })
}

fn tool_to_wire(def: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": def.name,
            "description": def.description,
            "parameters": def.parameters,
        },
    })
}

// ─────────────────────────────────────────────
// Response
// ─────────────────────────────────────────────

/// Raw chat completion response from an OpenAI-compatible API.
#[derive(Debug, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
    pub usage: Option<UsageInfo>,
}

#[derive(Debug, Deserialize)]
pub struct ChatChoice {
    pub message: WireAssistant,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WireAssistant {
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
pub struct WireToolCall {
    pub id: String,
    pub function: WireFunction,
}

#[derive(Debug, Deserialize)]
pub struct WireFunction {
    pub name: String,
    /// JSON-encoded arguments string.
    #[serde(default)]
    pub arguments: String,
}

impl TryFrom<ChatCompletionResponse> for LlmResponse {
    type Error = ProviderError;

    fn try_from(resp: ChatCompletionResponse) -> Result<Self, Self::Error> {
        let choice = resp
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Transport("response contained no choices".into()))?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|c| ToolCall::new(c.id, c.function.name, decode_arguments(c.function.arguments)))
            .collect();

        Ok(LlmResponse {
            content: choice.message.content.filter(|c| !c.is_empty()),
            tool_calls,
            finish_reason: choice.finish_reason,
            usage: resp.usage,
        })
    }
}

/// Malformed JSON is kept as a raw string, which argument validation rejects.
fn decode_arguments(raw: String) -> Value {
    if raw.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(&raw).unwrap_or(Value::String(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidebot_core::types::{ToolOutcome, TurnMarker};

    #[test]
    fn test_user_text_to_wire() {
        let wire = message_to_wire(&Message::user("hello"));
        assert_eq!(wire, json!({"role": "user", "content": "hello"}));
    }

    #[test]
    fn test_media_becomes_data_uri() {
        let msg = Message::user_parts(vec![
            ContentPart::Media {
                media_type: "image/png".into(),
                data: "AAAA".into(),
            },
            ContentPart::Media {
                media_type: "application/pdf".into(),
                data: "BBBB".into(),
            },
            ContentPart::Text {
                text: "what is this?".into(),
            },
        ]);
        let wire = message_to_wire(&msg);
        assert_eq!(wire["content"][0]["type"], "image_url");
        assert_eq!(wire["content"][0]["image_url"]["url"], "data:image/png;base64,AAAA");
        assert_eq!(wire["content"][1]["text"], "[attachment: application/pdf]");
        assert_eq!(wire["content"][2]["text"], "what is this?");
    }

    #[test]
    fn test_assistant_tool_calls_to_wire() {
        let msg = Message::assistant_tool_calls(
            None,
            vec![ToolCall::new("call_1", "read_file", json!({"path": "a.md"}))],
        );
        let wire = message_to_wire(&msg);
        assert_eq!(wire["content"], "");
        assert_eq!(wire["tool_calls"][0]["type"], "function");
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "read_file");
        let args: Value =
            serde_json::from_str(wire["tool_calls"][0]["function"]["arguments"].as_str().unwrap())
                .unwrap();
        assert_eq!(args["path"], "a.md");
    }

    #[test]
    fn test_marker_is_not_sent() {
        let wire = message_to_wire(&Message::assistant_marked("cut short", TurnMarker::Truncated));
        assert!(wire.get("marker").is_none());
        assert_eq!(wire["content"], "cut short");
    }

    #[test]
    fn test_tool_result_to_wire() {
        let wire = message_to_wire(&Message::tool_result(
            "call_1",
            "exec",
            "done",
            ToolOutcome::Error,
        ));
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_call_id"], "call_1");
        assert!(wire.get("outcome").is_none());
    }

    #[test]
    fn test_request_without_tools_omits_tool_choice() {
        let req = ChatCompletionRequest::new("gpt-4o", &[Message::user("hi")], &[], 100, 0.5);
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("tools").is_none());
        assert!(json.get("tool_choice").is_none());

        let tools = [ToolDefinition::new("exec", "run", json!({"type": "object"}))];
        let req = ChatCompletionRequest::new("gpt-4o", &[Message::user("hi")], &tools, 100, 0.5);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["tool_choice"], "auto");
        assert_eq!(json["tools"][0]["function"]["name"], "exec");
    }

    #[test]
    fn test_response_parsing() {
        let raw = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [
                        {"id": "c1", "type": "function", "function": {"name": "exec", "arguments": "{\"command\":\"ls\"}"}},
                        {"id": "c2", "type": "function", "function": {"name": "list_dir", "arguments": ""}},
                        {"id": "c3", "type": "function", "function": {"name": "read_file", "arguments": "{oops"}}
                    ]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 1, "completion_tokens": 2, "total_tokens": 3}
        });
        let resp: ChatCompletionResponse = serde_json::from_value(raw).unwrap();
        let resp = LlmResponse::try_from(resp).unwrap();

        assert!(resp.content.is_none());
        assert_eq!(resp.tool_calls.len(), 3);
        assert_eq!(resp.tool_calls[0].arguments["command"], "ls");
        assert_eq!(resp.tool_calls[1].arguments, json!({}));
        assert_eq!(resp.tool_calls[2].arguments, Value::String("{oops".into()));
        assert_eq!(resp.usage.unwrap().total_tokens, 3);
    }

    #[test]
    fn test_no_choices_is_transport_error() {
        let resp: ChatCompletionResponse = serde_json::from_value(json!({"choices": []})).unwrap();
        assert!(matches!(
            LlmResponse::try_from(resp),
            Err(ProviderError::Transport(_))
        ));
    }
}
