use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// One turn of a clarifier conversation, in chat-completions wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallWire>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool_call_id: String,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain("assistant", content)
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".into(),
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: tool_call_id.into(),
        }
    }

    fn plain(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: String::new(),
        }
    }
}

/// A function the model may call, advertised with every request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolSpec {
    pub fn function(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            kind: "function".into(),
            function: FunctionSpec {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

/// A tool invocation as the model emits it; `arguments` is the raw JSON
/// string from the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallWire {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    pub function: FunctionCallWire,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallWire {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

/// A tool invocation with decoded arguments, handed to the user-supplied
/// handler.
#[derive(Debug, Clone)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: serde_json::Map<String, Value>,
}

/// What one model call produced.
#[derive(Debug, Clone, Default)]
pub struct AssistantTurn {
    pub content: String,
    pub tool_calls: Vec<ToolCallWire>,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("chat request failed: {0}")]
    Http(String),

    #[error("chat endpoint returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed chat response: {0}")]
    BadResponse(String),
}

/// The model call the clarifier depends on. The live implementation is
/// [`HttpChatBackend`]; tests substitute a scripted stub.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatTurn],
        tools: &[ToolSpec],
    ) -> Result<AssistantTurn, BackendError>;
}

/// OpenAI-compatible chat completions client.
pub struct HttpChatBackend {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpChatBackend {
    pub fn new(
        url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client builds with static options");
        Self {
            client,
            url: url.into(),
            model: model.into(),
            api_key,
        }
    }
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallWire>,
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn complete(
        &self,
        messages: &[ChatTurn],
        tools: &[ToolSpec],
    ) -> Result<AssistantTurn, BackendError> {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
        });
        if !tools.is_empty() {
            body["tools"] = serde_json::to_value(tools)
                .map_err(|e| BackendError::BadResponse(e.to_string()))?;
        }

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BackendError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| BackendError::BadResponse(e.to_string()))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::BadResponse("empty choices".into()))?;

        Ok(AssistantTurn {
            content: choice.message.content.unwrap_or_default(),
            tool_calls: choice.message.tool_calls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_turn_wire_shape() {
        let turn = ChatTurn::user("hello");
        let text = serde_json::to_string(&turn).unwrap();
        assert_eq!(text, r#"{"role":"user","content":"hello"}"#);
    }

    #[test]
    fn tool_turn_carries_call_id() {
        let turn = ChatTurn::tool("call_1", "result");
        let text = serde_json::to_string(&turn).unwrap();
        assert!(text.contains("\"tool_call_id\":\"call_1\""));
    }

    #[test]
    fn completion_response_parses_tool_calls() {
        let raw = r#"{
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "lookup", "arguments": "{\"key\":\"k\"}"}
                    }]
                }
            }]
        }"#;
        let parsed: CompletionResponse = serde_json::from_str(raw).unwrap();
        let message = &parsed.choices[0].message;
        assert_eq!(message.content, None);
        assert_eq!(message.tool_calls[0].function.name, "lookup");
    }
}
