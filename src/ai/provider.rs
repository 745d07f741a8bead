//! LLM provider abstraction and an OpenAI-compatible HTTP implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::LlmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Set on assistant turns that requested tools.
    pub tool_calls: Vec<ToolCall>,
    /// Set on tool-result turns.
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    pub fn assistant_with_tool_calls(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::with_role(Role::Assistant, content.unwrap_or_default())
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::with_role(Role::Tool, content)
        }
    }

    fn to_wire(&self) -> Value {
        let mut msg = json!({
            "role": self.role.as_str(),
            "content": self.content,
        });
        if !self.tool_calls.is_empty() {
            msg["tool_calls"] = self
                .tool_calls
                .iter()
                .map(|tc| {
                    json!({
                        "id": tc.id,
                        "type": "function",
                        "function": {
                            "name": tc.name,
                            "arguments": tc.arguments.to_string(),
                        }
                    })
                })
                .collect();
        }
        if let Some(id) = &self.tool_call_id {
            msg["tool_call_id"] = json!(id);
        }
        msg
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ToolUse,
    Other,
}

impl FinishReason {
    fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("stop") => Self::Stop,
            Some("length") => Self::Length,
            Some("tool_calls") | Some("function_call") => Self::ToolUse,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub finish_reason: FinishReason,
}

#[derive(Debug, Clone)]
pub struct ToolCompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: Option<u32>,
}

impl ToolCompletionRequest {
    pub fn new(messages: Vec<ChatMessage>, tools: Vec<ToolDefinition>) -> Self {
        Self {
            messages,
            tools,
            max_tokens: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolCompletionResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub finish_reason: FinishReason,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn model_name(&self) -> &str;

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    async fn complete_with_tools(
        &self,
        request: ToolCompletionRequest,
    ) -> Result<ToolCompletionResponse, LlmError>;
}

/// Connection settings for [`OpenAiCompatibleProvider`].
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: SecretString,
    pub model: String,
    pub timeout: Duration,
}

const PROVIDER: &str = "openai_compatible";

/// Any `/chat/completions` endpoint speaking the OpenAI function-tool dialect.
pub struct OpenAiCompatibleProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    model: String,
}

impl OpenAiCompatibleProvider {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }

    async fn chat(&self, body: Value) -> Result<Value, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!(model = %self.model, url = %url, "Calling LLM API");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let text = resp.text().await.map_err(|e| LlmError::RequestFailed {
            provider: PROVIDER.to_string(),
            reason: format!("Failed to read response body: {e}"),
        })?;

        match status {
            s if s.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(LlmError::AuthFailed {
                    provider: PROVIDER.to_string(),
                });
            }
            StatusCode::TOO_MANY_REQUESTS => {
                warn!(model = %self.model, "LLM rate limited");
                return Err(LlmError::RateLimited {
                    provider: PROVIDER.to_string(),
                    retry_after,
                });
            }
            s => {
                return Err(LlmError::RequestFailed {
                    provider: PROVIDER.to_string(),
                    reason: format!("HTTP {s}: {}", truncate(&text, 500)),
                });
            }
        }

        Ok(serde_json::from_str(&text)?)
    }

    fn base_body(&self, messages: &[ChatMessage], max_tokens: Option<u32>) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": messages.iter().map(ChatMessage::to_wire).collect::<Vec<_>>(),
        });
        if let Some(max) = max_tokens {
            body["max_tokens"] = json!(max);
        }
        body
    }
}

fn usage(data: &Value) -> (u32, u32) {
    let read = |key: &str| {
        data["usage"][key]
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0)
    };
    (read("prompt_tokens"), read("completion_tokens"))
}

fn first_choice(data: &Value) -> Result<&Value, LlmError> {
    data["choices"]
        .get(0)
        .ok_or_else(|| LlmError::InvalidResponse {
            provider: PROVIDER.to_string(),
            reason: "No choices in response".to_string(),
        })
}

/// Parse OpenAI-style `tool_calls`. Arguments arrive as a JSON string; an
/// unparseable string is kept as an empty object.
pub fn parse_tool_calls(message: &Value) -> Vec<ToolCall> {
    message["tool_calls"]
        .as_array()
        .map(|calls| {
            calls
                .iter()
                .map(|tc| {
                    let arguments = match &tc["function"]["arguments"] {
                        Value::String(raw) => {
                            serde_json::from_str(raw).unwrap_or_else(|_| json!({}))
                        }
                        Value::Object(_) => tc["function"]["arguments"].clone(),
                        _ => json!({}),
                    };
                    ToolCall {
                        id: tc["id"].as_str().unwrap_or_default().to_string(),
                        name: tc["function"]["name"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string(),
                        arguments,
                    }
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Cut `text` to at most `max` bytes on a char boundary.
pub fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let mut body = self.base_body(&request.messages, request.max_tokens);
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        let data = self.chat(body).await?;
        let choice = first_choice(&data)?;
        let (input_tokens, output_tokens) = usage(&data);
        Ok(CompletionResponse {
            content: choice["message"]["content"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            input_tokens,
            output_tokens,
            finish_reason: FinishReason::parse(choice["finish_reason"].as_str()),
        })
    }

    async fn complete_with_tools(
        &self,
        request: ToolCompletionRequest,
    ) -> Result<ToolCompletionResponse, LlmError> {
        let mut body = self.base_body(&request.messages, request.max_tokens);
        if !request.tools.is_empty() {
            body["tools"] = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
        }
        let data = self.chat(body).await?;
        let choice = first_choice(&data)?;
        let (input_tokens, output_tokens) = usage(&data);
        Ok(ToolCompletionResponse {
            content: choice["message"]["content"]
                .as_str()
                .map(str::to_string)
                .filter(|c| !c.trim().is_empty()),
            tool_calls: parse_tool_calls(&choice["message"]),
            input_tokens,
            output_tokens,
            finish_reason: FinishReason::parse(choice["finish_reason"].as_str()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_calls_parse_string_arguments() {
        let message = json!({
            "content": null,
            "tool_calls": [{
                "id": "call_1",
                "type": "function",
                "function": { "name": "stage_quote", "arguments": "{\"city\":\"Porto\"}" }
            }, {
                "id": "call_2",
                "function": { "name": "stage_other", "arguments": "not json" }
            }]
        });
        let calls = parse_tool_calls(&message);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "stage_quote");
        assert_eq!(calls[0].arguments["city"], "Porto");
        assert_eq!(calls[1].arguments, json!({}));
    }

    #[test]
    fn assistant_tool_turn_wire_shape() {
        let msg = ChatMessage::assistant_with_tool_calls(
            None,
            vec![ToolCall {
                id: "call_1".into(),
                name: "stage_quote".into(),
                arguments: json!({ "city": "Porto" }),
            }],
        );
        let wire = msg.to_wire();
        assert_eq!(wire["role"], "assistant");
        assert_eq!(wire["tool_calls"][0]["function"]["arguments"], "{\"city\":\"Porto\"}");

        let result = ChatMessage::tool_result("call_1", "ok").to_wire();
        assert_eq!(result["role"], "tool");
        assert_eq!(result["tool_call_id"], "call_1");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "h");
        assert_eq!(truncate("short", 50), "short");
    }

    #[test]
    fn finish_reason_mapping() {
        assert_eq!(FinishReason::parse(Some("tool_calls")), FinishReason::ToolUse);
        assert_eq!(FinishReason::parse(Some("stop")), FinishReason::Stop);
        assert_eq!(FinishReason::parse(None), FinishReason::Other);
    }

    #[test]
    fn provider_reports_model_name() {
        let provider = OpenAiCompatibleProvider::new(&LlmConfig {
            base_url: "https://api.openai.com/v1/".into(),
            api_key: SecretString::from("sk-test"),
            model: "gpt-4o-mini".into(),
            timeout: Duration::from_secs(5),
        })
        .unwrap();
        assert_eq!(provider.model_name(), "gpt-4o-mini");
        assert_eq!(provider.base_url, "https://api.openai.com/v1");
    }
}
