//! Anthropic (Claude) adapter over the Messages API.
//!
//! Hand-rolled `reqwest` client: Anthropic keeps the system prompt in a
//! separate field, wraps tool calls in `tool_use`/`tool_result` content
//! blocks, and streams via SSE `content_block_delta` events.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ProviderConfig;
use crate::error::{LlmError, Result};
use crate::options::{AgentType, CallOptions};
use crate::providers::{http_client, ProviderKind, ProviderSettings};
use crate::traits::{
    usage_from, ChatMessage, ChatRole, ContentResponse, FunctionCall, Provider, StreamChunk,
    StreamHandler, ToolCall, ToolDefinition,
};

/// Embedded default profile.
const EMBEDDED_PROFILE: &str = include_str!("../../config/anthropic.toml");

const API_BASE: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";

/// Output cap when the profile sets none; the Messages API requires one.
const FALLBACK_MAX_TOKENS: u32 = 4096;

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: AnthropicContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum AnthropicContent {
    Text(String),
    Blocks(Vec<RequestBlock>),
}

#[derive(Debug, Serialize)]
struct RequestBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    input: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_use_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: JsonValue,
}

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ResponseBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    id: String,
    content: Vec<ResponseBlock>,
    #[allow(dead_code)]
    model: String,
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize, Default)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorResponse {
    error: AnthropicError,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StreamEvent {
    #[serde(rename = "message_start")]
    MessageStart { message: StreamMessageStart },
    #[serde(rename = "content_block_start")]
    ContentBlockStart {
        #[allow(dead_code)]
        index: usize,
        content_block: ResponseBlock,
    },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta {
        #[allow(dead_code)]
        index: usize,
        delta: DeltaBlock,
    },
    #[serde(rename = "content_block_stop")]
    ContentBlockStop {
        #[allow(dead_code)]
        index: usize,
    },
    #[serde(rename = "message_delta")]
    MessageDelta {
        #[serde(default)]
        usage: Option<DeltaUsage>,
    },
    #[serde(rename = "message_stop")]
    MessageStop,
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "error")]
    Error { error: AnthropicError },
}

#[derive(Debug, Deserialize)]
struct StreamMessageStart {
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct DeltaBlock {
    #[serde(rename = "type")]
    delta_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    partial_json: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeltaUsage {
    #[serde(default)]
    output_tokens: u64,
}

// ============================================================================
// Provider
// ============================================================================

/// Anthropic (Claude) LLM provider.
pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    base_url: String,
    config: ProviderConfig,
}

impl AnthropicProvider {
    /// Create a provider from already-resolved settings.
    pub fn new(settings: &ProviderSettings) -> Result<Self> {
        if settings.api_key.is_empty() {
            return Err(LlmError::ConfigError(
                "Anthropic API key is not set".to_string(),
            ));
        }
        let default_model = settings.model.as_deref().unwrap_or(DEFAULT_MODEL);
        let config =
            ProviderConfig::load(default_model, EMBEDDED_PROFILE, settings.config.as_deref())?;
        Ok(Self {
            client: http_client(settings)?,
            api_key: settings.api_key.clone(),
            base_url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| API_BASE.to_string()),
            config,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }

    /// System messages go into the separate `system` field; tool results
    /// become `tool_result` blocks inside a user message.
    fn convert_messages(
        messages: &[ChatMessage],
        json_response: bool,
    ) -> (Option<String>, Vec<AnthropicMessage>) {
        let mut system_parts = Vec::new();
        let mut out = Vec::new();

        for msg in messages {
            match msg.role {
                ChatRole::System => system_parts.push(msg.content.clone()),
                ChatRole::User => out.push(AnthropicMessage {
                    role: "user".to_string(),
                    content: AnthropicContent::Text(msg.content.clone()),
                }),
                ChatRole::Assistant => {
                    if let Some(tool_calls) = &msg.tool_calls {
                        let mut blocks = Vec::new();
                        if !msg.content.is_empty() {
                            blocks.push(RequestBlock {
                                block_type: "text".to_string(),
                                text: Some(msg.content.clone()),
                                id: None,
                                name: None,
                                input: None,
                                tool_use_id: None,
                                content: None,
                            });
                        }
                        for tc in tool_calls {
                            let input = serde_json::from_str(&tc.function.arguments)
                                .unwrap_or(JsonValue::Null);
                            blocks.push(RequestBlock {
                                block_type: "tool_use".to_string(),
                                text: None,
                                id: Some(tc.id.clone()),
                                name: Some(tc.function.name.clone()),
                                input: Some(input),
                                tool_use_id: None,
                                content: None,
                            });
                        }
                        out.push(AnthropicMessage {
                            role: "assistant".to_string(),
                            content: AnthropicContent::Blocks(blocks),
                        });
                    } else {
                        out.push(AnthropicMessage {
                            role: "assistant".to_string(),
                            content: AnthropicContent::Text(msg.content.clone()),
                        });
                    }
                }
                ChatRole::Tool => {
                    let tool_use_id = msg.tool_call_id.clone().unwrap_or_default();
                    out.push(AnthropicMessage {
                        role: "user".to_string(),
                        content: AnthropicContent::Blocks(vec![RequestBlock {
                            block_type: "tool_result".to_string(),
                            text: None,
                            id: None,
                            name: None,
                            input: None,
                            tool_use_id: Some(tool_use_id),
                            content: Some(msg.content.clone()),
                        }]),
                    });
                }
            }
        }

        // The Messages API has no JSON response format knob; steer through
        // the system prompt instead.
        if json_response {
            system_parts.push("Respond only with valid JSON. No prose, no markdown.".to_string());
        }

        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        };
        (system, out)
    }

    fn convert_tools(tools: &[ToolDefinition]) -> Option<Vec<AnthropicTool>> {
        if tools.is_empty() {
            return None;
        }
        Some(
            tools
                .iter()
                .map(|tool| AnthropicTool {
                    name: tool.function.name.clone(),
                    description: tool.function.description.clone(),
                    input_schema: tool.function.parameters.clone(),
                })
                .collect(),
        )
    }

    fn build_request(
        options: &CallOptions,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        stream: bool,
    ) -> MessagesRequest {
        let (system, converted) = Self::convert_messages(messages, options.json_response);
        MessagesRequest {
            model: options.model.clone(),
            max_tokens: options.max_tokens.unwrap_or(FALLBACK_MAX_TOKENS),
            messages: converted,
            system,
            stream: if stream { Some(true) } else { None },
            tools: Self::convert_tools(tools),
            temperature: options.temperature,
            top_p: options.top_p,
        }
    }

    async fn post(
        &self,
        ctx: &CancellationToken,
        request: &MessagesRequest,
    ) -> Result<reqwest::Response> {
        let send = self
            .client
            .post(self.endpoint())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(request)
            .send();

        let response = tokio::select! {
            _ = ctx.cancelled() => return Err(LlmError::Cancelled),
            result = send => result?,
        };

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            if let Ok(parsed) = serde_json::from_str::<AnthropicErrorResponse>(&error_text) {
                return Err(match status.as_u16() {
                    401 | 403 => LlmError::AuthError(parsed.error.message),
                    429 => LlmError::RateLimited(parsed.error.message),
                    400 => LlmError::InvalidRequest(parsed.error.message),
                    _ => LlmError::ApiError(format!(
                        "{}: {}",
                        parsed.error.error_type, parsed.error.message
                    )),
                });
            }
            return Err(LlmError::ApiError(format!("HTTP {}: {}", status, error_text)));
        }
        Ok(response)
    }

    fn parse_response(response: MessagesResponse) -> ContentResponse {
        let mut content = String::new();
        let mut reasoning = String::new();
        let mut tool_calls = Vec::new();

        for block in &response.content {
            match block.block_type.as_str() {
                "text" => {
                    if let Some(text) = &block.text {
                        content.push_str(text);
                    }
                }
                "thinking" => {
                    if let Some(text) = &block.thinking {
                        reasoning.push_str(text);
                    }
                }
                "tool_use" => {
                    if let (Some(id), Some(name)) = (&block.id, &block.name) {
                        tool_calls.push(ToolCall {
                            id: id.clone(),
                            call_type: "function".to_string(),
                            function: FunctionCall {
                                name: name.clone(),
                                arguments: block
                                    .input
                                    .as_ref()
                                    .map(|v| v.to_string())
                                    .unwrap_or_else(|| "{}".to_string()),
                            },
                        });
                    }
                }
                other => debug!("unknown content block type: {}", other),
            }
        }

        let mut result = ContentResponse::from_text(content)
            .with_tool_calls(tool_calls)
            .with_metadata("response_id", json!(response.id))
            .with_metadata("input_tokens", json!(response.usage.input_tokens))
            .with_metadata("output_tokens", json!(response.usage.output_tokens));
        if !reasoning.is_empty() {
            result.reasoning = Some(reasoning);
        }
        result
    }

    /// SSE loop: lines may split across network chunks, so carry a buffer.
    async fn request_streaming(
        &self,
        ctx: &CancellationToken,
        request: MessagesRequest,
        handler: &StreamHandler,
    ) -> Result<ContentResponse> {
        let response = self.post(ctx, &request).await?;
        let mut stream = Box::pin(response.bytes_stream());

        let mut buffer = String::new();
        let mut content = String::new();
        let mut reasoning = String::new();
        let mut input_tokens = 0u64;
        let mut output_tokens = 0u64;
        // (id, name, partial json) of the tool block currently streaming.
        let mut open_tool: Option<(String, String, String)> = None;
        let mut tool_calls: Vec<ToolCall> = Vec::new();

        loop {
            let chunk = tokio::select! {
                _ = ctx.cancelled() => return Err(LlmError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let bytes = chunk?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim().to_string();
                buffer.drain(..=newline);
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                let event = match serde_json::from_str::<StreamEvent>(data) {
                    Ok(event) => event,
                    Err(e) => {
                        debug!("skipping unparseable stream event: {}", e);
                        continue;
                    }
                };
                match event {
                    StreamEvent::MessageStart { message } => {
                        input_tokens = message.usage.input_tokens;
                    }
                    StreamEvent::ContentBlockStart { content_block, .. } => {
                        if content_block.block_type == "tool_use" {
                            open_tool = Some((
                                content_block.id.unwrap_or_default(),
                                content_block.name.unwrap_or_default(),
                                String::new(),
                            ));
                        }
                    }
                    StreamEvent::ContentBlockDelta { delta, .. } => match delta.delta_type.as_str()
                    {
                        "text_delta" => {
                            if let Some(text) = delta.text {
                                content.push_str(&text);
                                handler(&StreamChunk::content(text))?;
                            }
                        }
                        "thinking_delta" => {
                            if let Some(text) = delta.thinking {
                                reasoning.push_str(&text);
                                handler(&StreamChunk {
                                    content: String::new(),
                                    reasoning: Some(text),
                                })?;
                            }
                        }
                        "input_json_delta" => {
                            if let (Some(tool), Some(partial)) =
                                (open_tool.as_mut(), delta.partial_json)
                            {
                                tool.2.push_str(&partial);
                            }
                        }
                        _ => {}
                    },
                    StreamEvent::ContentBlockStop { .. } => {
                        if let Some((id, name, arguments)) = open_tool.take() {
                            let arguments = if arguments.is_empty() {
                                "{}".to_string()
                            } else {
                                arguments
                            };
                            tool_calls.push(ToolCall {
                                id,
                                call_type: "function".to_string(),
                                function: FunctionCall { name, arguments },
                            });
                        }
                    }
                    StreamEvent::MessageDelta { usage } => {
                        if let Some(usage) = usage {
                            output_tokens = usage.output_tokens;
                        }
                    }
                    StreamEvent::MessageStop => break,
                    StreamEvent::Ping => {}
                    StreamEvent::Error { error } => {
                        warn!("stream error: {}", error.message);
                        return Err(LlmError::ApiError(format!(
                            "{}: {}",
                            error.error_type, error.message
                        )));
                    }
                }
            }
        }

        let mut result = ContentResponse::from_text(content)
            .with_tool_calls(tool_calls)
            .with_metadata("input_tokens", json!(input_tokens))
            .with_metadata("output_tokens", json!(output_tokens));
        if !reasoning.is_empty() {
            result.reasoning = Some(reasoning);
        }
        Ok(result)
    }

    async fn dispatch(
        &self,
        ctx: &CancellationToken,
        agent: AgentType,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        handler: Option<&StreamHandler>,
    ) -> Result<ContentResponse> {
        let options = self.config.options_for(agent);
        debug!(agent = %agent, model = %options.model, "anthropic request");
        match handler {
            Some(handler) => {
                let request = Self::build_request(options, messages, tools, true);
                self.request_streaming(ctx, request, handler).await
            }
            None => {
                let request = Self::build_request(options, messages, tools, false);
                let response = self.post(ctx, &request).await?;
                let parsed: MessagesResponse = response.json().await.map_err(|e| {
                    LlmError::ApiError(format!("Failed to parse response: {}", e))
                })?;
                Ok(Self::parse_response(parsed))
            }
        }
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn provider_config(&self) -> &ProviderConfig {
        &self.config
    }

    async fn call_ex(
        &self,
        ctx: &CancellationToken,
        agent: AgentType,
        messages: &[ChatMessage],
        handler: Option<&StreamHandler>,
    ) -> Result<ContentResponse> {
        self.dispatch(ctx, agent, messages, &[], handler).await
    }

    async fn call_with_tools(
        &self,
        ctx: &CancellationToken,
        agent: AgentType,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        handler: Option<&StreamHandler>,
    ) -> Result<ContentResponse> {
        self.dispatch(ctx, agent, messages, tools, handler).await
    }

    fn usage(&self, info: &HashMap<String, JsonValue>) -> (u64, u64) {
        usage_from(info, &["input_tokens"], &["output_tokens"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ProviderSettings {
        ProviderSettings {
            api_key: "test-key".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_requires_api_key() {
        assert!(AnthropicProvider::new(&ProviderSettings::default()).is_err());
    }

    #[test]
    fn test_system_messages_extracted() {
        let messages = vec![
            ChatMessage::system("You are terse."),
            ChatMessage::user("Hi"),
        ];
        let (system, converted) = AnthropicProvider::convert_messages(&messages, false);
        assert_eq!(system.as_deref(), Some("You are terse."));
        assert_eq!(converted.len(), 1);
        assert_eq!(converted[0].role, "user");
    }

    #[test]
    fn test_json_mode_steers_via_system() {
        let messages = vec![ChatMessage::user("Give me data")];
        let (system, _) = AnthropicProvider::convert_messages(&messages, true);
        assert!(system.unwrap().contains("valid JSON"));
    }

    #[test]
    fn test_tool_result_becomes_user_block() {
        let messages = vec![ChatMessage::tool_result("toolu_1", "42")];
        let (_, converted) = AnthropicProvider::convert_messages(&messages, false);
        assert_eq!(converted[0].role, "user");
        let body = serde_json::to_value(&converted[0]).unwrap();
        assert_eq!(body["content"][0]["type"], "tool_result");
        assert_eq!(body["content"][0]["tool_use_id"], "toolu_1");
    }

    #[test]
    fn test_request_serialization() {
        let options = CallOptions {
            model: "claude-3-5-haiku-20241022".to_string(),
            temperature: Some(0.2),
            top_p: None,
            n: None,
            max_tokens: Some(1024),
            reasoning_effort: None,
            json_response: false,
        };
        let request = AnthropicProvider::build_request(
            &options,
            &[ChatMessage::user("hello")],
            &[],
            false,
        );
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["model"], "claude-3-5-haiku-20241022");
        assert_eq!(body["max_tokens"], 1024);
        assert!(body.get("stream").is_none());
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn test_parse_response_with_tool_use() {
        let raw = r#"{
            "id": "msg_1",
            "model": "claude-sonnet-4-5-20250929",
            "content": [
                {"type": "text", "text": "Checking the weather."},
                {"type": "tool_use", "id": "toolu_1", "name": "get_weather",
                 "input": {"city": "Paris"}}
            ],
            "usage": {"input_tokens": 20, "output_tokens": 11}
        }"#;
        let parsed: MessagesResponse = serde_json::from_str(raw).unwrap();
        let response = AnthropicProvider::parse_response(parsed);
        assert_eq!(response.content, "Checking the weather.");
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].name(), "get_weather");
        assert!(response.tool_calls[0].arguments().contains("Paris"));

        let provider = AnthropicProvider::new(&settings()).unwrap();
        assert_eq!(provider.usage(&response.metadata), (20, 11));
    }

    #[test]
    fn test_stream_event_parsing() {
        let data = r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}"#;
        let event: StreamEvent = serde_json::from_str(data).unwrap();
        match event {
            StreamEvent::ContentBlockDelta { delta, .. } => {
                assert_eq!(delta.delta_type, "text_delta");
                assert_eq!(delta.text.as_deref(), Some("Hel"));
            }
            _ => panic!("wrong event"),
        }
    }

    #[test]
    fn test_model_resolution() {
        let provider = AnthropicProvider::new(&settings()).unwrap();
        assert_eq!(
            provider.model(AgentType::Simple),
            "claude-3-5-haiku-20241022"
        );
        assert_eq!(
            provider.model(AgentType::PrimaryAgent),
            "claude-sonnet-4-5-20250929"
        );
    }
}
