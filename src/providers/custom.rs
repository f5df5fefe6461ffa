//! Generic adapter for any OpenAI-compatible endpoint.
//!
//! Hand-rolled `reqwest` wire for self-hosted gateways (vLLM, LiteLLM,
//! llama.cpp server, corporate proxies) where pulling in the vendor SDK is
//! overkill. Unlike the cloud adapters this one requires a base URL and
//! treats the API key as optional, since local gateways often run open.
//!
//! Some gateways return `reasoning_content` alongside `content`; it is
//! surfaced as the response's reasoning.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ProviderConfig;
use crate::error::{LlmError, Result};
use crate::options::{AgentType, CallOptions};
use crate::providers::{http_client, ProviderKind, ProviderSettings};
use crate::traits::{
    usage_from, ChatMessage, ContentResponse, FunctionCall, Provider, StreamChunk, StreamHandler,
    ToolCall, ToolDefinition,
};

/// Embedded default profile.
const EMBEDDED_PROFILE: &str = include_str!("../../config/custom.toml");

const DEFAULT_MODEL: &str = "default";

// ============================================================================
// Wire Types (OpenAI-compatible format)
// ============================================================================

#[derive(Debug, Serialize)]
struct MessageRequest {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<MessageRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    n: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDefinition>>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    id: Option<String>,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<MessageContent>,
}

#[derive(Debug, Deserialize)]
struct MessageContent {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallResponse>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallResponse {
    id: String,
    function: FunctionCallResponse,
}

#[derive(Debug, Deserialize)]
struct FunctionCallResponse {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: Option<u32>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

// ============================================================================
// Provider
// ============================================================================

/// Generic OpenAI-compatible LLM provider.
#[derive(Debug)]
pub struct CustomProvider {
    client: Client,
    api_key: String,
    base_url: String,
    config: ProviderConfig,
}

impl CustomProvider {
    /// Create a provider from already-resolved settings. A base URL is
    /// required; the API key may be empty for open local gateways.
    pub fn new(settings: &ProviderSettings) -> Result<Self> {
        let base_url = settings
            .base_url
            .clone()
            .ok_or_else(|| {
                LlmError::ConfigError("Custom provider requires a base URL".to_string())
            })?
            .trim_end_matches('/')
            .to_string();
        let default_model = settings.model.as_deref().unwrap_or(DEFAULT_MODEL);
        let config =
            ProviderConfig::load(default_model, EMBEDDED_PROFILE, settings.config.as_deref())?;
        Ok(Self {
            client: http_client(settings)?,
            api_key: settings.api_key.clone(),
            base_url,
            config,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    fn convert_messages(messages: &[ChatMessage]) -> Vec<MessageRequest> {
        messages
            .iter()
            .map(|msg| MessageRequest {
                role: msg.role.as_str().to_string(),
                content: msg.content.clone(),
                tool_call_id: msg.tool_call_id.clone(),
                tool_calls: msg.tool_calls.clone(),
            })
            .collect()
    }

    fn build_request(
        options: &CallOptions,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        stream: bool,
    ) -> ChatRequest {
        ChatRequest {
            model: options.model.clone(),
            messages: Self::convert_messages(messages),
            temperature: options.temperature,
            top_p: options.top_p,
            n: options.n,
            max_tokens: options.max_tokens,
            reasoning_effort: options
                .reasoning_effort
                .map(|effort| effort.as_str().to_string()),
            response_format: if options.json_response {
                Some(ResponseFormat {
                    format_type: "json_object".to_string(),
                })
            } else {
                None
            },
            stream: if stream { Some(true) } else { None },
            tools: if tools.is_empty() {
                None
            } else {
                Some(tools.to_vec())
            },
        }
    }

    async fn post(
        &self,
        ctx: &CancellationToken,
        request: &ChatRequest,
    ) -> Result<reqwest::Response> {
        let mut builder = self.client.post(self.endpoint()).json(request);
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }

        let response = tokio::select! {
            _ = ctx.cancelled() => return Err(LlmError::Cancelled),
            result = builder.send() => result?,
        };

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&error_text)
                .map(|parsed| parsed.error.message)
                .unwrap_or(error_text);
            return Err(match status.as_u16() {
                401 | 403 => LlmError::AuthError(message),
                429 => LlmError::RateLimited(message),
                400 => LlmError::InvalidRequest(message),
                404 => LlmError::ModelNotFound(message),
                _ => LlmError::ApiError(format!("HTTP {}: {}", status, message)),
            });
        }
        Ok(response)
    }

    async fn request(
        &self,
        ctx: &CancellationToken,
        request: ChatRequest,
    ) -> Result<ContentResponse> {
        let response = self.post(ctx, &request).await?;
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::ApiError(format!("Failed to parse response: {}", e)))?;

        let choice = parsed
            .choices
            .first()
            .ok_or_else(|| LlmError::ApiError("No choices in response".to_string()))?;
        let message = choice
            .message
            .as_ref()
            .ok_or_else(|| LlmError::ApiError("Choice carried no message".to_string()))?;

        let tool_calls = message
            .tool_calls
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|tc| ToolCall {
                id: tc.id.clone(),
                call_type: "function".to_string(),
                function: FunctionCall {
                    name: tc.function.name.clone(),
                    arguments: tc.function.arguments.clone(),
                },
            })
            .collect();

        let mut result =
            ContentResponse::from_text(message.content.clone().unwrap_or_default())
                .with_tool_calls(tool_calls);
        result.reasoning = message.reasoning_content.clone().filter(|r| !r.is_empty());
        if let Some(id) = &parsed.id {
            result = result.with_metadata("response_id", json!(id));
        }
        if let Some(usage) = &parsed.usage {
            result = result
                .with_metadata("prompt_tokens", json!(usage.prompt_tokens))
                .with_metadata("completion_tokens", json!(usage.completion_tokens));
        }
        Ok(result)
    }

    async fn request_streaming(
        &self,
        ctx: &CancellationToken,
        request: ChatRequest,
        handler: &StreamHandler,
    ) -> Result<ContentResponse> {
        let response = self.post(ctx, &request).await?;
        let mut stream = Box::pin(response.bytes_stream());

        let mut buffer = String::new();
        let mut content = String::new();
        let mut reasoning = String::new();
        let mut partial_tools: BTreeMap<u32, (String, String, String)> = BTreeMap::new();
        let mut usage: Option<Usage> = None;

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
                if data.trim() == "[DONE]" {
                    continue;
                }
                let Ok(parsed) = serde_json::from_str::<StreamResponse>(data) else {
                    continue;
                };
                if let Some(chunk_usage) = parsed.usage {
                    usage = Some(chunk_usage);
                }
                let Some(delta) = parsed.choices.first().and_then(|c| c.delta.as_ref()) else {
                    continue;
                };
                if let Some(text) = &delta.content {
                    if !text.is_empty() {
                        content.push_str(text);
                        handler(&StreamChunk::content(text.clone()))?;
                    }
                }
                if let Some(text) = &delta.reasoning_content {
                    if !text.is_empty() {
                        reasoning.push_str(text);
                        handler(&StreamChunk {
                            content: String::new(),
                            reasoning: Some(text.clone()),
                        })?;
                    }
                }
                if let Some(tool_chunks) = &delta.tool_calls {
                    for chunk in tool_chunks {
                        let entry = partial_tools.entry(chunk.index.unwrap_or(0)).or_default();
                        if let Some(id) = &chunk.id {
                            entry.0 = id.clone();
                        }
                        if let Some(function) = &chunk.function {
                            if let Some(name) = &function.name {
                                entry.1.push_str(name);
                            }
                            if let Some(arguments) = &function.arguments {
                                entry.2.push_str(arguments);
                            }
                        }
                    }
                }
            }
        }

        let tool_calls = partial_tools
            .into_values()
            .map(|(id, name, arguments)| ToolCall {
                id,
                call_type: "function".to_string(),
                function: FunctionCall { name, arguments },
            })
            .collect();

        let mut result = ContentResponse::from_text(content).with_tool_calls(tool_calls);
        if !reasoning.is_empty() {
            result.reasoning = Some(reasoning);
        }
        if let Some(usage) = usage {
            result = result
                .with_metadata("prompt_tokens", json!(usage.prompt_tokens))
                .with_metadata("completion_tokens", json!(usage.completion_tokens));
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
        debug!(agent = %agent, model = %options.model, "custom endpoint request");
        match handler {
            Some(handler) => {
                let request = Self::build_request(options, messages, tools, true);
                self.request_streaming(ctx, request, handler).await
            }
            None => {
                let request = Self::build_request(options, messages, tools, false);
                self.request(ctx, request).await
            }
        }
    }
}

#[async_trait]
impl Provider for CustomProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Custom
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
        usage_from(
            info,
            &["prompt_tokens", "input_tokens"],
            &["completion_tokens", "output_tokens"],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ReasoningEffort;

    fn settings() -> ProviderSettings {
        ProviderSettings {
            base_url: Some("http://localhost:8000/".to_string()),
            model: Some("qwen2.5:32b".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_requires_base_url() {
        let err = CustomProvider::new(&ProviderSettings::default()).unwrap_err();
        assert!(err.to_string().contains("base URL"));
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let provider = CustomProvider::new(&settings()).unwrap();
        assert_eq!(
            provider.endpoint(),
            "http://localhost:8000/v1/chat/completions"
        );
    }

    #[test]
    fn test_empty_api_key_allowed() {
        assert!(CustomProvider::new(&settings()).is_ok());
    }

    #[test]
    fn test_build_request_serialization() {
        let options = CallOptions {
            model: "qwen2.5:32b".to_string(),
            temperature: Some(0.2),
            top_p: None,
            n: Some(1),
            max_tokens: Some(512),
            reasoning_effort: Some(ReasoningEffort::Low),
            json_response: true,
        };
        let request =
            CustomProvider::build_request(&options, &[ChatMessage::user("hi")], &[], true);
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["model"], "qwen2.5:32b");
        assert_eq!(body["reasoning_effort"], "low");
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["stream"], true);
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn test_stream_delta_parsing() {
        let data = r#"{"choices":[{"delta":{"content":"Hel","reasoning_content":null}}]}"#;
        let parsed: StreamResponse = serde_json::from_str(data).unwrap();
        let delta = parsed.choices[0].delta.as_ref().unwrap();
        assert_eq!(delta.content.as_deref(), Some("Hel"));
    }

    #[test]
    fn test_response_parsing_with_reasoning() {
        let data = r#"{
            "id": "chatcmpl-1",
            "choices": [{"message": {
                "content": "The answer is 4.",
                "reasoning_content": "2 plus 2...",
                "tool_calls": [{"id": "c1", "type": "function",
                    "function": {"name": "calc", "arguments": "{}"}}]
            }}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 9}
        }"#;
        let parsed: ChatResponse = serde_json::from_str(data).unwrap();
        assert_eq!(parsed.usage.as_ref().unwrap().completion_tokens, 9);
        let message = parsed.choices[0].message.as_ref().unwrap();
        assert_eq!(message.reasoning_content.as_deref(), Some("2 plus 2..."));
        assert_eq!(message.tool_calls.as_ref().unwrap()[0].function.name, "calc");
    }

    #[test]
    fn test_usage_probing() {
        let provider = CustomProvider::new(&settings()).unwrap();
        let mut info = HashMap::new();
        info.insert("prompt_tokens".to_string(), json!(5));
        info.insert("completion_tokens".to_string(), json!(9));
        assert_eq!(provider.usage(&info), (5, 9));
    }
}
