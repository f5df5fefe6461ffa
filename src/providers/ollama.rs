//! Ollama adapter over the native `/api/chat` endpoint.
//!
//! Local inference: no API key, zero prices, long request timeouts. The
//! chat endpoint streams NDJSON (one JSON object per line). Available models
//! are discovered best-effort from `GET /api/tags` at construction; a dead
//! server degrades to the static profile list instead of failing.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{ModelConfig, ModelsConfig, ProviderConfig};
use crate::error::{LlmError, Result};
use crate::options::{AgentType, CallOptions};
use crate::providers::{http_client, ProviderKind, ProviderSettings};
use crate::traits::{
    usage_from, ChatMessage, ContentResponse, FunctionCall, Provider, StreamChunk, StreamHandler,
    ToolCall, ToolDefinition,
};

/// Embedded default profile.
const EMBEDDED_PROFILE: &str = include_str!("../../config/ollama.toml");

const DEFAULT_HOST: &str = "http://localhost:11434";
const DEFAULT_MODEL: &str = "llama3.1:8b";

/// Model discovery is best-effort; keep its timeout short.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Serialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<i32>,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<ChatOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDefinition>>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ResponseToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ResponseToolCall {
    function: ResponseFunction,
}

#[derive(Debug, Deserialize)]
struct ResponseFunction {
    name: String,
    #[serde(default)]
    arguments: JsonValue,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    message: Option<ResponseMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

/// Response from `GET /api/tags`.
#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagInfo>,
}

#[derive(Debug, Deserialize)]
struct TagInfo {
    name: String,
}

// ============================================================================
// Provider
// ============================================================================

/// Ollama LLM provider for local models.
pub struct OllamaProvider {
    client: Client,
    host: String,
    config: ProviderConfig,
    /// Models reported by the running server, when discovery succeeded.
    discovered: Option<ModelsConfig>,
}

impl OllamaProvider {
    /// Create a provider and attempt best-effort model discovery.
    pub async fn connect(settings: &ProviderSettings) -> Result<Self> {
        let mut provider = Self::new(settings)?;
        provider.discovered = provider.discover_models().await;
        Ok(provider)
    }

    /// Create a provider without touching the network.
    pub fn new(settings: &ProviderSettings) -> Result<Self> {
        let default_model = settings.model.as_deref().unwrap_or(DEFAULT_MODEL);
        let config =
            ProviderConfig::load(default_model, EMBEDDED_PROFILE, settings.config.as_deref())?;
        Ok(Self {
            client: http_client(settings)?,
            host: settings
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            config,
            discovered: None,
        })
    }

    /// Query the running server for its installed models.
    async fn discover_models(&self) -> Option<ModelsConfig> {
        let url = format!("{}/api/tags", self.host);
        let response = match self
            .client
            .get(&url)
            .timeout(DISCOVERY_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("Ollama model discovery failed: {}", e);
                return None;
            }
        };
        let tags: TagsResponse = match response.json().await {
            Ok(tags) => tags,
            Err(e) => {
                warn!("Failed to parse Ollama tags response: {}", e);
                return None;
            }
        };
        debug!("Ollama reported {} models", tags.models.len());
        Some(ModelsConfig {
            models: tags
                .models
                .into_iter()
                .map(|tag| ModelConfig {
                    name: tag.name,
                    price: None,
                })
                .collect(),
        })
    }

    fn convert_messages(messages: &[ChatMessage]) -> Vec<OllamaMessage> {
        messages
            .iter()
            .map(|msg| OllamaMessage {
                role: msg.role.as_str().to_string(),
                content: msg.content.clone(),
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
            stream,
            format: if options.json_response {
                Some("json".to_string())
            } else {
                None
            },
            options: Some(ChatOptions {
                temperature: options.temperature,
                top_p: options.top_p,
                num_predict: options.max_tokens.map(|t| t as i32),
            }),
            tools: if tools.is_empty() {
                None
            } else {
                Some(tools.to_vec())
            },
        }
    }

    fn convert_tool_calls(message: &ResponseMessage) -> Vec<ToolCall> {
        message
            .tool_calls
            .as_deref()
            .unwrap_or_default()
            .iter()
            .enumerate()
            .map(|(index, tc)| ToolCall {
                // Ollama does not assign call ids; synthesize them.
                id: format!("call_{}", index + 1),
                call_type: "function".to_string(),
                function: FunctionCall {
                    name: tc.function.name.clone(),
                    arguments: tc.function.arguments.to_string(),
                },
            })
            .collect()
    }

    async fn post(
        &self,
        ctx: &CancellationToken,
        request: &ChatRequest,
    ) -> Result<reqwest::Response> {
        let url = format!("{}/api/chat", self.host);
        let send = self.client.post(&url).json(request).send();
        let response = tokio::select! {
            _ = ctx.cancelled() => return Err(LlmError::Cancelled),
            result = send => result?,
        };
        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(LlmError::ApiError(format!(
                "Ollama API error ({}): {}",
                status, error_text
            )));
        }
        Ok(response)
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
        debug!(agent = %agent, model = %options.model, "ollama request");

        match handler {
            None => {
                let request = Self::build_request(options, messages, tools, false);
                let response = self.post(ctx, &request).await?;
                let parsed: ChatResponse = response.json().await.map_err(|e| {
                    LlmError::ApiError(format!("Failed to parse response: {}", e))
                })?;
                let message = parsed.message.ok_or_else(|| {
                    LlmError::ApiError("Ollama response carried no message".to_string())
                })?;
                let tool_calls = Self::convert_tool_calls(&message);
                let mut result = ContentResponse::from_text(message.content)
                    .with_tool_calls(tool_calls)
                    .with_metadata(
                        "prompt_eval_count",
                        json!(parsed.prompt_eval_count.unwrap_or(0)),
                    )
                    .with_metadata("eval_count", json!(parsed.eval_count.unwrap_or(0)));
                result.reasoning = message.thinking.filter(|t| !t.is_empty());
                Ok(result)
            }
            Some(handler) => {
                let request = Self::build_request(options, messages, tools, true);
                let response = self.post(ctx, &request).await?;
                let mut stream = Box::pin(response.bytes_stream());

                let mut buffer = String::new();
                let mut content = String::new();
                let mut reasoning = String::new();
                let mut tool_calls = Vec::new();
                let mut prompt_tokens = 0u64;
                let mut completion_tokens = 0u64;

                loop {
                    let chunk = tokio::select! {
                        _ = ctx.cancelled() => return Err(LlmError::Cancelled),
                        chunk = stream.next() => chunk,
                    };
                    let Some(chunk) = chunk else { break };
                    let bytes = chunk?;
                    buffer.push_str(&String::from_utf8_lossy(&bytes));

                    // NDJSON: one complete JSON object per line.
                    while let Some(newline) = buffer.find('\n') {
                        let line = buffer[..newline].trim().to_string();
                        buffer.drain(..=newline);
                        if line.is_empty() {
                            continue;
                        }
                        let Ok(parsed) = serde_json::from_str::<ChatResponse>(&line) else {
                            continue;
                        };
                        if let Some(message) = &parsed.message {
                            if !message.content.is_empty() {
                                content.push_str(&message.content);
                                handler(&StreamChunk::content(message.content.clone()))?;
                            }
                            if let Some(thinking) = &message.thinking {
                                if !thinking.is_empty() {
                                    reasoning.push_str(thinking);
                                    handler(&StreamChunk {
                                        content: String::new(),
                                        reasoning: Some(thinking.clone()),
                                    })?;
                                }
                            }
                            tool_calls.extend(Self::convert_tool_calls(message));
                        }
                        if parsed.done {
                            prompt_tokens = parsed.prompt_eval_count.unwrap_or(0);
                            completion_tokens = parsed.eval_count.unwrap_or(0);
                        }
                    }
                }

                let mut result = ContentResponse::from_text(content)
                    .with_tool_calls(tool_calls)
                    .with_metadata("prompt_eval_count", json!(prompt_tokens))
                    .with_metadata("eval_count", json!(completion_tokens));
                if !reasoning.is_empty() {
                    result.reasoning = Some(reasoning);
                }
                Ok(result)
            }
        }
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
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
            &["prompt_eval_count", "prompt_tokens"],
            &["eval_count", "completion_tokens"],
        )
    }

    fn models(&self) -> ModelsConfig {
        match &self.discovered {
            Some(models) if !models.is_empty() => models.clone(),
            _ => self.config.models().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_construction_needs_no_api_key() {
        let provider = OllamaProvider::new(&ProviderSettings::default()).unwrap();
        assert_eq!(provider.host, DEFAULT_HOST);
        assert_eq!(provider.model(AgentType::Simple), "llama3.1:8b");
    }

    #[test]
    fn test_static_models_without_discovery() {
        let provider = OllamaProvider::new(&ProviderSettings::default()).unwrap();
        let models = provider.models();
        assert!(models.get("llama3.1:8b").is_some());
    }

    #[tokio::test]
    async fn test_discovery_failure_degrades_gracefully() {
        // Nothing listens on this port; construction must still succeed.
        let settings = ProviderSettings {
            base_url: Some("http://127.0.0.1:1".to_string()),
            ..Default::default()
        };
        let provider = OllamaProvider::connect(&settings).await.unwrap();
        assert!(provider.discovered.is_none());
        assert!(!provider.models().is_empty());
    }

    #[test]
    fn test_json_mode_sets_format() {
        let options = CallOptions {
            model: "llama3.1:8b".to_string(),
            temperature: Some(0.0),
            top_p: None,
            n: None,
            max_tokens: Some(64),
            reasoning_effort: None,
            json_response: true,
        };
        let request =
            OllamaProvider::build_request(&options, &[ChatMessage::user("hi")], &[], false);
        assert_eq!(request.format.as_deref(), Some("json"));
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["options"]["num_predict"], 64);
    }

    #[test]
    fn test_tool_call_conversion_synthesizes_ids() {
        let message: ResponseMessage = serde_json::from_str(
            r#"{"content": "", "tool_calls": [
                {"function": {"name": "get_weather", "arguments": {"city": "Paris"}}}
            ]}"#,
        )
        .unwrap();
        let calls = OllamaProvider::convert_tool_calls(&message);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert!(calls[0].arguments().contains("Paris"));
    }

    #[test]
    fn test_usage_probing() {
        let provider = OllamaProvider::new(&ProviderSettings::default()).unwrap();
        let mut info = HashMap::new();
        info.insert("prompt_eval_count".to_string(), json!(17));
        info.insert("eval_count".to_string(), json!(23));
        assert_eq!(provider.usage(&info), (17, 23));
    }

    #[test]
    fn test_prices_are_zero_for_local_inference() {
        let provider = OllamaProvider::new(&ProviderSettings::default()).unwrap();
        let price = provider.price_info(AgentType::Simple).unwrap();
        assert_eq!(price.input, 0.0);
        assert_eq!(price.output, 0.0);
    }
}
