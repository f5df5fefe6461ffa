//! Google Gemini adapter over the `generateContent` API.
//!
//! Hand-rolled `reqwest` client. Gemini speaks camelCase JSON, keeps the
//! system prompt in `systemInstruction`, models tools as
//! `functionDeclarations`, and streams via `streamGenerateContent?alt=sse`.

use std::collections::HashMap;

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
    usage_from, ChatMessage, ChatRole, ContentResponse, FunctionCall, Provider, StreamChunk,
    StreamHandler, ToolCall, ToolDefinition,
};

/// Embedded default profile.
const EMBEDDED_PROFILE: &str = include_str!("../../config/gemini.toml");

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_MODEL: &str = "gemini-2.5-flash";

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_call: Option<GeminiFunctionCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_response: Option<GeminiFunctionResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiFunctionCall {
    name: String,
    #[serde(default)]
    args: JsonValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiFunctionResponse {
    name: String,
    response: JsonValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    candidate_count: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FunctionDeclarations {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    description: String,
    parameters: JsonValue,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<FunctionDeclarations>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    #[allow(dead_code)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorResponse {
    error: GeminiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorDetail {
    #[serde(default)]
    code: u16,
    message: String,
}

// ============================================================================
// Provider
// ============================================================================

/// Google Gemini LLM provider.
pub struct GeminiProvider {
    client: Client,
    api_key: String,
    base_url: String,
    config: ProviderConfig,
}

impl GeminiProvider {
    /// Create a provider from already-resolved settings.
    pub fn new(settings: &ProviderSettings) -> Result<Self> {
        if settings.api_key.is_empty() {
            return Err(LlmError::ConfigError(
                "Gemini API key is not set".to_string(),
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

    fn endpoint(&self, model: &str, stream: bool) -> String {
        if stream {
            format!(
                "{}/models/{}:streamGenerateContent?alt=sse&key={}",
                self.base_url, model, self.api_key
            )
        } else {
            format!(
                "{}/models/{}:generateContent?key={}",
                self.base_url, model, self.api_key
            )
        }
    }

    /// Gemini roles are `user`/`model`; system messages ride in
    /// `systemInstruction` and tool results become `functionResponse` parts.
    fn convert_messages(messages: &[ChatMessage]) -> (Option<Content>, Vec<Content>) {
        let mut system_parts = Vec::new();
        let mut contents = Vec::new();

        for msg in messages {
            match msg.role {
                ChatRole::System => system_parts.push(Part {
                    text: Some(msg.content.clone()),
                    ..Default::default()
                }),
                ChatRole::User => contents.push(Content {
                    role: Some("user".to_string()),
                    parts: vec![Part {
                        text: Some(msg.content.clone()),
                        ..Default::default()
                    }],
                }),
                ChatRole::Assistant => {
                    let mut parts = Vec::new();
                    if !msg.content.is_empty() {
                        parts.push(Part {
                            text: Some(msg.content.clone()),
                            ..Default::default()
                        });
                    }
                    if let Some(tool_calls) = &msg.tool_calls {
                        for tc in tool_calls {
                            let args = serde_json::from_str(&tc.function.arguments)
                                .unwrap_or(JsonValue::Null);
                            parts.push(Part {
                                function_call: Some(GeminiFunctionCall {
                                    name: tc.function.name.clone(),
                                    args,
                                }),
                                ..Default::default()
                            });
                        }
                    }
                    if parts.is_empty() {
                        parts.push(Part::default());
                    }
                    contents.push(Content {
                        role: Some("model".to_string()),
                        parts,
                    });
                }
                ChatRole::Tool => {
                    let name = msg.tool_call_id.clone().unwrap_or_default();
                    contents.push(Content {
                        role: Some("user".to_string()),
                        parts: vec![Part {
                            function_response: Some(GeminiFunctionResponse {
                                name,
                                response: json!({"result": msg.content}),
                            }),
                            ..Default::default()
                        }],
                    });
                }
            }
        }

        let system = if system_parts.is_empty() {
            None
        } else {
            Some(Content {
                role: None,
                parts: system_parts,
            })
        };
        (system, contents)
    }

    fn build_request(
        options: &CallOptions,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> GenerateRequest {
        let (system_instruction, contents) = Self::convert_messages(messages);
        let tools = if tools.is_empty() {
            None
        } else {
            Some(vec![FunctionDeclarations {
                function_declarations: tools
                    .iter()
                    .map(|tool| FunctionDeclaration {
                        name: tool.function.name.clone(),
                        description: tool.function.description.clone(),
                        parameters: tool.function.parameters.clone(),
                    })
                    .collect(),
            }])
        };

        GenerateRequest {
            contents,
            system_instruction,
            generation_config: Some(GenerationConfig {
                temperature: options.temperature,
                top_p: options.top_p,
                candidate_count: options.n,
                max_output_tokens: options.max_tokens,
                response_mime_type: if options.json_response {
                    Some("application/json".to_string())
                } else {
                    None
                },
            }),
            tools,
        }
    }

    async fn post(
        &self,
        ctx: &CancellationToken,
        url: String,
        request: &GenerateRequest,
    ) -> Result<reqwest::Response> {
        let send = self.client.post(url).json(request).send();
        let response = tokio::select! {
            _ = ctx.cancelled() => return Err(LlmError::Cancelled),
            result = send => result?,
        };

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            if let Ok(parsed) = serde_json::from_str::<GeminiErrorResponse>(&error_text) {
                return Err(match parsed.error.code {
                    401 | 403 => LlmError::AuthError(parsed.error.message),
                    429 => LlmError::RateLimited(parsed.error.message),
                    400 => LlmError::InvalidRequest(parsed.error.message),
                    404 => LlmError::ModelNotFound(parsed.error.message),
                    _ => LlmError::ApiError(parsed.error.message),
                });
            }
            return Err(LlmError::ApiError(format!("HTTP {}: {}", status, error_text)));
        }
        Ok(response)
    }

    /// Fold one response (or stream chunk) into the accumulating result.
    fn fold_candidate(
        response: &GenerateResponse,
        content: &mut String,
        tool_calls: &mut Vec<ToolCall>,
    ) -> String {
        let mut delta = String::new();
        if let Some(candidate) = response.candidates.first() {
            if let Some(body) = &candidate.content {
                for part in &body.parts {
                    if let Some(text) = &part.text {
                        content.push_str(text);
                        delta.push_str(text);
                    }
                    if let Some(call) = &part.function_call {
                        // Gemini does not assign call ids; synthesize them.
                        tool_calls.push(ToolCall {
                            id: format!("call_{}", tool_calls.len() + 1),
                            call_type: "function".to_string(),
                            function: FunctionCall {
                                name: call.name.clone(),
                                arguments: call.args.to_string(),
                            },
                        });
                    }
                }
            }
        }
        delta
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
        debug!(agent = %agent, model = %options.model, "gemini request");
        let request = Self::build_request(options, messages, tools);

        match handler {
            None => {
                let url = self.endpoint(&options.model, false);
                let response = self.post(ctx, url, &request).await?;
                let parsed: GenerateResponse = response.json().await.map_err(|e| {
                    LlmError::ApiError(format!("Failed to parse response: {}", e))
                })?;

                let mut content = String::new();
                let mut tool_calls = Vec::new();
                Self::fold_candidate(&parsed, &mut content, &mut tool_calls);

                let usage = parsed.usage_metadata.unwrap_or_default();
                Ok(ContentResponse::from_text(content)
                    .with_tool_calls(tool_calls)
                    .with_metadata("promptTokenCount", json!(usage.prompt_token_count))
                    .with_metadata("candidatesTokenCount", json!(usage.candidates_token_count)))
            }
            Some(handler) => {
                let url = self.endpoint(&options.model, true);
                let response = self.post(ctx, url, &request).await?;
                let mut stream = Box::pin(response.bytes_stream());

                let mut buffer = String::new();
                let mut content = String::new();
                let mut tool_calls = Vec::new();
                let mut usage = UsageMetadata::default();

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
                        let Ok(parsed) = serde_json::from_str::<GenerateResponse>(data) else {
                            continue;
                        };
                        let delta = Self::fold_candidate(&parsed, &mut content, &mut tool_calls);
                        if !delta.is_empty() {
                            handler(&StreamChunk::content(delta))?;
                        }
                        if let Some(meta) = parsed.usage_metadata {
                            usage = meta;
                        }
                    }
                }

                Ok(ContentResponse::from_text(content)
                    .with_tool_calls(tool_calls)
                    .with_metadata("promptTokenCount", json!(usage.prompt_token_count))
                    .with_metadata("candidatesTokenCount", json!(usage.candidates_token_count)))
            }
        }
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
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
            &["promptTokenCount", "prompt_token_count"],
            &["candidatesTokenCount", "candidates_token_count"],
        )
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
        assert!(GeminiProvider::new(&ProviderSettings::default()).is_err());
    }

    #[test]
    fn test_assistant_role_maps_to_model() {
        let messages = vec![
            ChatMessage::system("Be brief."),
            ChatMessage::user("Hello"),
            ChatMessage::assistant("Hi"),
        ];
        let (system, contents) = GeminiProvider::convert_messages(&messages);
        assert!(system.is_some());
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[1].role.as_deref(), Some("model"));
    }

    #[test]
    fn test_request_uses_camel_case() {
        let options = CallOptions {
            model: "gemini-2.5-flash".to_string(),
            temperature: Some(0.25),
            top_p: Some(0.5),
            n: Some(1),
            max_tokens: Some(2048),
            reasoning_effort: None,
            json_response: true,
        };
        let request =
            GeminiProvider::build_request(&options, &[ChatMessage::user("hi")], &[]);
        let body = serde_json::to_value(&request).unwrap();
        let config = &body["generationConfig"];
        assert_eq!(config["topP"], 0.5);
        assert_eq!(config["maxOutputTokens"], 2048);
        assert_eq!(config["responseMimeType"], "application/json");
    }

    #[test]
    fn test_tools_become_function_declarations() {
        let options = CallOptions::with_model("gemini-2.5-flash");
        let tools = vec![ToolDefinition::function(
            "get_weather",
            "Get weather",
            json!({"type": "object"}),
        )];
        let request =
            GeminiProvider::build_request(&options, &[ChatMessage::user("hi")], &tools);
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(
            body["tools"][0]["functionDeclarations"][0]["name"],
            "get_weather"
        );
    }

    #[test]
    fn test_fold_candidate_extracts_function_call() {
        let raw = r#"{
            "candidates": [{"content": {"role": "model", "parts": [
                {"text": "Let me check."},
                {"functionCall": {"name": "get_weather", "args": {"city": "Paris"}}}
            ]}}],
            "usageMetadata": {"promptTokenCount": 9, "candidatesTokenCount": 6}
        }"#;
        let parsed: GenerateResponse = serde_json::from_str(raw).unwrap();
        let mut content = String::new();
        let mut tool_calls = Vec::new();
        GeminiProvider::fold_candidate(&parsed, &mut content, &mut tool_calls);
        assert_eq!(content, "Let me check.");
        assert_eq!(tool_calls.len(), 1);
        assert_eq!(tool_calls[0].name(), "get_weather");
    }

    #[test]
    fn test_usage_probing() {
        let provider = GeminiProvider::new(&settings()).unwrap();
        let mut info = HashMap::new();
        info.insert("promptTokenCount".to_string(), json!(9));
        info.insert("candidatesTokenCount".to_string(), json!(6));
        assert_eq!(provider.usage(&info), (9, 6));
    }

    #[test]
    fn test_model_resolution() {
        let provider = GeminiProvider::new(&settings()).unwrap();
        assert_eq!(provider.model(AgentType::Simple), "gemini-2.5-flash");
        assert_eq!(provider.model(AgentType::Coder), "gemini-2.5-pro");
    }
}
