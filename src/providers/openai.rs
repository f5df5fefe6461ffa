//! OpenAI adapter built on the `async-openai` SDK.
//!
//! Also serves any OpenAI-compatible cloud endpoint via the base-URL
//! override in [`ProviderSettings`]. Task kinds resolve to request
//! parameters through the embedded profile (`config/openai.toml`), optionally
//! overlaid by caller-supplied profile bytes.

use std::collections::{BTreeMap, HashMap};

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::{
    ChatCompletionMessageToolCall, ChatCompletionRequestAssistantMessage,
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
    ChatCompletionRequestToolMessage, ChatCompletionRequestUserMessage, ChatCompletionTool,
    ChatCompletionToolType, CreateChatCompletionRequest, FunctionObject,
    ReasoningEffort as SdkReasoningEffort, ResponseFormat,
};
use async_openai::Client;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value as JsonValue};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ProviderConfig;
use crate::error::{LlmError, Result};
use crate::options::{AgentType, CallOptions, ReasoningEffort};
use crate::providers::{ProviderKind, ProviderSettings};
use crate::traits::{
    usage_from, ChatMessage, ChatRole, ContentResponse, FunctionCall, Provider, StreamChunk,
    StreamHandler, ToolCall, ToolDefinition,
};

/// Embedded default profile.
const EMBEDDED_PROFILE: &str = include_str!("../../config/openai.toml");

/// Default model when neither profile nor settings name one.
const DEFAULT_MODEL: &str = "gpt-4o";

/// OpenAI (and OpenAI-compatible) LLM provider.
#[derive(Debug)]
pub struct OpenAiProvider {
    client: Client<OpenAIConfig>,
    config: ProviderConfig,
}

impl OpenAiProvider {
    /// Create a provider from already-resolved settings.
    ///
    /// Fails fast on a missing API key or malformed profile bytes.
    pub fn new(settings: &ProviderSettings) -> Result<Self> {
        if settings.api_key.is_empty() {
            return Err(LlmError::ConfigError(
                "OpenAI API key is not set".to_string(),
            ));
        }

        let mut sdk_config = OpenAIConfig::new().with_api_key(&settings.api_key);
        if let Some(base_url) = &settings.base_url {
            sdk_config = sdk_config.with_api_base(base_url);
        }

        let default_model = settings.model.as_deref().unwrap_or(DEFAULT_MODEL);
        let config =
            ProviderConfig::load(default_model, EMBEDDED_PROFILE, settings.config.as_deref())?;

        Ok(Self {
            client: Client::with_config(sdk_config),
            config,
        })
    }

    /// Convert our message type to the SDK type.
    fn convert_message(msg: &ChatMessage) -> ChatCompletionRequestMessage {
        match msg.role {
            ChatRole::System => {
                ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage {
                    content: async_openai::types::ChatCompletionRequestSystemMessageContent::Text(
                        msg.content.clone(),
                    ),
                    name: None,
                })
            }
            ChatRole::User => ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
                content: async_openai::types::ChatCompletionRequestUserMessageContent::Text(
                    msg.content.clone(),
                ),
                name: None,
            }),
            ChatRole::Assistant => {
                let tool_calls = msg.tool_calls.as_ref().map(|calls| {
                    calls
                        .iter()
                        .map(|tc| ChatCompletionMessageToolCall {
                            id: tc.id.clone(),
                            r#type: ChatCompletionToolType::Function,
                            function: async_openai::types::FunctionCall {
                                name: tc.function.name.clone(),
                                arguments: tc.function.arguments.clone(),
                            },
                        })
                        .collect()
                });

                let content = if msg.content.is_empty() {
                    None
                } else {
                    Some(
                        async_openai::types::ChatCompletionRequestAssistantMessageContent::Text(
                            msg.content.clone(),
                        ),
                    )
                };

                #[allow(deprecated)]
                ChatCompletionRequestMessage::Assistant(ChatCompletionRequestAssistantMessage {
                    content,
                    name: None,
                    tool_calls,
                    refusal: None,
                    audio: None,
                    function_call: None,
                })
            }
            ChatRole::Tool => {
                ChatCompletionRequestMessage::Tool(ChatCompletionRequestToolMessage {
                    content: async_openai::types::ChatCompletionRequestToolMessageContent::Text(
                        msg.content.clone(),
                    ),
                    tool_call_id: msg.tool_call_id.clone().unwrap_or_default(),
                })
            }
        }
    }

    fn convert_tools(tools: &[ToolDefinition]) -> Option<Vec<ChatCompletionTool>> {
        if tools.is_empty() {
            return None;
        }
        Some(
            tools
                .iter()
                .map(|td| ChatCompletionTool {
                    r#type: ChatCompletionToolType::Function,
                    function: FunctionObject {
                        name: td.function.name.clone(),
                        description: Some(td.function.description.clone()),
                        parameters: Some(td.function.parameters.clone()),
                        strict: None,
                    },
                })
                .collect(),
        )
    }

    fn convert_effort(effort: ReasoningEffort) -> SdkReasoningEffort {
        match effort {
            ReasoningEffort::Low => SdkReasoningEffort::Low,
            ReasoningEffort::Medium => SdkReasoningEffort::Medium,
            ReasoningEffort::High => SdkReasoningEffort::High,
        }
    }

    /// Build an SDK request from resolved call options.
    fn build_request(
        options: &CallOptions,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        stream: bool,
    ) -> CreateChatCompletionRequest {
        CreateChatCompletionRequest {
            model: options.model.clone(),
            messages: messages.iter().map(Self::convert_message).collect(),
            temperature: options.temperature,
            top_p: options.top_p,
            n: options.n,
            max_completion_tokens: options.max_tokens,
            reasoning_effort: options.reasoning_effort.map(Self::convert_effort),
            response_format: if options.json_response {
                Some(ResponseFormat::JsonObject)
            } else {
                None
            },
            stream: if stream { Some(true) } else { None },
            tools: Self::convert_tools(tools),
            ..Default::default()
        }
    }

    fn map_error(err: OpenAIError) -> LlmError {
        match err {
            OpenAIError::ApiError(api_err) => {
                let message = api_err.message;
                if message.contains("rate limit") || message.contains("Rate limit") {
                    LlmError::RateLimited(message)
                } else if message.contains("authentication")
                    || message.contains("invalid_api_key")
                    || message.contains("Incorrect API key")
                {
                    LlmError::AuthError(message)
                } else if message.contains("model") && message.contains("not found") {
                    LlmError::ModelNotFound(message)
                } else {
                    LlmError::ApiError(message)
                }
            }
            other => LlmError::ProviderError(other.to_string()),
        }
    }

    /// Non-streaming request path.
    async fn request(
        &self,
        ctx: &CancellationToken,
        request: CreateChatCompletionRequest,
    ) -> Result<ContentResponse> {
        debug!(model = %request.model, "openai request");

        let chat = self.client.chat();
        let response = tokio::select! {
            _ = ctx.cancelled() => return Err(LlmError::Cancelled),
            result = chat.create(request) => result.map_err(Self::map_error)?,
        };

        let choice = response
            .choices
            .first()
            .ok_or_else(|| LlmError::ApiError("No choices in response".to_string()))?;

        let content = choice.message.content.clone().unwrap_or_default();
        let tool_calls = choice
            .message
            .tool_calls
            .as_ref()
            .map(|calls| {
                calls
                    .iter()
                    .map(|tc| ToolCall {
                        id: tc.id.clone(),
                        call_type: "function".to_string(),
                        function: FunctionCall {
                            name: tc.function.name.clone(),
                            arguments: tc.function.arguments.clone(),
                        },
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut result = ContentResponse::from_text(content).with_tool_calls(tool_calls);
        result = result.with_metadata("response_id", json!(response.id));
        if let Some(usage) = &response.usage {
            result = result
                .with_metadata("prompt_tokens", json!(usage.prompt_tokens))
                .with_metadata("completion_tokens", json!(usage.completion_tokens));
        }
        Ok(result)
    }

    /// Streaming request path: every content delta goes through the handler
    /// before the assembled response is returned.
    async fn request_streaming(
        &self,
        ctx: &CancellationToken,
        request: CreateChatCompletionRequest,
        handler: &StreamHandler,
    ) -> Result<ContentResponse> {
        debug!(model = %request.model, "openai streaming request");

        let mut stream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(Self::map_error)?;

        let mut content = String::new();
        // Tool-call deltas arrive fragmented; accumulate them by index.
        let mut partial_tools: BTreeMap<u32, (String, String, String)> = BTreeMap::new();

        loop {
            let item = tokio::select! {
                _ = ctx.cancelled() => return Err(LlmError::Cancelled),
                item = stream.next() => item,
            };
            let Some(item) = item else { break };
            let response = item.map_err(Self::map_error)?;
            let Some(choice) = response.choices.first() else {
                continue;
            };

            if let Some(delta) = &choice.delta.content {
                if !delta.is_empty() {
                    content.push_str(delta);
                    handler(&StreamChunk::content(delta.clone()))?;
                }
            }

            if let Some(tool_chunks) = &choice.delta.tool_calls {
                for chunk in tool_chunks {
                    let entry = partial_tools.entry(chunk.index).or_default();
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

        let tool_calls = partial_tools
            .into_values()
            .map(|(id, name, arguments)| ToolCall {
                id,
                call_type: "function".to_string(),
                function: FunctionCall { name, arguments },
            })
            .collect();

        Ok(ContentResponse::from_text(content).with_tool_calls(tool_calls))
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
impl Provider for OpenAiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
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
