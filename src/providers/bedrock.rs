//! AWS Bedrock adapter via the Converse API.
//!
//! The Converse API is model-agnostic: the same request shape works for all
//! Bedrock-hosted models (Anthropic Claude, Amazon Nova, Meta Llama, Mistral,
//! Cohere). Only available when the `bedrock` feature is enabled:
//!
//! ```toml
//! [dependencies]
//! switchboard-llm = { version = "0.4", features = ["bedrock"] }
//! ```
//!
//! Credentials come from a pre-loaded [`aws_config::SdkConfig`] resolved by
//! the caller's environment (standard AWS credential chain).

use std::collections::HashMap;

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_bedrockruntime::types::{
    ContentBlock, ContentBlockDelta, ContentBlockStart, ConversationRole, ConverseOutput,
    ConverseStreamOutput, InferenceConfiguration, Message, SystemContentBlock, Tool,
    ToolConfiguration, ToolInputSchema, ToolResultBlock, ToolResultContentBlock,
    ToolSpecification, ToolUseBlock,
};
use aws_sdk_bedrockruntime::Client;
use aws_smithy_types::Document;
use serde_json::{json, Value as JsonValue};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ProviderConfig;
use crate::error::{LlmError, Result};
use crate::options::{AgentType, CallOptions};
use crate::providers::{ProviderKind, ProviderSettings};
use crate::traits::{
    usage_from, ChatMessage, ChatRole, ContentResponse, FunctionCall, Provider, StreamChunk,
    StreamHandler, ToolCall, ToolDefinition,
};

/// Embedded default profile.
const EMBEDDED_PROFILE: &str = include_str!("../../config/bedrock.toml");

const DEFAULT_MODEL: &str = "anthropic.claude-3-5-sonnet-20241022-v2:0";

/// AWS Bedrock Runtime LLM provider.
pub struct BedrockProvider {
    client: Client,
    config: ProviderConfig,
}

impl BedrockProvider {
    /// Create a provider from a pre-configured AWS SDK config.
    pub fn new(sdk_config: &SdkConfig, settings: &ProviderSettings) -> Result<Self> {
        let default_model = settings.model.as_deref().unwrap_or(DEFAULT_MODEL);
        let config =
            ProviderConfig::load(default_model, EMBEDDED_PROFILE, settings.config.as_deref())?;
        Ok(Self {
            client: Client::new(sdk_config),
            config,
        })
    }

    /// Create a provider resolving AWS credentials from the ambient
    /// environment (standard credential chain).
    pub async fn connect(settings: &ProviderSettings) -> Result<Self> {
        let sdk_config = aws_config::load_from_env().await;
        Self::new(&sdk_config, settings)
    }

    /// Convert a `serde_json::Value` to an `aws_smithy_types::Document`.
    ///
    /// Smithy `Document` does not implement serde traits, so the conversion
    /// is manual.
    fn json_to_document(value: &JsonValue) -> Document {
        match value {
            JsonValue::Null => Document::Null,
            JsonValue::Bool(b) => Document::Bool(*b),
            JsonValue::Number(n) => {
                if let Some(u) = n.as_u64() {
                    Document::Number(aws_smithy_types::Number::PosInt(u))
                } else if let Some(i) = n.as_i64() {
                    Document::Number(aws_smithy_types::Number::NegInt(i))
                } else if let Some(f) = n.as_f64() {
                    Document::Number(aws_smithy_types::Number::Float(f))
                } else {
                    Document::Null
                }
            }
            JsonValue::String(s) => Document::String(s.clone()),
            JsonValue::Array(items) => {
                Document::Array(items.iter().map(Self::json_to_document).collect())
            }
            JsonValue::Object(map) => Document::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::json_to_document(v)))
                    .collect(),
            ),
        }
    }

    fn document_to_json(doc: &Document) -> JsonValue {
        match doc {
            Document::Null => JsonValue::Null,
            Document::Bool(b) => JsonValue::Bool(*b),
            Document::Number(n) => match n {
                aws_smithy_types::Number::PosInt(u) => json!(*u),
                aws_smithy_types::Number::NegInt(i) => json!(*i),
                aws_smithy_types::Number::Float(f) => json!(*f),
            },
            Document::String(s) => JsonValue::String(s.clone()),
            Document::Array(items) => {
                JsonValue::Array(items.iter().map(Self::document_to_json).collect())
            }
            Document::Object(map) => JsonValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::document_to_json(v)))
                    .collect(),
            ),
        }
    }

    /// System messages become system content blocks; tool results become
    /// `ToolResult` blocks inside user messages.
    fn convert_messages(
        messages: &[ChatMessage],
    ) -> Result<(Vec<Message>, Vec<SystemContentBlock>)> {
        let mut out = Vec::new();
        let mut system_blocks = Vec::new();

        for msg in messages {
            match msg.role {
                ChatRole::System => {
                    system_blocks.push(SystemContentBlock::Text(msg.content.clone()));
                }
                ChatRole::User => {
                    let message = Message::builder()
                        .role(ConversationRole::User)
                        .content(ContentBlock::Text(msg.content.clone()))
                        .build()
                        .map_err(|e| {
                            LlmError::ProviderError(format!("Failed to build user message: {e}"))
                        })?;
                    out.push(message);
                }
                ChatRole::Assistant => {
                    let mut builder = Message::builder().role(ConversationRole::Assistant);
                    if !msg.content.is_empty() {
                        builder = builder.content(ContentBlock::Text(msg.content.clone()));
                    }
                    if let Some(tool_calls) = &msg.tool_calls {
                        for tc in tool_calls {
                            let input = serde_json::from_str::<JsonValue>(&tc.function.arguments)
                                .map(|v| Self::json_to_document(&v))
                                .unwrap_or_else(|_| {
                                    Document::String(tc.function.arguments.clone())
                                });
                            let tool_use = ToolUseBlock::builder()
                                .tool_use_id(&tc.id)
                                .name(&tc.function.name)
                                .input(input)
                                .build()
                                .map_err(|e| {
                                    LlmError::ProviderError(format!(
                                        "Failed to build tool use block: {e}"
                                    ))
                                })?;
                            builder = builder.content(ContentBlock::ToolUse(tool_use));
                        }
                    }
                    let message = builder.build().map_err(|e| {
                        LlmError::ProviderError(format!("Failed to build assistant message: {e}"))
                    })?;
                    out.push(message);
                }
                ChatRole::Tool => {
                    let tool_result = ToolResultBlock::builder()
                        .tool_use_id(msg.tool_call_id.clone().unwrap_or_default())
                        .content(ToolResultContentBlock::Text(msg.content.clone()))
                        .build()
                        .map_err(|e| {
                            LlmError::ProviderError(format!(
                                "Failed to build tool result block: {e}"
                            ))
                        })?;
                    let message = Message::builder()
                        .role(ConversationRole::User)
                        .content(ContentBlock::ToolResult(tool_result))
                        .build()
                        .map_err(|e| {
                            LlmError::ProviderError(format!(
                                "Failed to build tool result message: {e}"
                            ))
                        })?;
                    out.push(message);
                }
            }
        }

        Ok((out, system_blocks))
    }

    fn build_inference_config(options: &CallOptions) -> InferenceConfiguration {
        let mut builder = InferenceConfiguration::builder();
        if let Some(max_tokens) = options.max_tokens {
            builder = builder.max_tokens(max_tokens as i32);
        }
        if let Some(temperature) = options.temperature {
            builder = builder.temperature(temperature);
        }
        if let Some(top_p) = options.top_p {
            builder = builder.top_p(top_p);
        }
        builder.build()
    }

    fn build_tool_config(tools: &[ToolDefinition]) -> Result<Option<ToolConfiguration>> {
        if tools.is_empty() {
            return Ok(None);
        }
        let mut builder = ToolConfiguration::builder();
        for tool in tools {
            let schema = Self::json_to_document(&tool.function.parameters);
            let spec = ToolSpecification::builder()
                .name(&tool.function.name)
                .description(&tool.function.description)
                .input_schema(ToolInputSchema::Json(schema))
                .build()
                .map_err(|e| {
                    LlmError::ProviderError(format!("Failed to build tool specification: {e}"))
                })?;
            builder = builder.tools(Tool::ToolSpec(spec));
        }
        let config = builder.build().map_err(|e| {
            LlmError::ProviderError(format!("Failed to build tool configuration: {e}"))
        })?;
        Ok(Some(config))
    }

    fn extract_content(output: &ConverseOutput) -> (String, Vec<ToolCall>) {
        let mut text_parts = Vec::new();
        let mut tool_calls = Vec::new();

        if let ConverseOutput::Message(message) = output {
            for block in message.content() {
                match block {
                    ContentBlock::Text(text) => text_parts.push(text.clone()),
                    ContentBlock::ToolUse(tool_use) => {
                        let arguments = Self::document_to_json(&tool_use.input).to_string();
                        tool_calls.push(ToolCall {
                            id: tool_use.tool_use_id.clone(),
                            call_type: "function".to_string(),
                            function: FunctionCall {
                                name: tool_use.name.clone(),
                                arguments,
                            },
                        });
                    }
                    _ => {}
                }
            }
        }

        (text_parts.join(""), tool_calls)
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
        debug!(agent = %agent, model = %options.model, "bedrock converse request");
        let (bedrock_messages, system_blocks) = Self::convert_messages(messages)?;

        match handler {
            None => {
                let mut request = self.client.converse().model_id(&options.model);
                for message in bedrock_messages {
                    request = request.messages(message);
                }
                for block in system_blocks {
                    request = request.system(block);
                }
                request = request.inference_config(Self::build_inference_config(options));
                if let Some(tool_config) = Self::build_tool_config(tools)? {
                    request = request.tool_config(tool_config);
                }

                let response = tokio::select! {
                    _ = ctx.cancelled() => return Err(LlmError::Cancelled),
                    result = request.send() => result.map_err(|e| {
                        LlmError::ProviderError(format!("Bedrock Converse API error: {e}"))
                    })?,
                };

                let (content, tool_calls) = response
                    .output()
                    .map(Self::extract_content)
                    .unwrap_or_default();
                let (input_tokens, output_tokens) = response
                    .usage()
                    .map(|u| (u.input_tokens() as u64, u.output_tokens() as u64))
                    .unwrap_or((0, 0));

                Ok(ContentResponse::from_text(content)
                    .with_tool_calls(tool_calls)
                    .with_metadata("inputTokens", json!(input_tokens))
                    .with_metadata("outputTokens", json!(output_tokens)))
            }
            Some(handler) => {
                let mut request = self.client.converse_stream().model_id(&options.model);
                for message in bedrock_messages {
                    request = request.messages(message);
                }
                for block in system_blocks {
                    request = request.system(block);
                }
                request = request.inference_config(Self::build_inference_config(options));
                if let Some(tool_config) = Self::build_tool_config(tools)? {
                    request = request.tool_config(tool_config);
                }

                let response = tokio::select! {
                    _ = ctx.cancelled() => return Err(LlmError::Cancelled),
                    result = request.send() => result.map_err(|e| {
                        LlmError::ProviderError(format!("Bedrock ConverseStream API error: {e}"))
                    })?,
                };

                let mut receiver = response.stream;
                let mut content = String::new();
                // (id, name, partial json) of the tool block currently open.
                let mut open_tool: Option<(String, String, String)> = None;
                let mut tool_calls = Vec::new();
                let mut input_tokens = 0u64;
                let mut output_tokens = 0u64;

                loop {
                    let event = tokio::select! {
                        _ = ctx.cancelled() => return Err(LlmError::Cancelled),
                        event = receiver.recv() => event.map_err(|e| {
                            LlmError::ProviderError(format!("Bedrock stream error: {e}"))
                        })?,
                    };
                    let Some(event) = event else { break };

                    match event {
                        ConverseStreamOutput::ContentBlockStart(start_event) => {
                            if let Some(ContentBlockStart::ToolUse(start)) = start_event.start() {
                                open_tool = Some((
                                    start.tool_use_id().to_string(),
                                    start.name().to_string(),
                                    String::new(),
                                ));
                            }
                        }
                        ConverseStreamOutput::ContentBlockDelta(delta_event) => {
                            match delta_event.delta() {
                                Some(ContentBlockDelta::Text(text)) => {
                                    content.push_str(text);
                                    handler(&StreamChunk::content(text.clone()))?;
                                }
                                Some(ContentBlockDelta::ToolUse(tool_delta)) => {
                                    if let Some(tool) = open_tool.as_mut() {
                                        tool.2.push_str(tool_delta.input());
                                    }
                                }
                                _ => {}
                            }
                        }
                        ConverseStreamOutput::ContentBlockStop(_) => {
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
                        ConverseStreamOutput::Metadata(metadata_event) => {
                            if let Some(usage) = metadata_event.usage() {
                                input_tokens = usage.input_tokens() as u64;
                                output_tokens = usage.output_tokens() as u64;
                            }
                        }
                        ConverseStreamOutput::MessageStop(_) => break,
                        _ => {}
                    }
                }

                Ok(ContentResponse::from_text(content)
                    .with_tool_calls(tool_calls)
                    .with_metadata("inputTokens", json!(input_tokens))
                    .with_metadata("outputTokens", json!(output_tokens)))
            }
        }
    }
}

#[async_trait]
impl Provider for BedrockProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Bedrock
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
            &["inputTokens", "input_tokens"],
            &["outputTokens", "output_tokens"],
        )
    }
}
