//! Deterministic mock provider for harness and adapter testing.
//!
//! Responses are resolved without any network call: exact match on the
//! request text, then first substring match, then a configurable default.
//! Streaming is simulated with fixed-size chunks and a configurable
//! inter-chunk delay; the first chunk carries any configured reasoning
//! content. Tool-aware calls with no canned match synthesize a call to the
//! first declared tool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ProviderConfig;
use crate::error::{LlmError, Result};
use crate::options::AgentType;
use crate::providers::ProviderKind;
use crate::traits::{
    usage_from, ChatMessage, ContentResponse, FunctionCall, Provider, StreamChunk, StreamHandler,
    ToolCall, ToolDefinition,
};

/// Embedded default profile.
const EMBEDDED_PROFILE: &str = include_str!("../../config/mock.toml");

const DEFAULT_MODEL: &str = "mock-model";

/// Canned behavior for a [`MockProvider`].
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Ordered (pattern, response) pairs. Exact match wins over substring.
    pub responses: Vec<(String, String)>,

    /// Returned when nothing matches.
    pub default_response: String,

    /// Streaming chunk size in characters.
    pub chunk_size: usize,

    /// Delay between streamed chunks.
    pub chunk_delay: Duration,

    /// Reasoning content carried on the first streamed chunk.
    pub reasoning: Option<String>,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            responses: Vec::new(),
            default_response: "Mock response".to_string(),
            chunk_size: 16,
            chunk_delay: Duration::ZERO,
            reasoning: None,
        }
    }
}

impl MockBehavior {
    /// Add a canned (pattern, response) pair.
    pub fn with_response(mut self, pattern: impl Into<String>, response: impl Into<String>) -> Self {
        self.responses.push((pattern.into(), response.into()));
        self
    }

    /// Set the fallback response.
    pub fn with_default_response(mut self, response: impl Into<String>) -> Self {
        self.default_response = response.into();
        self
    }

    /// Set streaming chunking parameters.
    pub fn with_chunking(mut self, chunk_size: usize, chunk_delay: Duration) -> Self {
        self.chunk_size = chunk_size.max(1);
        self.chunk_delay = chunk_delay;
        self
    }

    /// Set reasoning content for the first streamed chunk.
    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }
}

/// Deterministic stand-in [`Provider`] with no network dependencies.
pub struct MockProvider {
    behavior: MockBehavior,
    config: ProviderConfig,
    calls: AtomicUsize,
}

impl MockProvider {
    /// Create a mock provider with the given behavior and optional external
    /// profile bytes.
    pub fn new(behavior: MockBehavior, external_config: Option<&[u8]>) -> Result<Self> {
        let config = ProviderConfig::load(DEFAULT_MODEL, EMBEDDED_PROFILE, external_config)?;
        Ok(Self {
            behavior,
            config,
            calls: AtomicUsize::new(0),
        })
    }

    /// Number of provider calls made so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Resolve the canned response for a request text.
    fn lookup(&self, request: &str) -> String {
        if let Some((_, response)) = self
            .behavior
            .responses
            .iter()
            .find(|(pattern, _)| pattern == request)
        {
            return response.clone();
        }
        if let Some((_, response)) = self
            .behavior
            .responses
            .iter()
            .find(|(pattern, _)| request.contains(pattern.as_str()))
        {
            return response.clone();
        }
        self.behavior.default_response.clone()
    }

    /// Effective request text: content of the last non-system message.
    fn request_text(messages: &[ChatMessage]) -> &str {
        messages
            .iter()
            .rev()
            .find(|m| m.role != crate::traits::ChatRole::System)
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }

    /// Stream `text` through the handler in fixed-size chunks, checking the
    /// cancellation token at every chunk boundary.
    async fn stream_chunks(
        &self,
        ctx: &CancellationToken,
        text: &str,
        handler: &StreamHandler,
    ) -> Result<()> {
        let chars: Vec<char> = text.chars().collect();
        for (index, window) in chars.chunks(self.behavior.chunk_size).enumerate() {
            if ctx.is_cancelled() {
                return Err(LlmError::Cancelled);
            }
            if !self.behavior.chunk_delay.is_zero() {
                tokio::select! {
                    _ = ctx.cancelled() => return Err(LlmError::Cancelled),
                    _ = tokio::time::sleep(self.behavior.chunk_delay) => {}
                }
            }
            let chunk = StreamChunk {
                content: window.iter().collect(),
                reasoning: if index == 0 {
                    self.behavior.reasoning.clone()
                } else {
                    None
                },
            };
            handler(&chunk)?;
        }
        Ok(())
    }

    fn response_for(&self, text: String) -> ContentResponse {
        let output_estimate = (text.len() / 4) as u64;
        ContentResponse::from_text(text)
            .with_metadata("input_tokens", json!(8))
            .with_metadata("output_tokens", json!(output_estimate))
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Mock
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
        self.calls.fetch_add(1, Ordering::SeqCst);
        if ctx.is_cancelled() {
            return Err(LlmError::Cancelled);
        }

        let request = Self::request_text(messages);
        let text = self.lookup(request);
        debug!(agent = %agent, request_len = request.len(), "mock call");

        if let Some(handler) = handler {
            self.stream_chunks(ctx, &text, handler).await?;
        }

        Ok(self.response_for(text))
    }

    async fn call_with_tools(
        &self,
        ctx: &CancellationToken,
        agent: AgentType,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        handler: Option<&StreamHandler>,
    ) -> Result<ContentResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if ctx.is_cancelled() {
            return Err(LlmError::Cancelled);
        }

        let request = Self::request_text(messages);
        let matched = self
            .behavior
            .responses
            .iter()
            .any(|(pattern, _)| pattern == request || request.contains(pattern.as_str()));

        // No canned match: pretend the model chose the first declared tool.
        if !matched {
            if let Some(tool) = tools.first() {
                let id = format!("call_{}", self.calls.load(Ordering::SeqCst));
                return Ok(ContentResponse::default()
                    .with_tool_calls(vec![ToolCall {
                        id,
                        call_type: "function".to_string(),
                        function: FunctionCall {
                            name: tool.name().to_string(),
                            arguments: json!({"input": "mock"}).to_string(),
                        },
                    }])
                    .with_metadata("input_tokens", json!(8))
                    .with_metadata("output_tokens", json!(4)));
            }
        }

        let text = self.lookup(request);
        debug!(agent = %agent, tools = tools.len(), "mock tool call");
        if let Some(handler) = handler {
            self.stream_chunks(ctx, &text, handler).await?;
        }
        Ok(self.response_for(text))
    }

    fn usage(&self, info: &HashMap<String, JsonValue>) -> (u64, u64) {
        usage_from(info, &["input_tokens"], &["output_tokens"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn provider(behavior: MockBehavior) -> MockProvider {
        MockProvider::new(behavior, None).unwrap()
    }

    #[tokio::test]
    async fn test_default_response() {
        let mock = provider(MockBehavior::default());
        let ctx = CancellationToken::new();
        let text = mock.call(&ctx, AgentType::Simple, "anything").await.unwrap();
        assert_eq!(text, "Mock response");
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_exact_match_wins_over_substring() {
        let mock = provider(
            MockBehavior::default()
                .with_response("ping", "substring hit")
                .with_response("ping pong", "exact hit"),
        );
        let ctx = CancellationToken::new();
        let text = mock
            .call(&ctx, AgentType::Simple, "ping pong")
            .await
            .unwrap();
        assert_eq!(text, "exact hit");
    }

    #[tokio::test]
    async fn test_substring_match() {
        let mock = provider(MockBehavior::default().with_response("capital", "Paris"));
        let ctx = CancellationToken::new();
        let text = mock
            .call(&ctx, AgentType::Simple, "What is the capital of France?")
            .await
            .unwrap();
        assert_eq!(text, "Paris");
    }

    #[tokio::test]
    async fn test_streaming_chunks_in_order() {
        let mock = provider(
            MockBehavior::default()
                .with_default_response("abcdefghij")
                .with_chunking(4, Duration::ZERO)
                .with_reasoning("thinking"),
        );
        let ctx = CancellationToken::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = {
            let seen = Arc::clone(&seen);
            move |chunk: &StreamChunk| -> Result<()> {
                seen.lock()
                    .unwrap()
                    .push((chunk.content.clone(), chunk.reasoning.clone()));
                Ok(())
            }
        };
        let response = mock
            .call_ex(
                &ctx,
                AgentType::Assistant,
                &[ChatMessage::user("hi")],
                Some(&handler),
            )
            .await
            .unwrap();

        assert_eq!(response.content, "abcdefghij");
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].0, "abcd");
        assert_eq!(seen[0].1.as_deref(), Some("thinking"));
        assert!(seen[1].1.is_none());
        assert_eq!(
            seen.iter().map(|(c, _)| c.as_str()).collect::<String>(),
            "abcdefghij"
        );
    }

    #[tokio::test]
    async fn test_handler_error_aborts_call() {
        let mock = provider(MockBehavior::default().with_chunking(2, Duration::ZERO));
        let ctx = CancellationToken::new();
        let handler = |_chunk: &StreamChunk| -> Result<()> {
            Err(LlmError::Unknown("handler rejected".to_string()))
        };
        let err = mock
            .call_ex(
                &ctx,
                AgentType::Assistant,
                &[ChatMessage::user("hi")],
                Some(&handler),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("handler rejected"));
    }

    #[tokio::test]
    async fn test_cancelled_before_call() {
        let mock = provider(MockBehavior::default());
        let ctx = CancellationToken::new();
        ctx.cancel();
        let err = mock
            .call(&ctx, AgentType::Simple, "anything")
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Cancelled));
    }

    #[tokio::test]
    async fn test_tool_synthesis_on_no_match() {
        let mock = provider(MockBehavior::default());
        let ctx = CancellationToken::new();
        let tools = vec![ToolDefinition::function(
            "get_weather",
            "Get the weather",
            json!({"type": "object", "properties": {"city": {"type": "string"}}}),
        )];
        let response = mock
            .call_with_tools(
                &ctx,
                AgentType::PrimaryAgent,
                &[ChatMessage::user("weather in Paris?")],
                &tools,
                None,
            )
            .await
            .unwrap();
        assert!(response.has_tool_calls());
        assert_eq!(response.tool_calls[0].name(), "get_weather");
        let args: JsonValue = serde_json::from_str(response.tool_calls[0].arguments()).unwrap();
        assert!(args.is_object());
    }

    #[tokio::test]
    async fn test_canned_match_beats_tool_synthesis() {
        let mock = provider(MockBehavior::default().with_response("weather", "It is sunny."));
        let ctx = CancellationToken::new();
        let tools = vec![ToolDefinition::function("get_weather", "", json!({}))];
        let response = mock
            .call_with_tools(
                &ctx,
                AgentType::PrimaryAgent,
                &[ChatMessage::user("weather in Paris?")],
                &tools,
                None,
            )
            .await
            .unwrap();
        assert!(!response.has_tool_calls());
        assert_eq!(response.content, "It is sunny.");
    }

    #[tokio::test]
    async fn test_usage_probing() {
        let mock = provider(MockBehavior::default());
        let ctx = CancellationToken::new();
        let response = mock
            .call_ex(&ctx, AgentType::Simple, &[ChatMessage::user("hi")], None)
            .await
            .unwrap();
        let (input, output) = mock.usage(&response.metadata);
        assert_eq!(input, 8);
        assert_eq!(output, (mock.behavior.default_response.len() / 4) as u64);
    }

    #[test]
    fn test_model_resolution() {
        let mock = provider(MockBehavior::default());
        assert_eq!(mock.model(AgentType::Simple), "mock-model");
        // Unmapped agents resolve through the default section.
        assert_eq!(mock.model(AgentType::Pentester), "mock-model");
        assert!(
            mock.provider_config()
                .options_for(AgentType::SimpleJson)
                .json_response
        );
    }
}
