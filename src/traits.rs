//! The provider contract and the shared message/tool/response model.
//!
//! Every vendor adapter implements [`Provider`], translating a task kind into
//! vendor-specific call options and normalizing the vendor's raw usage
//! payload into token counts. Vendor SDK specifics stay entirely inside each
//! implementation; nothing vendor-shaped leaks through this module.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use crate::config::{ModelsConfig, PriceInfo, ProviderConfig};
use crate::error::Result;
use crate::options::AgentType;
use crate::providers::ProviderKind;

// ============================================================================
// Function/Tool Calling Types
// ============================================================================

/// Definition of a tool that the model can call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Type of tool (always "function" for function tools).
    #[serde(rename = "type")]
    pub tool_type: String,

    /// Function definition.
    pub function: FunctionDefinition,
}

impl ToolDefinition {
    /// Create a new function tool definition.
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: JsonValue,
    ) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }

    /// Name of the underlying function.
    pub fn name(&self) -> &str {
        &self.function.name
    }
}

/// Definition of a function that can be called by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    /// Name of the function.
    pub name: String,

    /// Description of what the function does.
    pub description: String,

    /// JSON Schema defining the function parameters.
    pub parameters: JsonValue,
}

/// A tool call request from the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier for this tool call.
    pub id: String,

    /// Type of tool (always "function").
    #[serde(rename = "type")]
    pub call_type: String,

    /// Function call details.
    pub function: FunctionCall,
}

impl ToolCall {
    /// Get the function name.
    pub fn name(&self) -> &str {
        &self.function.name
    }

    /// Get the raw arguments string.
    pub fn arguments(&self) -> &str {
        &self.function.arguments
    }
}

/// Details of a function call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Name of the function to call.
    pub name: String,

    /// JSON-encoded arguments for the function.
    pub arguments: String,
}

// ============================================================================
// Chat Messages
// ============================================================================

/// Role of a chat message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// System message for setting context.
    System,
    /// User input message.
    User,
    /// Assistant response message.
    Assistant,
    /// Tool/function result message.
    Tool,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::Tool => "tool",
        }
    }
}

/// A message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role of the message sender.
    pub role: ChatRole,

    /// Content of the message.
    pub content: String,

    /// Tool calls made by the assistant (only for assistant role).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,

    /// Tool call ID this message is responding to (only for tool role).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Create an assistant message with tool calls.
    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
            tool_call_id: None,
        }
    }

    /// Create a tool response message.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: content.into(),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

// ============================================================================
// Responses and Streaming
// ============================================================================

/// Structured result of a multi-turn or tool-aware call.
///
/// Adapters record their vendor's raw usage-accounting fields in `metadata`
/// under the vendor's own key names; [`Provider::usage`] probes those keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentResponse {
    /// Generated text content (may be empty when the model chose tools).
    pub content: String,

    /// Tool calls requested by the model (if any).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// Reasoning/thinking content, when the model exposes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,

    /// Vendor-specific response metadata, including raw usage fields.
    #[serde(default)]
    pub metadata: HashMap<String, JsonValue>,
}

impl ContentResponse {
    /// Create a text-only response.
    pub fn from_text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    /// Add tool calls to the response.
    pub fn with_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.tool_calls = calls;
        self
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Check if the response has tool calls.
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// One streamed increment of a response.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    /// Incremental content text.
    pub content: String,

    /// Reasoning text carried with this chunk, if any.
    pub reasoning: Option<String>,
}

impl StreamChunk {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content: text.into(),
            reasoning: None,
        }
    }
}

/// Caller-supplied streaming callback, invoked synchronously once per chunk,
/// in order, before the call returns. A returned error aborts the in-flight
/// call and becomes the call's error.
pub type StreamHandler = dyn Fn(&StreamChunk) -> Result<()> + Send + Sync;

/// Probe a raw usage map for the first matching field-name variant on each
/// side. Missing or unrecognized fields yield zero, never an error: pricing
/// is best-effort telemetry, not a correctness-critical value.
pub fn usage_from(
    info: &HashMap<String, JsonValue>,
    input_keys: &[&str],
    output_keys: &[&str],
) -> (u64, u64) {
    let probe = |keys: &[&str]| {
        keys.iter()
            .find_map(|key| info.get(*key))
            .and_then(|value| value.as_u64().or_else(|| value.as_f64().map(|f| f as u64)))
            .unwrap_or(0)
    };
    (probe(input_keys), probe(output_keys))
}

// ============================================================================
// Provider Contract
// ============================================================================

/// The capability set every vendor adapter exposes.
///
/// Per-call failures are returned as errors and never crash the process.
/// The ambient [`CancellationToken`] is checked inside every adapter at each
/// await/chunk boundary; a cancelled token aborts the in-flight call with
/// [`crate::LlmError::Cancelled`].
#[async_trait]
pub trait Provider: Send + Sync {
    /// Constant identity of this adapter.
    fn kind(&self) -> ProviderKind;

    /// Immutable configuration resolved at construction.
    fn provider_config(&self) -> &ProviderConfig;

    /// Effective model name for a task kind. Never fails: unmapped task
    /// kinds resolve to the vendor default through the default options.
    fn model(&self, agent: AgentType) -> String {
        self.provider_config().options_for(agent).model.clone()
    }

    /// Single-turn invocation returning plain text.
    async fn call(
        &self,
        ctx: &CancellationToken,
        agent: AgentType,
        prompt: &str,
    ) -> Result<String> {
        let messages = vec![ChatMessage::user(prompt)];
        let response = self.call_ex(ctx, agent, &messages, None).await?;
        Ok(response.content)
    }

    /// Multi-turn invocation. When `handler` is given it receives every
    /// produced chunk, in order, before the call returns.
    async fn call_ex(
        &self,
        ctx: &CancellationToken,
        agent: AgentType,
        messages: &[ChatMessage],
        handler: Option<&StreamHandler>,
    ) -> Result<ContentResponse>;

    /// Like [`Provider::call_ex`] but advertises tool definitions; the
    /// response may contain tool-invocation requests instead of text.
    async fn call_with_tools(
        &self,
        ctx: &CancellationToken,
        agent: AgentType,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        handler: Option<&StreamHandler>,
    ) -> Result<ContentResponse>;

    /// Normalize a vendor-specific usage map into (input, output) token
    /// counts. Lenient: unknown shapes yield zeroes.
    fn usage(&self, info: &HashMap<String, JsonValue>) -> (u64, u64);

    /// The raw profile bytes this adapter was configured from.
    fn raw_config(&self) -> &[u8] {
        self.provider_config().raw()
    }

    /// Price for a task kind, if configured.
    fn price_info(&self, agent: AgentType) -> Option<PriceInfo> {
        self.provider_config().price_for(agent)
    }

    /// Models this provider can serve. No network calls.
    fn models(&self) -> ModelsConfig {
        self.provider_config().models().clone()
    }
}
