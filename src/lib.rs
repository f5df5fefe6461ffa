//! Switchboard LLM - Multi-Backend Provider Abstraction
//!
//! This crate provides one contract over heterogeneous LLM backends, a
//! configuration-driven per-task option profile system, and a concurrent
//! conformance harness that validates any backend implementation against the
//! shared behavioral contract.
//!
//! # Providers
//!
//! | Provider | Chat | Tools | Streaming | Notes |
//! |----------|------|-------|-----------|-------|
//! | OpenAI | ✓ | ✓ | ✓ | Also serves OpenAI-compatible clouds |
//! | Anthropic | ✓ | ✓ | ✓ | Messages API |
//! | Gemini | ✓ | ✓ | ✓ | Google AI |
//! | Bedrock | ✓ | ✓ | ✓ | Converse API, feature `bedrock` |
//! | Ollama | ✓ | ✓ | ✓ | Local models, dynamic discovery |
//! | Custom | ✓ | ✓ | ✓ | Any OpenAI-compatible gateway |
//! | Mock | ✓ | ✓ | ✓ | Deterministic, network-free |
//!
//! # Architecture
//!
//! Every adapter implements the [`Provider`] trait. Task kinds
//! ([`AgentType`]) resolve to [`CallOptions`] by applying an ordered chain of
//! field-level overrides over the vendor default; later overrides win. The
//! conformance runner ([`tester::test_provider`]) fans a filtered
//! cross-product of (task kind × test case) across a fixed worker pool and
//! aggregates one result per request.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use switchboard_llm::{connect, ProviderKind, ProviderSettings};
//! use switchboard_llm::tester::{test_provider, TesterOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! let provider = connect(ProviderKind::OpenAi, ProviderSettings {
//!     api_key: api_key.clone(),
//!     ..Default::default()
//! }).await?;
//!
//! let report = test_provider(
//!     &CancellationToken::new(),
//!     provider,
//!     TesterOptions::default(),
//! ).await?;
//! println!("{}/{} passed", report.passed(), report.total());
//! ```

pub mod config;
pub mod error;
pub mod options;
pub mod providers;
pub mod tester;
pub mod traits;

pub use config::{ModelConfig, ModelsConfig, PriceInfo, ProviderConfig};
pub use error::{LlmError, Result};
pub use options::{AgentType, CallOptions, OptionOverride, ReasoningEffort};
pub use providers::anthropic::AnthropicProvider;
#[cfg(feature = "bedrock")]
pub use providers::bedrock::BedrockProvider;
pub use providers::custom::CustomProvider;
pub use providers::gemini::GeminiProvider;
pub use providers::mock::{MockBehavior, MockProvider};
pub use providers::ollama::OllamaProvider;
pub use providers::openai::OpenAiProvider;
pub use providers::{connect, ProviderKind, ProviderSettings};
pub use tester::{
    test_provider, ProviderTestResults, TestCase, TestGroup, TestRegistry, TestResult,
    TesterOptions, TestType,
};
pub use traits::{
    usage_from, ChatMessage, ChatRole, ContentResponse, FunctionCall, FunctionDefinition,
    Provider, StreamChunk, StreamHandler, ToolCall, ToolDefinition,
};
