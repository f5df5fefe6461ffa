//! Vendor adapters and the adapter selection registry.
//!
//! Each backend lives in its own module and implements
//! [`crate::traits::Provider`]. Adapter selection is a small enum →
//! constructor registry in [`connect`]; vendor SDK specifics never leak out
//! of the adapter modules.

pub mod anthropic;
#[cfg(feature = "bedrock")]
pub mod bedrock;
pub mod custom;
pub mod gemini;
pub mod mock;
pub mod ollama;
pub mod openai;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LlmError, Result};
use crate::traits::Provider;

pub use anthropic::AnthropicProvider;
#[cfg(feature = "bedrock")]
pub use bedrock::BedrockProvider;
pub use custom::CustomProvider;
pub use gemini::GeminiProvider;
pub use mock::{MockBehavior, MockProvider};
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;

/// Default request timeout for hand-rolled HTTP adapters.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Supported backend kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI and OpenAI-compatible cloud APIs.
    OpenAi,
    /// Anthropic Messages API.
    Anthropic,
    /// Google Gemini API.
    Gemini,
    /// AWS Bedrock Converse API.
    Bedrock,
    /// Local Ollama server.
    Ollama,
    /// Generic OpenAI-compatible endpoint (self-hosted gateways).
    Custom,
    /// Deterministic test double.
    Mock,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Bedrock => "bedrock",
            ProviderKind::Ollama => "ollama",
            ProviderKind::Custom => "custom",
            ProviderKind::Mock => "mock",
        }
    }

    /// Parse a provider kind from a string (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Some(Self::OpenAi),
            "anthropic" | "claude" => Some(Self::Anthropic),
            "gemini" | "google" => Some(Self::Gemini),
            "bedrock" | "aws" => Some(Self::Bedrock),
            "ollama" => Some(Self::Ollama),
            "custom" => Some(Self::Custom),
            "mock" => Some(Self::Mock),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Already-resolved connection settings for one adapter.
///
/// This crate reads no environment variables and no files itself; the caller
/// resolves credentials, endpoints, and profile bytes and hands them over.
#[derive(Debug, Clone, Default)]
pub struct ProviderSettings {
    /// API key or token. Required by the cloud adapters.
    pub api_key: String,

    /// Endpoint override (cloud) or server address (local backends).
    pub base_url: Option<String>,

    /// Outbound HTTP proxy URL, if traffic must be tunneled.
    pub proxy_url: Option<String>,

    /// Vendor default model override.
    pub model: Option<String>,

    /// External profile bytes overlaying the embedded defaults.
    pub config: Option<Vec<u8>>,
}

/// Build the shared HTTP client for hand-rolled adapters.
pub(crate) fn http_client(settings: &ProviderSettings) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(DEFAULT_TIMEOUT);
    if let Some(proxy_url) = &settings.proxy_url {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|e| LlmError::ConfigError(format!("Invalid proxy URL: {}", e)))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| LlmError::ConfigError(format!("Failed to build HTTP client: {}", e)))
}

/// Create an adapter for the given backend kind.
///
/// Construction is fatal on missing credentials or malformed profile bytes;
/// best-effort steps (Ollama model discovery) degrade gracefully instead.
pub async fn connect(kind: ProviderKind, settings: ProviderSettings) -> Result<Arc<dyn Provider>> {
    match kind {
        ProviderKind::OpenAi => Ok(Arc::new(OpenAiProvider::new(&settings)?)),
        ProviderKind::Anthropic => Ok(Arc::new(AnthropicProvider::new(&settings)?)),
        ProviderKind::Gemini => Ok(Arc::new(GeminiProvider::new(&settings)?)),
        ProviderKind::Ollama => Ok(Arc::new(OllamaProvider::connect(&settings).await?)),
        ProviderKind::Custom => Ok(Arc::new(CustomProvider::new(&settings)?)),
        ProviderKind::Mock => Ok(Arc::new(MockProvider::new(
            MockBehavior::default(),
            settings.config.as_deref(),
        )?)),
        #[cfg(feature = "bedrock")]
        ProviderKind::Bedrock => Ok(Arc::new(BedrockProvider::connect(&settings).await?)),
        #[cfg(not(feature = "bedrock"))]
        ProviderKind::Bedrock => Err(LlmError::NotSupported(
            "Bedrock support requires the `bedrock` feature".to_string(),
        )),
    }
}
