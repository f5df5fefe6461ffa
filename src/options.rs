//! Task kinds and per-call invocation options.
//!
//! Every call into a provider is made on behalf of an [`AgentType`], the
//! purpose of the call (quick classification, long-form generation, code
//! writing, ...). The profile layer in [`crate::config`] maps each agent type
//! to a [`CallOptions`] value by applying an ordered chain of
//! [`OptionOverride`]s over a base seeded with the vendor's default model.
//! Later overrides in the chain win on field conflicts.

use serde::{Deserialize, Serialize};

/// Task kind identifying the purpose of a call.
///
/// A complete provider profile maps every agent type to usable options;
/// unmapped types resolve through the `[default]` profile section rather
/// than erroring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    /// Short single-turn utility calls.
    Simple,
    /// Utility calls that must return structured JSON.
    SimpleJson,
    /// The main orchestrating agent.
    PrimaryAgent,
    /// Conversational assistant turns.
    Assistant,
    /// Long-form content generation.
    Generator,
    /// Iterative refinement of earlier output.
    Refiner,
    /// Advice and recommendation turns.
    Adviser,
    /// Self-review / reflection turns.
    Reflector,
    /// Web and knowledge-base search synthesis.
    Searcher,
    /// Context enrichment from gathered material.
    Enricher,
    /// Code writing and editing.
    Coder,
    /// Environment and tool installation steps.
    Installer,
    /// Offensive-security task execution.
    Pentester,
}

impl AgentType {
    /// Every task kind, in declaration order.
    pub const ALL: [AgentType; 13] = [
        AgentType::Simple,
        AgentType::SimpleJson,
        AgentType::PrimaryAgent,
        AgentType::Assistant,
        AgentType::Generator,
        AgentType::Refiner,
        AgentType::Adviser,
        AgentType::Reflector,
        AgentType::Searcher,
        AgentType::Enricher,
        AgentType::Coder,
        AgentType::Installer,
        AgentType::Pentester,
    ];

    /// Snake-case name, matching the profile file keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Simple => "simple",
            AgentType::SimpleJson => "simple_json",
            AgentType::PrimaryAgent => "primary_agent",
            AgentType::Assistant => "assistant",
            AgentType::Generator => "generator",
            AgentType::Refiner => "refiner",
            AgentType::Adviser => "adviser",
            AgentType::Reflector => "reflector",
            AgentType::Searcher => "searcher",
            AgentType::Enricher => "enricher",
            AgentType::Coder => "coder",
            AgentType::Installer => "installer",
            AgentType::Pentester => "pentester",
        }
    }

    /// Parse a profile key (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        let key = s.to_lowercase();
        AgentType::ALL.iter().copied().find(|a| a.as_str() == key)
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reasoning-effort level for models that expose one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
        }
    }
}

/// Resolved invocation parameters for one task kind.
///
/// Immutable once resolved; adapters read it on every call but never write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallOptions {
    /// Model name to request from the vendor.
    pub model: String,

    /// Sampling temperature.
    pub temperature: Option<f32>,

    /// Nucleus sampling cutoff.
    pub top_p: Option<f32>,

    /// Number of completions to request.
    pub n: Option<u8>,

    /// Output token cap.
    pub max_tokens: Option<u32>,

    /// Reasoning-effort level for models that support it.
    pub reasoning_effort: Option<ReasoningEffort>,

    /// Request structured JSON output.
    pub json_response: bool,
}

impl CallOptions {
    /// Base value seeded with the vendor's default model and nothing else.
    pub fn with_model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: None,
            top_p: None,
            n: None,
            max_tokens: None,
            reasoning_effort: None,
            json_response: false,
        }
    }

    /// Apply an ordered override chain over a vendor-default-seeded base.
    ///
    /// Later entries win on field conflicts (last-write-wins).
    pub fn resolve(default_model: &str, overrides: &[OptionOverride]) -> Self {
        let mut options = Self::with_model(default_model);
        for item in overrides {
            item.apply(&mut options);
        }
        options
    }
}

/// A single field-level override applied during option resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionOverride {
    Model(String),
    Temperature(f32),
    TopP(f32),
    Choices(u8),
    MaxTokens(u32),
    Reasoning(ReasoningEffort),
    JsonResponse(bool),
}

impl OptionOverride {
    fn apply(&self, options: &mut CallOptions) {
        match self {
            OptionOverride::Model(model) => options.model = model.clone(),
            OptionOverride::Temperature(t) => options.temperature = Some(*t),
            OptionOverride::TopP(p) => options.top_p = Some(*p),
            OptionOverride::Choices(n) => options.n = Some(*n),
            OptionOverride::MaxTokens(limit) => options.max_tokens = Some(*limit),
            OptionOverride::Reasoning(effort) => options.reasoning_effort = Some(*effort),
            OptionOverride::JsonResponse(json) => options.json_response = *json,
        }
    }
}
