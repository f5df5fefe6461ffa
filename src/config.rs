//! TOML profile loading and per-provider configuration.
//!
//! Each adapter ships an embedded default profile (`config/<vendor>.toml`)
//! mapping agent types to option overrides and prices. Callers may supply
//! external profile bytes with the same schema; external values are applied
//! after the embedded ones, so they win field-by-field.
//!
//! # Profile schema
//!
//! ```toml
//! [default]
//! model = "gpt-4o"
//! temperature = 0.7
//!
//! [agents.simple]
//! model = "gpt-4o-mini"
//! max_tokens = 1024
//!
//! [agents.simple_json]
//! json_response = true
//!
//! [prices.simple]
//! input = 0.00015
//! output = 0.0006
//!
//! [[models]]
//! name = "gpt-4o"
//! price = { input = 0.0025, output = 0.01 }
//! ```
//!
//! Prices are USD per 1K tokens. Zero is permitted only for genuinely
//! free/local inference.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{LlmError, Result};
use crate::options::{AgentType, CallOptions, OptionOverride, ReasoningEffort};

/// Price per 1K tokens for one task kind or model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceInfo {
    /// USD per 1K input tokens.
    pub input: f64,
    /// USD per 1K output tokens.
    pub output: f64,
}

/// A model name with optional pricing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<PriceInfo>,
}

/// The models a provider can serve, static or discovered.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

impl ModelsConfig {
    /// Look up a model by exact name.
    pub fn get(&self, name: &str) -> Option<&ModelConfig> {
        self.models.iter().find(|m| m.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }
}

/// One agent section of a profile file: every field optional.
///
/// Field declaration order is the override application order, so a later
/// profile layer replaces exactly the fields it mentions.
#[derive(Debug, Clone, Default, Deserialize)]
struct AgentPatch {
    model: Option<String>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    n: Option<u8>,
    max_tokens: Option<u32>,
    reasoning_effort: Option<ReasoningEffort>,
    json_response: Option<bool>,
}

impl AgentPatch {
    fn overrides(&self) -> Vec<OptionOverride> {
        let mut out = Vec::new();
        if let Some(model) = &self.model {
            out.push(OptionOverride::Model(model.clone()));
        }
        if let Some(t) = self.temperature {
            out.push(OptionOverride::Temperature(t));
        }
        if let Some(p) = self.top_p {
            out.push(OptionOverride::TopP(p));
        }
        if let Some(n) = self.n {
            out.push(OptionOverride::Choices(n));
        }
        if let Some(limit) = self.max_tokens {
            out.push(OptionOverride::MaxTokens(limit));
        }
        if let Some(effort) = self.reasoning_effort {
            out.push(OptionOverride::Reasoning(effort));
        }
        if let Some(json) = self.json_response {
            out.push(OptionOverride::JsonResponse(json));
        }
        out
    }
}

/// On-disk profile file shape.
#[derive(Debug, Default, Deserialize)]
struct ProfileFile {
    #[serde(default)]
    default: AgentPatch,
    #[serde(default)]
    agents: BTreeMap<String, AgentPatch>,
    #[serde(default)]
    prices: BTreeMap<String, PriceInfo>,
    #[serde(default)]
    models: Vec<ModelConfig>,
}

impl ProfileFile {
    fn parse(text: &str) -> Result<Self> {
        let file: ProfileFile = toml::from_str(text)
            .map_err(|e| LlmError::ConfigError(format!("Failed to parse profile: {}", e)))?;
        for key in file.agents.keys().chain(file.prices.keys()) {
            if AgentType::from_str(key).is_none() {
                return Err(LlmError::ConfigError(format!(
                    "Unknown agent type in profile: {}",
                    key
                )));
            }
        }
        for (key, price) in &file.prices {
            if price.input < 0.0 || price.output < 0.0 {
                return Err(LlmError::ConfigError(format!(
                    "Negative price for agent type {}",
                    key
                )));
            }
        }
        Ok(file)
    }

    fn agent(&self, agent: AgentType) -> Option<&AgentPatch> {
        self.agents.get(agent.as_str())
    }
}

/// Immutable per-provider configuration: raw bytes retained for audit,
/// resolved options and prices per agent type, and the static model list.
///
/// Built once at adapter construction and owned by that adapter for its
/// lifetime.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    raw: Vec<u8>,
    options: HashMap<AgentType, CallOptions>,
    prices: HashMap<AgentType, PriceInfo>,
    default_options: CallOptions,
    models: ModelsConfig,
}

impl ProviderConfig {
    /// Load a provider profile.
    ///
    /// `embedded` is the adapter's built-in profile; `external`, when given,
    /// is a caller-supplied profile whose overrides are applied after the
    /// embedded ones. Either layer failing to parse is fatal.
    pub fn load(default_model: &str, embedded: &str, external: Option<&[u8]>) -> Result<Self> {
        let base = ProfileFile::parse(embedded)?;
        let overlay = match external {
            Some(bytes) => {
                let text = std::str::from_utf8(bytes).map_err(|e| {
                    LlmError::ConfigError(format!("Profile is not valid UTF-8: {}", e))
                })?;
                Some(ProfileFile::parse(text)?)
            }
            None => None,
        };

        let mut options = HashMap::new();
        for agent in AgentType::ALL {
            let mut chain = base.default.overrides();
            if let Some(patch) = base.agent(agent) {
                chain.extend(patch.overrides());
            }
            if let Some(overlay) = &overlay {
                chain.extend(overlay.default.overrides());
                if let Some(patch) = overlay.agent(agent) {
                    chain.extend(patch.overrides());
                }
            }
            options.insert(agent, CallOptions::resolve(default_model, &chain));
        }

        let mut default_chain = base.default.overrides();
        if let Some(overlay) = &overlay {
            default_chain.extend(overlay.default.overrides());
        }
        let default_options = CallOptions::resolve(default_model, &default_chain);

        let mut prices = HashMap::new();
        for (key, price) in &base.prices {
            if let Some(agent) = AgentType::from_str(key) {
                prices.insert(agent, *price);
            }
        }
        if let Some(overlay) = &overlay {
            for (key, price) in &overlay.prices {
                if let Some(agent) = AgentType::from_str(key) {
                    prices.insert(agent, *price);
                }
            }
        }

        let models = match &overlay {
            Some(overlay) if !overlay.models.is_empty() => ModelsConfig {
                models: overlay.models.clone(),
            },
            _ => ModelsConfig {
                models: base.models.clone(),
            },
        };

        let raw = match external {
            Some(bytes) => bytes.to_vec(),
            None => embedded.as_bytes().to_vec(),
        };

        Ok(Self {
            raw,
            options,
            prices,
            default_options,
            models,
        })
    }

    /// Resolved options for a task kind, falling back to the default section
    /// for anything unmapped.
    pub fn options_for(&self, agent: AgentType) -> &CallOptions {
        self.options.get(&agent).unwrap_or(&self.default_options)
    }

    /// Price for a task kind, if the profile declares one.
    pub fn price_for(&self, agent: AgentType) -> Option<PriceInfo> {
        self.prices.get(&agent).copied()
    }

    /// The profile bytes this configuration was built from.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Static model list from the profile.
    pub fn models(&self) -> &ModelsConfig {
        &self.models
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE: &str = r#"
[default]
temperature = 0.7

[agents.simple]
model = "small-model"
max_tokens = 1024

[agents.simple_json]
model = "small-model"
json_response = true

[agents.coder]
temperature = 0.2
reasoning_effort = "high"

[prices.simple]
input = 0.0001
output = 0.0004

[[models]]
name = "big-model"
price = { input = 0.0025, output = 0.01 }
"#;

    #[test]
    fn test_load_embedded_only() {
        let config = ProviderConfig::load("big-model", PROFILE, None).unwrap();

        let simple = config.options_for(AgentType::Simple);
        assert_eq!(simple.model, "small-model");
        assert_eq!(simple.temperature, Some(0.7));
        assert_eq!(simple.max_tokens, Some(1024));

        let json = config.options_for(AgentType::SimpleJson);
        assert!(json.json_response);

        let coder = config.options_for(AgentType::Coder);
        assert_eq!(coder.model, "big-model");
        assert_eq!(coder.temperature, Some(0.2));
        assert_eq!(coder.reasoning_effort, Some(ReasoningEffort::High));
    }

    #[test]
    fn test_unmapped_agent_falls_back_to_default() {
        let config = ProviderConfig::load("big-model", PROFILE, None).unwrap();
        let adviser = config.options_for(AgentType::Adviser);
        assert_eq!(adviser.model, "big-model");
        assert_eq!(adviser.temperature, Some(0.7));
        assert!(adviser.max_tokens.is_none());
    }

    #[test]
    fn test_external_overlay_wins_per_field() {
        let overlay = r#"
[agents.simple]
temperature = 0.1
"#;
        let config = ProviderConfig::load("big-model", PROFILE, Some(overlay.as_bytes())).unwrap();
        let simple = config.options_for(AgentType::Simple);
        // Overlay replaces only the fields it mentions.
        assert_eq!(simple.temperature, Some(0.1));
        assert_eq!(simple.model, "small-model");
        assert_eq!(simple.max_tokens, Some(1024));
        // Raw bytes are the external layer when one is supplied.
        assert_eq!(config.raw(), overlay.as_bytes());
    }

    #[test]
    fn test_empty_overlay_keeps_embedded() {
        let config = ProviderConfig::load("big-model", PROFILE, Some(b"")).unwrap();
        assert_eq!(config.options_for(AgentType::Simple).model, "small-model");
    }

    #[test]
    fn test_prices() {
        let config = ProviderConfig::load("big-model", PROFILE, None).unwrap();
        let price = config.price_for(AgentType::Simple).unwrap();
        assert_eq!(price.input, 0.0001);
        assert!(config.price_for(AgentType::Coder).is_none());
    }

    #[test]
    fn test_unknown_agent_key_is_fatal() {
        let bad = "[agents.wizard]\nmodel = \"m\"\n";
        let err = ProviderConfig::load("m", bad, None).unwrap_err();
        assert!(err.to_string().contains("wizard"));
    }

    #[test]
    fn test_negative_price_is_fatal() {
        let bad = "[prices.simple]\ninput = -1.0\noutput = 0.0\n";
        assert!(ProviderConfig::load("m", bad, None).is_err());
    }

    #[test]
    fn test_malformed_toml_is_fatal() {
        assert!(ProviderConfig::load("m", "not [ toml", None).is_err());
    }

    #[test]
    fn test_models_list() {
        let config = ProviderConfig::load("big-model", PROFILE, None).unwrap();
        assert_eq!(config.models().len(), 1);
        let model = config.models().get("big-model").unwrap();
        assert_eq!(model.price.unwrap().output, 0.01);
    }
}
