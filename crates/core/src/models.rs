//! # Models
//!
//! LLM provider selection, model tiers, and the team roster.
//!
//! Every member of the virtual team is assigned a model tier. The tier maps
//! to a concrete model name per provider, and each mapping can be overridden
//! through configuration (`DEV_TEAM_MODEL_<TIER>`).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported LLM providers for the `api` backend.
///
/// API keys are read by radkit from the provider's usual variable:
/// - Anthropic (Claude) - `ANTHROPIC_API_KEY`
/// - OpenAI (GPT) - `OPENAI_API_KEY`
/// - Gemini (Google) - `GEMINI_API_KEY`
/// - OpenRouter (Gateway) - `OPENROUTER_API_KEY`
/// - Grok (xAI) - `XAI_API_KEY`
/// - DeepSeek - `DEEPSEEK_API_KEY`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    Anthropic,
    #[serde(rename = "openai")]
    OpenAI,
    Gemini,
    OpenRouter,
    Grok,
    DeepSeek,
}

impl LlmProvider {
    pub fn all() -> Vec<LlmProvider> {
        vec![
            LlmProvider::Anthropic,
            LlmProvider::OpenAI,
            LlmProvider::Gemini,
            LlmProvider::OpenRouter,
            LlmProvider::Grok,
            LlmProvider::DeepSeek,
        ]
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            LlmProvider::Anthropic => "Anthropic",
            LlmProvider::OpenAI => "OpenAI",
            LlmProvider::Gemini => "Gemini",
            LlmProvider::OpenRouter => "OpenRouter",
            LlmProvider::Grok => "Grok",
            LlmProvider::DeepSeek => "DeepSeek",
        }
    }

    /// Whether this provider supports custom base URL
    pub fn supports_base_url(&self) -> bool {
        matches!(self, LlmProvider::OpenAI)
    }

    /// Parse a provider name as written in configuration.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Some(LlmProvider::Anthropic),
            "openai" | "gpt" => Some(LlmProvider::OpenAI),
            "gemini" | "google" => Some(LlmProvider::Gemini),
            "openrouter" => Some(LlmProvider::OpenRouter),
            "grok" | "xai" => Some(LlmProvider::Grok),
            "deepseek" => Some(LlmProvider::DeepSeek),
            _ => None,
        }
    }

    /// Built-in model name for a tier.
    pub fn default_model(&self, tier: ModelTier) -> &'static str {
        use ModelTier::*;
        match (self, tier) {
            (LlmProvider::Anthropic, Quick) => "claude-3-5-haiku-latest",
            (LlmProvider::Anthropic, Balanced) => "claude-sonnet-4-20250514",
            (LlmProvider::Anthropic, Deep) => "claude-opus-4-20250514",
            (LlmProvider::OpenAI, Quick) => "gpt-4o-mini",
            (LlmProvider::OpenAI, Balanced) => "gpt-4o",
            (LlmProvider::OpenAI, Deep) => "gpt-4.1",
            (LlmProvider::Gemini, Quick) => "gemini-2.0-flash",
            (LlmProvider::Gemini, Balanced) => "gemini-2.5-flash",
            (LlmProvider::Gemini, Deep) => "gemini-2.5-pro",
            (LlmProvider::OpenRouter, Quick) => "anthropic/claude-3.5-haiku",
            (LlmProvider::OpenRouter, Balanced) => "anthropic/claude-sonnet-4",
            (LlmProvider::OpenRouter, Deep) => "anthropic/claude-opus-4",
            (LlmProvider::Grok, Quick) => "grok-3-mini",
            (LlmProvider::Grok, Balanced) => "grok-3",
            (LlmProvider::Grok, Deep) => "grok-4",
            (LlmProvider::DeepSeek, Quick) => "deepseek-chat",
            (LlmProvider::DeepSeek, Balanced) => "deepseek-chat",
            (LlmProvider::DeepSeek, Deep) => "deepseek-reasoner",
        }
    }
}

/// Capability tier requested for an invocation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Quick,
    Balanced,
    Deep,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Quick => "quick",
            ModelTier::Balanced => "balanced",
            ModelTier::Deep => "deep",
        }
    }
}

/// A member of the virtual team.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Member {
    Planner,
    Architect,
    Critic,
    Coder,
    CodeReviewer,
    Tester,
    DependencyManager,
    Reviewer,
    QaTester,
    FinalApprover,
}

impl Member {
    pub fn as_str(&self) -> &'static str {
        match self {
            Member::Planner => "planner",
            Member::Architect => "architect",
            Member::Critic => "critic",
            Member::Coder => "coder",
            Member::CodeReviewer => "code-reviewer",
            Member::Tester => "tester",
            Member::DependencyManager => "dependency-manager",
            Member::Reviewer => "reviewer",
            Member::QaTester => "qa-tester",
            Member::FinalApprover => "final-approver",
        }
    }

    /// Default tier for this member. Judgement-heavy roles get the deep tier.
    pub fn tier(&self) -> ModelTier {
        match self {
            Member::Planner | Member::Architect | Member::Critic | Member::FinalApprover => {
                ModelTier::Deep
            }
            Member::Coder | Member::CodeReviewer | Member::Reviewer | Member::QaTester => {
                ModelTier::Balanced
            }
            Member::Tester | Member::DependencyManager => ModelTier::Quick,
        }
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Concrete model selection for one invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelConfig {
    #[serde(default)]
    pub provider: LlmProvider,
    pub model: String,
    /// Optional base URL override for OpenAI-compatible APIs
    pub base_url: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::with_provider(
            LlmProvider::Anthropic,
            LlmProvider::Anthropic.default_model(ModelTier::Balanced),
        )
    }
}

impl ModelConfig {
    pub fn with_provider(provider: LlmProvider, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            base_url: None,
        }
    }

    /// Set base URL (for OpenAI-compatible endpoints)
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ModelConfig::default();
        assert_eq!(config.provider, LlmProvider::Anthropic);
        assert!(config.model.contains("claude"));
    }

    #[test]
    fn test_provider_parse() {
        assert_eq!(LlmProvider::parse("OpenAI"), Some(LlmProvider::OpenAI));
        assert_eq!(LlmProvider::parse(" xai "), Some(LlmProvider::Grok));
        assert_eq!(LlmProvider::parse("mystery"), None);
        for provider in LlmProvider::all() {
            let name = serde_json::to_value(provider).unwrap();
            assert_eq!(LlmProvider::parse(name.as_str().unwrap()), Some(provider));
        }
    }

    #[test]
    fn test_member_tiers() {
        assert_eq!(Member::Planner.tier(), ModelTier::Deep);
        assert_eq!(Member::FinalApprover.tier(), ModelTier::Deep);
        assert_eq!(Member::Coder.tier(), ModelTier::Balanced);
        assert_eq!(Member::Tester.tier(), ModelTier::Quick);
    }

    #[test]
    fn test_member_serialization_matches_name() {
        let json = serde_json::to_string(&Member::CodeReviewer).unwrap();
        assert_eq!(json, "\"code-reviewer\"");
        assert_eq!(Member::QaTester.to_string(), "qa-tester");
    }

    #[test]
    fn test_base_url_support() {
        assert!(LlmProvider::OpenAI.supports_base_url());
        assert!(!LlmProvider::Anthropic.supports_base_url());
        let config = ModelConfig::with_provider(LlmProvider::OpenAI, "gpt-4o")
            .with_base_url("http://localhost:8080/v1");
        assert_eq!(config.base_url.as_deref(), Some("http://localhost:8080/v1"));
    }
}
