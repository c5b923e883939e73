//! Direct provider calls through radkit.
//!
//! The member's reply travels as JSON text inside a structured
//! [`ReplyEnvelope`] so every provider returns the same shape. The text goes
//! to the shared parser unchanged.

use super::{AiBackend, AiRequest};
use crate::config::ProviderConfig;
use crate::error::AiError;
use async_trait::async_trait;
use radkit::macros::LLMOutput;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Run an `LlmFunction` against whichever provider the config selects.
#[macro_export]
macro_rules! run_llm_function {
    ($config:expr, $output_type:ty, $system_prompt:expr, $input:expr) => {{
        use radkit::agent::LlmFunction;
        use radkit::models::providers::{
            AnthropicLlm, DeepSeekLlm, GeminiLlm, GrokLlm, OpenAILlm, OpenRouterLlm,
        };
        use $crate::models::LlmProvider;

        let config = $config;
        let result: anyhow::Result<$output_type> = match config.provider {
            LlmProvider::Anthropic => {
                let llm = AnthropicLlm::from_env(&config.model)?;
                let func =
                    LlmFunction::<$output_type>::new_with_system_instructions(llm, $system_prompt);
                func.run($input).await.map_err(Into::into)
            }
            LlmProvider::OpenAI => {
                let mut llm = OpenAILlm::from_env(&config.model)?;
                if let Some(base_url) = &config.base_url {
                    llm = llm.with_base_url(base_url);
                }
                let func =
                    LlmFunction::<$output_type>::new_with_system_instructions(llm, $system_prompt);
                func.run($input).await.map_err(Into::into)
            }
            LlmProvider::Gemini => {
                let llm = GeminiLlm::from_env(&config.model)?;
                let func =
                    LlmFunction::<$output_type>::new_with_system_instructions(llm, $system_prompt);
                func.run($input).await.map_err(Into::into)
            }
            LlmProvider::OpenRouter => {
                let llm = OpenRouterLlm::from_env(&config.model)?;
                let func =
                    LlmFunction::<$output_type>::new_with_system_instructions(llm, $system_prompt);
                func.run($input).await.map_err(Into::into)
            }
            LlmProvider::Grok => {
                let llm = GrokLlm::from_env(&config.model)?;
                let func =
                    LlmFunction::<$output_type>::new_with_system_instructions(llm, $system_prompt);
                func.run($input).await.map_err(Into::into)
            }
            LlmProvider::DeepSeek => {
                let llm = DeepSeekLlm::from_env(&config.model)?;
                let func =
                    LlmFunction::<$output_type>::new_with_system_instructions(llm, $system_prompt);
                func.run($input).await.map_err(Into::into)
            }
        };
        result
    }};
}

/// Structured wrapper around a member's reply.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, LLMOutput)]
pub struct ReplyEnvelope {
    /// The complete reply object requested by the system instructions,
    /// serialized as a JSON string
    pub reply: String,
}

pub struct RadkitBackend {
    config: ProviderConfig,
}

impl RadkitBackend {
    pub fn new(config: ProviderConfig) -> Self {
        Self { config }
    }

    async fn run(&self, request: &AiRequest) -> anyhow::Result<ReplyEnvelope> {
        let model = self.config.model_for(request.tier);
        tracing::debug!(member = %request.member, model = %model.model, "Invoking provider");
        let system = request.system.clone();
        let prompt = request.prompt.clone();
        run_llm_function!(&model, ReplyEnvelope, system, prompt)
    }
}

#[async_trait]
impl AiBackend for RadkitBackend {
    fn name(&self) -> &'static str {
        "api"
    }

    async fn complete(&self, request: &AiRequest) -> Result<String, AiError> {
        match self.run(request).await {
            Ok(envelope) => Ok(envelope.reply),
            Err(e) => Err(classify_failure(self.name(), &format!("{e:#}"))),
        }
    }
}

/// Map a backend failure message onto the error taxonomy.
pub fn classify_failure(backend: &str, message: &str) -> AiError {
    let lower = message.to_lowercase();
    let backend = backend.to_string();
    let reason = message.trim().to_string();
    if ["api key", "api_key", "unauthorized", "authentication", "401"]
        .iter()
        .any(|k| lower.contains(k))
    {
        AiError::Authentication { backend, reason }
    } else if ["rate limit", "429", "too many requests"]
        .iter()
        .any(|k| lower.contains(k))
    {
        AiError::RateLimited { backend, reason }
    } else {
        AiError::Backend { backend, reason }
    }
}
