//! # AI Boundary
//!
//! Members talk to a model through [`AiClient`]. A client routes each
//! request to one [`AiBackend`] (radkit providers, the Codex CLI, canned
//! offline replies, or a scripted replay) and falls back from codex to the
//! api backend when codex cannot be used. Replies are parsed into typed
//! member replies; malformed replies are typed errors, never panics.

pub mod codex;
pub mod offline;
pub mod parse;
pub mod radkit_backend;
pub mod scripted;

use crate::config::{ProviderConfig, ProviderKind};
use crate::error::AiError;
use crate::events::{kind, EventLog, PipelineEvent};
use crate::models::{Member, ModelTier};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub use codex::CodexBackend;
pub use offline::OfflineBackend;
pub use parse::{extract_json, MemberReply};
pub use radkit_backend::RadkitBackend;
pub use scripted::ScriptedBackend;

/// One model invocation.
#[derive(Debug, Clone)]
pub struct AiRequest {
    pub member: Member,
    pub system: String,
    pub prompt: String,
    pub tier: ModelTier,
}

impl AiRequest {
    pub fn new(member: Member, system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            member,
            system: system.into(),
            prompt: prompt.into(),
            tier: member.tier(),
        }
    }

    pub fn with_tier(mut self, tier: ModelTier) -> Self {
        self.tier = tier;
        self
    }
}

#[async_trait]
pub trait AiBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Raw reply text for a request.
    async fn complete(&self, request: &AiRequest) -> Result<String, AiError>;
}

/// Reply text plus which backend produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AiReply {
    pub text: String,
    pub backend: &'static str,
    pub fell_back: bool,
}

/// Routes requests to a backend with timeout and codex fallback.
#[derive(Clone)]
pub struct AiClient {
    primary: Arc<dyn AiBackend>,
    fallback: Option<Arc<dyn AiBackend>>,
    allow_fallback: bool,
    timeout: Duration,
}

impl AiClient {
    pub fn new(primary: Arc<dyn AiBackend>) -> Self {
        Self {
            primary,
            fallback: None,
            allow_fallback: false,
            timeout: Duration::from_secs(300),
        }
    }

    /// Try `fallback` when the primary is unavailable or unauthenticated.
    /// With `enabled` off the failure is surfaced instead.
    pub fn with_fallback(mut self, fallback: Arc<dyn AiBackend>, enabled: bool) -> Self {
        self.fallback = Some(fallback);
        self.allow_fallback = enabled;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build the client for a provider selection.
    pub fn from_config(config: &ProviderConfig, kind: ProviderKind, cwd: PathBuf) -> Self {
        let timeout = Duration::from_millis(config.timeout_ms);
        let api: Arc<dyn AiBackend> = Arc::new(RadkitBackend::new(config.clone()));
        match kind {
            ProviderKind::Api => AiClient::new(api).with_timeout(timeout),
            ProviderKind::Offline => AiClient::new(Arc::new(OfflineBackend)).with_timeout(timeout),
            ProviderKind::Codex => {
                let codex = CodexBackend::new(&config.codex, cwd);
                // The codex subprocess carries its own deadline.
                let timeout = timeout.max(Duration::from_millis(config.codex.timeout_ms));
                AiClient::new(Arc::new(codex))
                    .with_fallback(api, config.codex.fallback)
                    .with_timeout(timeout)
            }
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.primary.name()
    }

    async fn call(&self, backend: &dyn AiBackend, request: &AiRequest) -> Result<String, AiError> {
        match tokio::time::timeout(self.timeout, backend.complete(request)).await {
            Ok(result) => result,
            Err(_) => Err(AiError::Timeout {
                member: request.member.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }

    /// Invoke the primary backend, falling back when allowed.
    pub async fn invoke(&self, request: &AiRequest, log: &mut EventLog) -> Result<AiReply, AiError> {
        let err = match self.call(self.primary.as_ref(), request).await {
            Ok(text) => {
                return Ok(AiReply {
                    text,
                    backend: self.primary.name(),
                    fell_back: false,
                })
            }
            Err(e) => e,
        };

        let Some(fallback) = self.fallback.as_ref().filter(|_| err.is_fallback_eligible()) else {
            return Err(err);
        };

        if !self.allow_fallback {
            tracing::error!(
                backend = self.primary.name(),
                error = %err,
                "Backend unusable and fallback disabled. Install and authenticate the codex CLI \
                 (`npm install -g @openai/codex`, then `codex login` or set OPENAI_API_KEY) \
                 or switch DEV_TEAM_PROVIDER to `api`."
            );
            log.emit(
                PipelineEvent::new(kind::AI_FALLBACK_DISABLED)
                    .with("from", self.primary.name())
                    .with("member", request.member)
                    .with("error", err.to_string()),
            )
            .await;
            return Err(AiError::FallbackDisabled {
                source: Box::new(err),
            });
        }

        tracing::warn!(
            from = self.primary.name(),
            to = fallback.name(),
            error = %err,
            "Falling back to alternate AI backend"
        );
        log.emit(
            PipelineEvent::new(kind::AI_FALLBACK)
                .with("from", self.primary.name())
                .with("to", fallback.name())
                .with("member", request.member)
                .with("reason", err.to_string()),
        )
        .await;

        let text = self.call(fallback.as_ref(), request).await?;
        Ok(AiReply {
            text,
            backend: fallback.name(),
            fell_back: true,
        })
    }

    /// Invoke and parse into a validated member reply.
    pub async fn ask<T: MemberReply>(&self, request: &AiRequest, log: &mut EventLog) -> Result<T, AiError> {
        let reply = self.invoke(request, log).await?;
        parse::parse_reply(request.member, &reply.text)
    }
}

impl std::fmt::Debug for AiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AiClient")
            .field("primary", &self.primary.name())
            .field("fallback", &self.fallback.as_ref().map(|b| b.name()))
            .field("allow_fallback", &self.allow_fallback)
            .field("timeout", &self.timeout)
            .finish()
    }
}
