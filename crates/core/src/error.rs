//! # Errors
//!
//! Typed failures for the engine. The binary and backend glue code use
//! `anyhow` on top of these.

use std::path::PathBuf;
use thiserror::Error;

/// Failures at the AI invocation boundary.
#[derive(Debug, Error)]
pub enum AiError {
    #[error("AI backend `{backend}` is unavailable: {reason}")]
    Unavailable { backend: String, reason: String },

    #[error("AI backend `{backend}` rejected credentials: {reason}")]
    Authentication { backend: String, reason: String },

    #[error("AI backend `{backend}` is rate limited: {reason}")]
    RateLimited { backend: String, reason: String },

    #[error("AI invocation for `{member}` timed out after {timeout_ms}ms")]
    Timeout { member: String, timeout_ms: u64 },

    #[error("AI backend `{backend}` failed: {reason}")]
    Backend { backend: String, reason: String },

    #[error("could not parse reply from `{member}`: {reason}")]
    Parse { member: String, reason: String },

    #[error("reply from `{member}` failed validation: {reason}")]
    Validation { member: String, reason: String },

    #[error("codex backend failed and fallback is disabled: {source}")]
    FallbackDisabled {
        #[source]
        source: Box<AiError>,
    },
}

impl AiError {
    /// Whether the router may retry on the default backend.
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(
            self,
            AiError::Unavailable { .. } | AiError::Authentication { .. }
        )
    }
}

/// Rejected check lists.
#[derive(Debug, Error, PartialEq)]
pub enum QualityError {
    #[error("quality checks carry no weight")]
    ZeroWeight,

    #[error("check `{name}` has invalid bounds (score {score}, max {max}, weight {weight})")]
    InvalidCheck {
        name: String,
        score: f64,
        max: f64,
        weight: f64,
    },
}

/// Workspace persistence failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("no state recorded for run `{0}`")]
    NotFound(String),
}

/// Subprocess collaborator failures.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("`{program}` could not be started: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{program}` timed out after {timeout_ms}ms")]
    Timeout { program: String, timeout_ms: u64 },

    #[error("refusing to write outside the project root: {0}")]
    PathEscape(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Terminal pipeline failures.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{phase} phase failed: {reason}")]
    Phase { phase: String, reason: String },

    #[error("review rejected after {attempts} retries (last route: {route_to})")]
    RoutingExhausted { attempts: u32, route_to: String },

    #[error("pipeline timed out after {timeout_ms}ms")]
    TimedOut { timeout_ms: u64 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_eligibility() {
        let unavailable = AiError::Unavailable {
            backend: "codex".into(),
            reason: "not installed".into(),
        };
        let auth = AiError::Authentication {
            backend: "codex".into(),
            reason: "401".into(),
        };
        let limited = AiError::RateLimited {
            backend: "codex".into(),
            reason: "429".into(),
        };
        assert!(unavailable.is_fallback_eligible());
        assert!(auth.is_fallback_eligible());
        assert!(!limited.is_fallback_eligible());
    }

    #[test]
    fn test_routing_exhausted_message_names_route() {
        let err = PipelineError::RoutingExhausted {
            attempts: 3,
            route_to: "executor".into(),
        };
        assert!(err.to_string().contains("executor"));
    }
}
