//! Codex CLI backend.
//!
//! Runs `codex exec --json --full-auto` and takes the last `agent_message`
//! from its JSONL stream. Availability is probed once with `--version`.

use super::radkit_backend::classify_failure;
use super::{AiBackend, AiRequest};
use crate::config::CodexConfig;
use crate::error::AiError;
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::OnceCell;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct CodexBackend {
    program: String,
    model: String,
    timeout: Duration,
    cwd: PathBuf,
    available: OnceCell<Result<(), String>>,
}

impl CodexBackend {
    pub fn new(config: &CodexConfig, cwd: PathBuf) -> Self {
        Self {
            program: "codex".to_string(),
            model: config.model.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            cwd,
            available: OnceCell::new(),
        }
    }

    /// Use a different executable (a wrapper script or a test double).
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    async fn probe(&self) -> Result<(), String> {
        let status = Command::new(&self.program)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();
        match tokio::time::timeout(PROBE_TIMEOUT, status).await {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(format!("`{} --version` exited with {status}", self.program)),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(format!("`{}` is not installed", self.program))
            }
            Ok(Err(e)) => Err(format!("could not run `{}`: {e}", self.program)),
            Err(_) => Err(format!("`{} --version` timed out", self.program)),
        }
    }

    pub async fn is_available(&self) -> Result<(), AiError> {
        self.available
            .get_or_init(|| self.probe())
            .await
            .clone()
            .map_err(|reason| AiError::Unavailable {
                backend: self.name().to_string(),
                reason,
            })
    }

    fn args(&self, prompt: String) -> Vec<String> {
        vec![
            "exec".into(),
            "--json".into(),
            "--full-auto".into(),
            "--skip-git-repo-check".into(),
            "--model".into(),
            self.model.clone(),
            "-C".into(),
            self.cwd.to_string_lossy().into_owned(),
            prompt,
        ]
    }
}

#[async_trait]
impl AiBackend for CodexBackend {
    fn name(&self) -> &'static str {
        "codex"
    }

    async fn complete(&self, request: &AiRequest) -> Result<String, AiError> {
        self.is_available().await?;

        let prompt = format!("{}\n\n{}", request.system, request.prompt);
        let output = Command::new(&self.program)
            .args(self.args(prompt))
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, output).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AiError::Unavailable {
                    backend: self.name().to_string(),
                    reason: e.to_string(),
                })
            }
            Ok(Err(e)) => {
                return Err(AiError::Backend {
                    backend: self.name().to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(AiError::Timeout {
                    member: request.member.to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if output.status.success() {
            return Ok(final_agent_message(&stdout));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = if stderr.trim().is_empty() {
            format!("codex exited with {}", output.status)
        } else {
            stderr.into_owned()
        };
        Err(classify_failure(self.name(), &message))
    }
}

/// The text of the last `item.completed` agent message, or all of stdout.
pub fn final_agent_message(stdout: &str) -> String {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .find(|event| {
            event["type"] == "item.completed" && event["item"]["type"] == "agent_message"
        })
        .and_then(|event| event["item"]["text"].as_str().map(str::to_string))
        .unwrap_or_else(|| stdout.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Member;

    #[test]
    fn test_final_agent_message() {
        let stdout = concat!(
            "{\"type\":\"thread.started\"}\n",
            "{\"type\":\"item.completed\",\"item\":{\"type\":\"agent_message\",\"text\":\"first\"}}\n",
            "not json\n",
            "{\"type\":\"item.completed\",\"item\":{\"type\":\"agent_message\",\"text\":\"{\\\"status\\\":\\\"pass\\\"}\"}}\n",
            "{\"type\":\"turn.completed\"}\n",
        );
        assert_eq!(final_agent_message(stdout), "{\"status\":\"pass\"}");
    }

    #[test]
    fn test_plain_output_passes_through() {
        assert_eq!(final_agent_message("plain text"), "plain text");
    }

    #[test]
    fn test_args_shape() {
        let backend = CodexBackend::new(&CodexConfig::default(), PathBuf::from("/tmp/project"));
        let args = backend.args("do it".into());
        assert_eq!(&args[..4], ["exec", "--json", "--full-auto", "--skip-git-repo-check"]);
        assert_eq!(args[5], "gpt-5");
        assert_eq!(args[7], "/tmp/project");
        assert_eq!(args.last().map(String::as_str), Some("do it"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let backend = CodexBackend::new(&CodexConfig::default(), std::env::temp_dir())
            .with_program("devteam-no-such-codex-binary");
        let request = AiRequest::new(Member::Coder, "system", "prompt");

        let err = backend.complete(&request).await.unwrap_err();
        assert!(matches!(err, AiError::Unavailable { .. }));
        assert!(err.is_fallback_eligible());
    }
}
