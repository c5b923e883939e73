//! Replays prepared replies per member.
//!
//! Each member has a queue; the last entry repeats once the queue is
//! drained. Used to replay recorded transcripts and to drive tests.

use super::{AiBackend, AiRequest};
use crate::error::AiError;
use crate::models::Member;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone)]
enum Scripted {
    Text(String),
    Fail(String),
}

#[derive(Debug, Default)]
struct Script {
    replies: HashMap<Member, Vec<Scripted>>,
    calls: HashMap<Member, usize>,
    prompts: Vec<(Member, String)>,
}

#[derive(Debug, Default)]
pub struct ScriptedBackend {
    script: Mutex<Script>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, member: Member, reply: Scripted) -> Self {
        if let Ok(script) = self.script.get_mut() {
            script.replies.entry(member).or_default().push(reply);
        }
        self
    }

    /// Queue a JSON reply.
    pub fn reply(self, member: Member, value: Value) -> Self {
        self.push(member, Scripted::Text(value.to_string()))
    }

    /// Queue raw reply text, which need not be valid JSON.
    pub fn text(self, member: Member, text: impl Into<String>) -> Self {
        self.push(member, Scripted::Text(text.into()))
    }

    /// Queue a backend failure.
    pub fn fail(self, member: Member, reason: impl Into<String>) -> Self {
        self.push(member, Scripted::Fail(reason.into()))
    }

    /// Load a transcript of the form `{"<member>": [reply, ...], ...}`.
    pub fn from_transcript(transcript: &Value) -> Result<Self, String> {
        let members = transcript
            .as_object()
            .ok_or_else(|| "transcript must be an object keyed by member".to_string())?;
        let mut backend = Self::new();
        for (name, replies) in members {
            let member: Member = serde_json::from_value(Value::String(name.clone()))
                .map_err(|_| format!("unknown member `{name}`"))?;
            for reply in replies.as_array().into_iter().flatten() {
                backend = match reply {
                    Value::String(text) => backend.text(member, text.clone()),
                    other => backend.reply(member, other.clone()),
                };
            }
        }
        Ok(backend)
    }

    pub fn calls(&self, member: Member) -> usize {
        self.script
            .lock()
            .map(|s| s.calls.get(&member).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Prompts sent to `member`, oldest first.
    pub fn prompts(&self, member: Member) -> Vec<String> {
        self.script
            .lock()
            .map(|s| {
                s.prompts
                    .iter()
                    .filter(|(m, _)| *m == member)
                    .map(|(_, p)| p.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl AiBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn complete(&self, request: &AiRequest) -> Result<String, AiError> {
        let mut script = self.script.lock().map_err(|_| AiError::Backend {
            backend: self.name().to_string(),
            reason: "script lock poisoned".to_string(),
        })?;

        let call = {
            let count = script.calls.entry(request.member).or_insert(0);
            *count += 1;
            *count
        };
        script.prompts.push((request.member, request.prompt.clone()));

        let reply = script.replies.get(&request.member).and_then(|queue| {
            queue
                .get(call - 1)
                .or_else(|| queue.last())
                .cloned()
        });

        match reply {
            Some(Scripted::Text(text)) => Ok(text),
            Some(Scripted::Fail(reason)) => Err(AiError::Backend {
                backend: self.name().to_string(),
                reason,
            }),
            None => Err(AiError::Backend {
                backend: self.name().to_string(),
                reason: format!("no scripted reply for {}", request.member),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_queue_then_repeat_last() {
        let backend = ScriptedBackend::new()
            .reply(Member::Critic, json!({"status": "reject"}))
            .reply(Member::Critic, json!({"status": "pass"}));
        let request = AiRequest::new(Member::Critic, "s", "p");

        assert!(backend.complete(&request).await.unwrap().contains("reject"));
        assert!(backend.complete(&request).await.unwrap().contains("pass"));
        assert!(backend.complete(&request).await.unwrap().contains("pass"));
        assert_eq!(backend.calls(Member::Critic), 3);
        assert_eq!(backend.calls(Member::Planner), 0);
    }

    #[tokio::test]
    async fn test_unscripted_member_fails() {
        let backend = ScriptedBackend::new().fail(Member::Coder, "boom");
        let err = backend
            .complete(&AiRequest::new(Member::Coder, "s", "p"))
            .await
            .unwrap_err();
        assert!(matches!(err, AiError::Backend { ref reason, .. } if reason == "boom"));

        let err = backend
            .complete(&AiRequest::new(Member::Planner, "s", "p"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no scripted reply"));
    }

    #[tokio::test]
    async fn test_transcript_loading() {
        let backend = ScriptedBackend::from_transcript(&json!({
            "final-approver": [{"status": "approved"}],
            "coder": ["```json\n{\"files\": []}\n```"]
        }))
        .unwrap();
        let reply = backend
            .complete(&AiRequest::new(Member::Coder, "s", "p"))
            .await
            .unwrap();
        assert!(reply.starts_with("```json"));

        assert!(ScriptedBackend::from_transcript(&json!({"intern": []})).is_err());
    }
}
