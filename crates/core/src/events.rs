//! # Pipeline Events
//!
//! Append-only structured events. Every event is written as one JSON line
//! to `pipeline-log.jsonl`, kept in memory for quality scoring, and
//! optionally forwarded to a channel for live observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

/// Well-known event names.
pub mod kind {
    pub const PIPELINE_START: &str = "pipeline:start";
    pub const PIPELINE_COMPLETE: &str = "pipeline:complete";
    pub const PIPELINE_FAILED: &str = "pipeline:failed";
    pub const PHASE_ENTER: &str = "phase:enter";
    pub const PHASE_COMPLETE: &str = "phase:complete";
    pub const ROUTE: &str = "pipeline:route";
    pub const SQUAD_START: &str = "squad:start";
    pub const SQUAD_MODE: &str = "squad:mode";
    pub const SQUAD_COMPLETE: &str = "squad:complete";
    pub const MEMBER_START: &str = "member:start";
    pub const MEMBER_COMPLETE: &str = "member:complete";
    pub const QUALITY_CHECK: &str = "quality:check";
    pub const QUALITY_SCORE: &str = "quality:score";
    pub const REWORK_START: &str = "rework:start";
    pub const REWORK_COMPLETE: &str = "rework:complete";
    pub const ESCALATION: &str = "escalation:requires_review";
    pub const FILES_WRITTEN: &str = "files:written";
    pub const TEST_RESULT: &str = "test:result";
    pub const TEST_ERROR: &str = "test:error";
    pub const DEPS_INSTALL: &str = "deps:install";
    pub const DEPS_COMPLETE: &str = "deps:complete";
    pub const DEPS_ERROR: &str = "deps:error";
    pub const DELIVERY_COMPLETE: &str = "delivery:complete";
    pub const AI_FALLBACK: &str = "ai:fallback";
    pub const AI_FALLBACK_DISABLED: &str = "ai:fallback_disabled";
    pub const CONTEXT_DEGRADED: &str = "context:degraded";
}

/// A single timestamped event with free-form fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub ts: DateTime<Utc>,
    pub event: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl PipelineEvent {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            event: event.into(),
            fields: Map::new(),
        }
    }

    /// `<member>:error` for a failed member invocation.
    pub fn member_error(member: &str, error: impl std::fmt::Display) -> Self {
        Self::new(format!("{member}:error")).with("error", error.to_string())
    }

    /// Attach a field. Values that cannot be serialized are stored as null.
    pub fn with(mut self, key: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.fields.insert(key.to_string(), value);
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.field(key).and_then(Value::as_str)
    }

    pub fn is(&self, event: &str) -> bool {
        self.event == event
    }

    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"event\":\"{}\"}}", self.event))
    }
}

/// Destination for pipeline events.
#[derive(Debug, Default)]
pub struct EventLog {
    path: Option<PathBuf>,
    history: Vec<PipelineEvent>,
    context: Map<String, Value>,
    tx: Option<mpsc::UnboundedSender<PipelineEvent>>,
}

impl EventLog {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Events are appended to `path` as NDJSON.
    pub fn to_file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn with_channel(mut self, tx: mpsc::UnboundedSender<PipelineEvent>) -> Self {
        self.tx = Some(tx);
        self
    }

    /// Fields stamped onto every subsequent event (e.g. the run id).
    pub fn set_context(&mut self, key: &str, value: impl Serialize) {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.context.insert(key.to_string(), value);
    }

    /// Record an event. A failed disk write is logged and otherwise ignored.
    pub async fn emit(&mut self, mut event: PipelineEvent) {
        for (key, value) in &self.context {
            event
                .fields
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }

        tracing::debug!(event = %event.event, "pipeline event");

        if let Some(path) = &self.path {
            if let Err(e) = append_line(path, &event.to_line()).await {
                tracing::warn!(path = %path.display(), error = %e, "Failed to append pipeline event");
            }
        }
        if let Some(tx) = &self.tx {
            // A closed receiver only means nobody is watching.
            let _ = tx.send(event.clone());
        }
        self.history.push(event);
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn events(&self) -> &[PipelineEvent] {
        &self.history
    }

    /// Events recorded at or after `index`.
    pub fn since(&self, index: usize) -> &[PipelineEvent] {
        self.history.get(index..).unwrap_or(&[])
    }

    pub fn count(&self, event: &str) -> usize {
        self.history.iter().filter(|e| e.is(event)).count()
    }
}

async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(format!("{line}\n").as_bytes()).await?;
    file.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_creation() {
        let event = PipelineEvent::new(kind::SQUAD_MODE)
            .with("mode", "simple")
            .with("members", vec!["planner"]);

        assert_eq!(event.event, "squad:mode");
        assert_eq!(event.str_field("mode"), Some("simple"));
        assert_eq!(event.field("members"), Some(&serde_json::json!(["planner"])));
    }

    #[test]
    fn test_fields_flatten_into_line() {
        let line = PipelineEvent::new("phase:enter").with("phase", "planning").to_line();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["event"], "phase:enter");
        assert_eq!(value["phase"], "planning");
        assert!(value["ts"].is_string());

        let parsed: PipelineEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.str_field("phase"), Some("planning"));
    }

    #[test]
    fn test_member_error_name() {
        let event = PipelineEvent::member_error("critic", "boom");
        assert_eq!(event.event, "critic:error");
        assert_eq!(event.str_field("error"), Some("boom"));
    }

    #[tokio::test]
    async fn test_log_appends_ndjson_with_context() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("pipeline-log.jsonl");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut log = EventLog::to_file(&path).with_channel(tx);
        log.set_context("runId", "task-1");

        log.emit(PipelineEvent::new(kind::SQUAD_START)).await;
        log.emit(PipelineEvent::new(kind::SQUAD_COMPLETE).with("runId", "explicit"))
            .await;

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"runId\":\"task-1\""));
        assert!(lines[1].contains("\"runId\":\"explicit\""));

        assert_eq!(rx.recv().await.unwrap().event, "squad:start");
        assert_eq!(log.count(kind::SQUAD_START), 1);
        assert_eq!(log.since(1).len(), 1);
        assert!(log.since(5).is_empty());
    }
}
