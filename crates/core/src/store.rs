//! # Run Store
//!
//! Plain-text persistence under the workspace directory:
//!
//! ```text
//! <workspace>/
//!   state/<runId>.json         snapshot per run
//!   state/current-task.json    alias of the most recently saved run
//!   plans/<planId>.json
//!   reports/<runId>.{md,json}
//!   pipeline-log.jsonl
//! ```

use crate::config::ReportFormat;
use crate::error::{StoreError, StoreResult};
use crate::events::PipelineEvent;
use crate::plan::Plan;
use crate::task_state::TaskState;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;

pub const CURRENT_ALIAS: &str = "current-task";
pub const EVENT_LOG: &str = "pipeline-log.jsonl";

#[derive(Debug, Clone)]
pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join(EVENT_LOG)
    }

    pub fn plan_path(&self, plan_id: &str) -> PathBuf {
        self.root.join("plans").join(format!("{plan_id}.json"))
    }

    fn state_path(&self, name: &str) -> PathBuf {
        self.root.join("state").join(format!("{name}.json"))
    }

    /// Persist the snapshot under its run id and refresh the alias.
    pub async fn save_state(&self, state: &TaskState) -> StoreResult<()> {
        let path = self.state_path(checked_id(&state.id)?);
        write_json(&path, state).await?;
        write_json(&self.state_path(CURRENT_ALIAS), state).await
    }

    pub async fn load_state(&self, run_id: &str) -> StoreResult<TaskState> {
        let path = self.state_path(checked_id(run_id)?);
        match read_json(&path).await {
            Err(StoreError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(run_id.to_string()))
            }
            other => other,
        }
    }

    pub async fn load_current(&self) -> StoreResult<TaskState> {
        self.load_state(CURRENT_ALIAS).await
    }

    /// Write the plan and return the file reference execution reads back.
    pub async fn save_plan(&self, plan: &Plan) -> StoreResult<PathBuf> {
        let path = self.plan_path(checked_id(plan.id())?);
        write_json(&path, plan).await?;
        Ok(path)
    }

    pub async fn load_plan(&self, path: &Path) -> StoreResult<Plan> {
        read_json(path).await
    }

    pub async fn write_report(
        &self,
        run_id: &str,
        format: ReportFormat,
        content: &str,
    ) -> StoreResult<PathBuf> {
        let path = self
            .root
            .join("reports")
            .join(format!("{}.{}", checked_id(run_id)?, format.extension()));
        write_text(&path, content).await?;
        Ok(path)
    }

    /// Events from the log, optionally only the last `tail`. Malformed lines are skipped.
    pub async fn read_events(&self, tail: Option<usize>) -> StoreResult<Vec<PipelineEvent>> {
        let path = self.log_path();
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        let events: Vec<PipelineEvent> = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        Ok(match tail {
            Some(n) if n < events.len() => events[events.len() - n..].to_vec(),
            _ => events,
        })
    }

    /// Run ids with a saved snapshot, excluding the alias.
    pub async fn list_runs(&self) -> StoreResult<Vec<String>> {
        let dir = self.root.join("state");
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StoreError::Io { path: dir, source }),
        };

        let mut runs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| StoreError::Io {
                path: dir.clone(),
                source,
            })?
        {
            if let Some(name) = entry.file_name().to_str().and_then(|n| n.strip_suffix(".json")) {
                if name != CURRENT_ALIAS {
                    runs.push(name.to_string());
                }
            }
        }
        runs.sort();
        Ok(runs)
    }
}

/// Ids become file names, so path separators and dot segments are refused.
fn checked_id(id: &str) -> StoreResult<&str> {
    let valid = !id.is_empty()
        && id != "."
        && id != ".."
        && !id.contains(['/', '\\'])
        && !id.contains("..");
    if valid {
        Ok(id)
    } else {
        Err(StoreError::NotFound(id.to_string()))
    }
}

async fn write_text(path: &Path, content: &str) -> StoreResult<()> {
    let io = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(io)?;
    }
    fs::write(path, content).await.map_err(io)
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    let content = serde_json::to_string_pretty(value).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    write_text(path, &content).await
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> StoreResult<T> {
    let content = fs::read_to_string(path).await.map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })
}
