//! # Task State
//!
//! The per-run snapshot persisted after every transition. Terminal status
//! and `completedAt` are only ever set together, by [`TaskState::mark_completed`]
//! and [`TaskState::mark_failed`].

use crate::pipeline::{PipelinePhase, RouteTarget};
use crate::quality::QualityScore;
use crate::squad::Escalation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSource {
    pub from: String,
    pub channel_id: String,
}

/// Times each phase has been entered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseIterations {
    pub planning: u32,
    pub execution: u32,
    pub review: u32,
    pub delivery: u32,
}

impl PhaseIterations {
    pub fn bump(&mut self, phase: PipelinePhase) -> u32 {
        let slot = match phase {
            PipelinePhase::Planning => &mut self.planning,
            PipelinePhase::Execution => &mut self.execution,
            PipelinePhase::Review => &mut self.review,
            PipelinePhase::Delivery => &mut self.delivery,
        };
        *slot += 1;
        *slot
    }

    pub fn get(&self, phase: PipelinePhase) -> u32 {
        match phase {
            PipelinePhase::Planning => self.planning,
            PipelinePhase::Execution => self.execution,
            PipelinePhase::Review => self.review,
            PipelinePhase::Delivery => self.delivery,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PlanBlock {
    pub file: Option<String>,
    pub plan_id: Option<String>,
    pub status: TaskStatus,
    pub quality: Option<QualityScore>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExecutionBlock {
    pub files_changed: Vec<String>,
    pub status: TaskStatus,
    pub quality: Option<QualityScore>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReviewBlock {
    pub status: TaskStatus,
    pub report: Option<String>,
    pub screenshots: Vec<String>,
    pub route_to: Option<RouteTarget>,
    pub quality: Option<QualityScore>,
}

/// Older consumers read review results from here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationBlock {
    pub passed: Option<bool>,
    pub report: Option<String>,
    pub screenshots: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeliveryBlock {
    pub status: TaskStatus,
    pub report_file: Option<String>,
    pub escalations: Vec<Escalation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskState {
    pub id: String,
    pub request: String,
    status: TaskStatus,
    pub phase: PipelinePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<TaskSource>,
    #[serde(default)]
    pub iterations: PhaseIterations,
    #[serde(default)]
    pub plan: PlanBlock,
    #[serde(default)]
    pub execution: ExecutionBlock,
    #[serde(default)]
    pub review: ReviewBlock,
    #[serde(default)]
    pub validation: ValidationBlock,
    #[serde(default)]
    pub delivery: DeliveryBlock,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub requires_human_review: bool,
    pub started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl TaskState {
    pub fn new(id: impl Into<String>, request: impl Into<String>, source: Option<TaskSource>) -> Self {
        Self {
            id: id.into(),
            request: request.into(),
            status: TaskStatus::Pending,
            phase: PipelinePhase::Planning,
            source,
            iterations: PhaseIterations::default(),
            plan: PlanBlock::default(),
            execution: ExecutionBlock::default(),
            review: ReviewBlock::default(),
            validation: ValidationBlock::default(),
            delivery: DeliveryBlock::default(),
            retries: 0,
            requires_human_review: false,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    /// Enter a phase and return how many times it has been entered.
    pub fn enter_phase(&mut self, phase: PipelinePhase) -> u32 {
        self.status = TaskStatus::Running;
        self.phase = phase;
        self.iterations.bump(phase)
    }

    /// Recorded status of the block a phase writes.
    pub fn phase_status(&self, phase: PipelinePhase) -> TaskStatus {
        match phase {
            PipelinePhase::Planning => self.plan.status,
            PipelinePhase::Execution => self.execution.status,
            PipelinePhase::Review => self.review.status,
            PipelinePhase::Delivery => self.delivery.status,
        }
    }

    pub fn mark_completed(&mut self) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
    }

    /// `1m05s` or `42s` since start (or until completion).
    pub fn duration_label(&self) -> String {
        let end = self.completed_at.unwrap_or_else(Utc::now);
        duration_label((end - self.started_at).num_seconds().max(0) as u64)
    }
}

pub fn duration_label(total_seconds: u64) -> String {
    let minutes = total_seconds / 60;
    let seconds = total_seconds % 60;
    if minutes > 0 {
        format!("{minutes}m{seconds:02}s")
    } else {
        format!("{seconds}s")
    }
}
