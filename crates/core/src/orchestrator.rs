//! # Orchestrator
//!
//! Drives one run through planning, execution, review and delivery.
//!
//! ```text
//! planning -> execution -> review -> delivery
//!    ^            ^          |
//!    +-- planner -+-executor-+  (bounded by max_retries)
//! ```
//!
//! State is persisted on every phase transition and every step is logged
//! to `pipeline-log.jsonl`. A run is strictly sequential.

use crate::ai::AiClient;
use crate::config::{DevTeamConfig, ProviderKind, ReportFormat};
use crate::context::ProjectContext;
use crate::error::PipelineError;
use crate::events::{kind, EventLog, PipelineEvent};
use crate::pipeline::{PipelinePhase, RetryBudget, RouteDecision, RouteTarget};
use crate::plan::Plan;
use crate::quality::{QualityScore, QualityStatus};
use crate::squad::{
    Escalation, ExecutionInput, ExecutionOutput, ExecutionSquad, Issue, PlanInput, PlanSquad,
    ReviewInput, ReviewSquad,
};
use crate::store::RunStore;
use crate::task_state::{
    DeliveryBlock, ExecutionBlock, PlanBlock, ReviewBlock, TaskSource, TaskState, TaskStatus,
    ValidationBlock,
};
use crate::tooling::{CommandToolchain, Toolchain};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// What starts a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TriggerPayload {
    pub request: String,
    pub requester: Option<String>,
    pub channel_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl TriggerPayload {
    pub fn new(request: impl Into<String>) -> Self {
        Self {
            request: request.into(),
            ..Default::default()
        }
    }

    fn source(&self) -> Option<TaskSource> {
        if self.requester.is_none() && self.channel_id.is_none() {
            return None;
        }
        Some(TaskSource {
            from: self.requester.clone().unwrap_or_default(),
            channel_id: self.channel_id.clone().unwrap_or_default(),
        })
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub run_id: String,
    pub success: bool,
    pub status: TaskStatus,
    pub plan_id: Option<String>,
    pub files_changed: Vec<String>,
    pub quality_grade: Option<String>,
    pub route_to: Option<RouteTarget>,
    pub requires_human_review: bool,
    pub report_file: Option<String>,
    pub error: Option<String>,
    pub duration: String,
}

impl RunOutcome {
    pub fn from_state(state: &TaskState) -> Self {
        Self {
            run_id: state.id.clone(),
            success: state.status() == TaskStatus::Completed,
            status: state.status(),
            plan_id: state.plan.plan_id.clone(),
            files_changed: state.execution.files_changed.clone(),
            quality_grade: headline_quality(state).map(|q| q.grade.as_str().to_string()),
            route_to: state.review.route_to,
            requires_human_review: state.requires_human_review,
            report_file: state.delivery.report_file.clone(),
            error: state.error.clone(),
            duration: state.duration_label(),
        }
    }
}

/// Review quality when review ran, execution quality otherwise.
fn headline_quality(state: &TaskState) -> Option<&QualityScore> {
    state
        .review
        .quality
        .as_ref()
        .or(state.execution.quality.as_ref())
}

pub fn new_run_id() -> String {
    format!("task-{}", uuid::Uuid::new_v4().simple())
}

/// Summary written to `reports/<runId>` on delivery.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReport<'a> {
    pub run_id: &'a str,
    pub request: &'a str,
    pub plan_id: Option<&'a str>,
    pub files_changed: &'a [String],
    pub plan_quality: Option<&'a QualityScore>,
    pub execution_quality: Option<&'a QualityScore>,
    pub review_quality: Option<&'a QualityScore>,
    pub retries: u32,
    pub escalations: &'a [Escalation],
    pub review: Option<&'a str>,
}

impl<'a> DeliveryReport<'a> {
    fn new(state: &'a TaskState, escalations: &'a [Escalation]) -> Self {
        Self {
            run_id: &state.id,
            request: &state.request,
            plan_id: state.plan.plan_id.as_deref(),
            files_changed: &state.execution.files_changed,
            plan_quality: state.plan.quality.as_ref(),
            execution_quality: state.execution.quality.as_ref(),
            review_quality: state.review.quality.as_ref(),
            retries: state.retries,
            escalations,
            review: state.review.report.as_deref(),
        }
    }

    pub fn render(&self, format: ReportFormat) -> String {
        match format {
            ReportFormat::Json => serde_json::to_string_pretty(self).unwrap_or_default(),
            ReportFormat::Markdown => self.to_markdown(),
        }
    }

    fn to_markdown(&self) -> String {
        let mut out = format!("# Delivery report: {}\n\n> {}\n\n", self.run_id, self.request);
        if let Some(plan_id) = self.plan_id {
            let _ = writeln!(out, "- Plan: `{plan_id}`");
        }
        let _ = writeln!(out, "- Review retries: {}", self.retries);
        for (label, score) in [
            ("Plan", self.plan_quality),
            ("Execution", self.execution_quality),
            ("Review", self.review_quality),
        ] {
            if let Some(score) = score {
                let _ = writeln!(
                    out,
                    "- {label} quality: {} ({}, {})",
                    score.overall,
                    score.grade.as_str(),
                    score.status.as_str()
                );
            }
        }

        let _ = writeln!(out, "\n## Files changed\n");
        if self.files_changed.is_empty() {
            out.push_str("None\n");
        }
        for file in self.files_changed {
            let _ = writeln!(out, "- `{file}`");
        }

        if !self.escalations.is_empty() {
            let _ = writeln!(out, "\n## Requires human review\n");
            for escalation in self.escalations {
                let _ = writeln!(
                    out,
                    "- {} squad: {} after {} rework iterations",
                    escalation.squad, escalation.reason, escalation.iterations
                );
                for issue in &escalation.outstanding {
                    let _ = writeln!(out, "  - {}", issue.render());
                }
            }
        }

        if let Some(review) = self.review {
            let _ = writeln!(out, "\n{review}");
        }
        out
    }
}

pub struct Orchestrator {
    config: DevTeamConfig,
    ai: AiClient,
    toolchain: Arc<dyn Toolchain>,
    store: RunStore,
    observer: Option<mpsc::UnboundedSender<PipelineEvent>>,
}

/// What the phases hand each other within one run.
#[derive(Default)]
struct RunProgress {
    plan: Option<(Plan, PathBuf)>,
    execution: Option<ExecutionOutput>,
    review_feedback: Vec<Issue>,
    escalations: Vec<Escalation>,
}

impl Orchestrator {
    pub fn new(config: DevTeamConfig, ai: AiClient, toolchain: Arc<dyn Toolchain>) -> Self {
        let store = RunStore::new(config.workspace.clone());
        Self {
            config,
            ai,
            toolchain,
            store,
            observer: None,
        }
    }

    /// Production wiring: the configured AI backend and the real toolchain.
    pub fn from_config(config: DevTeamConfig, provider: Option<ProviderKind>) -> Self {
        let kind = provider.unwrap_or(config.provider.default);
        let ai = AiClient::from_config(&config.provider, kind, config.project_root.clone());
        tracing::info!(backend = ai.backend_name(), "AI backend selected");
        Self::new(config, ai, Arc::new(CommandToolchain))
    }

    /// Forward every event to `tx` as well as the log file.
    pub fn with_observer(mut self, tx: mpsc::UnboundedSender<PipelineEvent>) -> Self {
        self.observer = Some(tx);
        self
    }

    pub fn config(&self) -> &DevTeamConfig {
        &self.config
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    pub async fn run(&self, trigger: TriggerPayload) -> RunOutcome {
        self.run_with_id(new_run_id(), trigger).await
    }

    /// Run to completion under the global timeout. Never panics on pipeline
    /// failures; they are reported in the outcome.
    #[tracing::instrument(skip_all, fields(run_id = %run_id))]
    pub async fn run_with_id(&self, run_id: String, trigger: TriggerPayload) -> RunOutcome {
        let mut state = TaskState::new(&run_id, trigger.request.trim(), trigger.source());
        let mut log = EventLog::to_file(self.store.log_path());
        if let Some(tx) = &self.observer {
            log = log.with_channel(tx.clone());
        }
        log.set_context("runId", &run_id);

        tracing::info!(request = %state.request, "Pipeline started");
        log.emit(
            PipelineEvent::new(kind::PIPELINE_START)
                .with("request", &state.request)
                .with("requester", &trigger.requester)
                .with("channelId", &trigger.channel_id),
        )
        .await;

        let timeout_ms = self.config.timeout_ms;
        let result = match tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.drive(&mut state, &mut log),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(PipelineError::TimedOut { timeout_ms }),
        };

        match result {
            Ok(()) => {
                state.mark_completed();
                self.persist(&state).await;
                tracing::info!(duration = %state.duration_label(), "Pipeline completed");
                log.emit(
                    PipelineEvent::new(kind::PIPELINE_COMPLETE)
                        .with("status", "success")
                        .with("duration", state.duration_label())
                        .with("filesChanged", state.execution.files_changed.len()),
                )
                .await;
            }
            Err(e) => {
                tracing::error!(phase = %state.phase, error = %e, "Pipeline failed");
                state.mark_failed(e.to_string());
                self.persist(&state).await;
                log.emit(
                    PipelineEvent::new(kind::PIPELINE_FAILED)
                        .with("phase", state.phase)
                        .with("error", e.to_string()),
                )
                .await;
            }
        }
        RunOutcome::from_state(&state)
    }

    async fn drive(&self, state: &mut TaskState, log: &mut EventLog) -> Result<(), PipelineError> {
        let mut budget = RetryBudget::new(self.config.max_retries);
        let mut progress = RunProgress::default();
        let mut phase = PipelinePhase::Planning;

        loop {
            self.enter(state, phase, log).await?;
            match phase {
                PipelinePhase::Planning => self.planning(state, &mut progress, log).await?,
                PipelinePhase::Execution => self.execution(state, &mut progress, log).await?,
                PipelinePhase::Review => {
                    if let Some(route) = self.review(state, &mut progress, log).await? {
                        self.complete(state, phase, log).await?;
                        match budget.reject(route) {
                            RouteDecision::Retry(target) => {
                                state.retries = budget.attempts();
                                tracing::warn!(%route, attempt = budget.attempts(), "Routing rejected review");
                                log.emit(
                                    PipelineEvent::new(kind::ROUTE)
                                        .with("from", PipelinePhase::Review)
                                        .with("to", route)
                                        .with("attempt", budget.attempts())
                                        .with("reason", "review_rejected"),
                                )
                                .await;
                                phase = target;
                                continue;
                            }
                            RouteDecision::Exhausted { attempts, route_to } => {
                                return Err(PipelineError::RoutingExhausted {
                                    attempts,
                                    route_to: route_to.to_string(),
                                });
                            }
                        }
                    }
                }
                PipelinePhase::Delivery => self.delivery(state, &progress, log).await?,
            }
            self.complete(state, phase, log).await?;
            match phase.next() {
                Some(next) => phase = next,
                None => return Ok(()),
            }
        }
    }

    async fn enter(&self, state: &mut TaskState, phase: PipelinePhase, log: &mut EventLog) -> Result<(), PipelineError> {
        let iteration = state.enter_phase(phase);
        self.store.save_state(state).await?;
        tracing::info!(%phase, iteration, "Entering phase");
        log.emit(
            PipelineEvent::new(kind::PHASE_ENTER)
                .with("phase", phase)
                .with("iteration", iteration),
        )
        .await;
        Ok(())
    }

    async fn complete(&self, state: &TaskState, phase: PipelinePhase, log: &mut EventLog) -> Result<(), PipelineError> {
        self.store.save_state(state).await?;
        log.emit(
            PipelineEvent::new(kind::PHASE_COMPLETE)
                .with("phase", phase)
                .with("status", state.phase_status(phase).as_str()),
        )
        .await;
        Ok(())
    }

    async fn persist(&self, state: &TaskState) {
        if let Err(e) = self.store.save_state(state).await {
            tracing::error!(error = %e, "Failed to persist final run state");
        }
    }

    /// Scan the project; an unreadable root degrades to an empty context.
    async fn context(&self, phase: PipelinePhase, log: &mut EventLog) -> ProjectContext {
        let root = &self.config.project_root;
        match ProjectContext::gather(root).await {
            Ok(context) => context,
            Err(e) => {
                tracing::warn!(%phase, error = %e, "Project context unavailable");
                log.emit(
                    PipelineEvent::new(kind::CONTEXT_DEGRADED)
                        .with("phase", phase)
                        .with("error", format!("{e:#}")),
                )
                .await;
                ProjectContext::empty(root.clone())
            }
        }
    }

    async fn planning(
        &self,
        state: &mut TaskState,
        progress: &mut RunProgress,
        log: &mut EventLog,
    ) -> Result<(), PipelineError> {
        let context = self.context(PipelinePhase::Planning, log).await;
        let input = PlanInput {
            task_id: state.id.clone(),
            request: state.request.clone(),
            context,
            review_feedback: std::mem::take(&mut progress.review_feedback),
        };
        let run = PlanSquad::new(self.ai.clone(), self.config.plan.clone())
            .run(&input, log)
            .await;

        if run.artifact.is_empty() {
            return Err(PipelineError::Phase {
                phase: PipelinePhase::Planning.to_string(),
                reason: "the plan has no tasks".to_string(),
            });
        }

        let path = self.store.save_plan(&run.artifact).await?;
        tracing::info!(plan_id = run.artifact.id(), tasks = run.artifact.tasks.len(), "Plan saved");
        state.plan = PlanBlock {
            file: Some(path.display().to_string()),
            plan_id: Some(run.artifact.id().to_string()),
            status: TaskStatus::Completed,
            quality: Some(run.quality),
        };
        // A new plan supersedes whatever was built from the old one.
        state.execution = ExecutionBlock::default();
        progress.execution = None;
        flag(state, progress, run.escalation);
        progress.plan = Some((run.artifact, path));
        Ok(())
    }

    async fn execution(
        &self,
        state: &mut TaskState,
        progress: &mut RunProgress,
        log: &mut EventLog,
    ) -> Result<(), PipelineError> {
        let Some((_, path)) = &progress.plan else {
            return Err(PipelineError::Phase {
                phase: PipelinePhase::Execution.to_string(),
                reason: "no plan to execute".to_string(),
            });
        };
        let plan_file = path.clone();
        let plan = self.store.load_plan(&plan_file).await?;
        let context = self.context(PipelinePhase::Execution, log).await;

        let input = ExecutionInput {
            request: state.request.clone(),
            plan,
            plan_file: Some(plan_file),
            context,
            review_feedback: std::mem::take(&mut progress.review_feedback),
        };
        let run = ExecutionSquad::new(self.ai.clone(), self.toolchain.clone(), self.config.execution.clone())
            .run(&input, log)
            .await;

        tracing::info!(
            mode = run.mode.as_str(),
            files = run.artifact.files_changed.len(),
            approved = run.approved,
            "Execution finished"
        );
        state.execution = ExecutionBlock {
            files_changed: run.artifact.files_changed.clone(),
            status: if run.quality.status == QualityStatus::Fail {
                TaskStatus::Failed
            } else {
                TaskStatus::Completed
            },
            quality: Some(run.quality),
        };
        flag(state, progress, run.escalation);
        progress.execution = Some(run.artifact);
        Ok(())
    }

    /// Returns the route when the review rejected the run.
    async fn review(
        &self,
        state: &mut TaskState,
        progress: &mut RunProgress,
        log: &mut EventLog,
    ) -> Result<Option<RouteTarget>, PipelineError> {
        let (Some((plan, _)), Some(execution)) = (&progress.plan, &progress.execution) else {
            return Err(PipelineError::Phase {
                phase: PipelinePhase::Review.to_string(),
                reason: "nothing was executed".to_string(),
            });
        };
        let context = self.context(PipelinePhase::Review, log).await;
        let input = ReviewInput {
            request: state.request.clone(),
            plan: plan.clone(),
            execution: execution.clone(),
            context,
        };
        let outcome = ReviewSquad::new(self.ai.clone(), self.toolchain.clone(), self.config.review.clone())
            .run(&input, log)
            .await;

        let report = outcome.report();
        state.review = ReviewBlock {
            status: if outcome.approved {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            },
            report: Some(report.clone()),
            screenshots: Vec::new(),
            route_to: outcome.route_to,
            quality: Some(outcome.quality.clone()),
        };
        state.validation = ValidationBlock {
            passed: Some(outcome.approved),
            report: Some(report),
            screenshots: Vec::new(),
        };
        flag(state, progress, outcome.escalation.clone());

        if outcome.approved {
            return Ok(None);
        }
        match outcome.route_to {
            Some(route) => {
                progress.review_feedback = outcome.issues;
                Ok(Some(route))
            }
            None => Err(PipelineError::Phase {
                phase: PipelinePhase::Review.to_string(),
                reason: "review rejected the run and routing is disabled".to_string(),
            }),
        }
    }

    async fn delivery(
        &self,
        state: &mut TaskState,
        progress: &RunProgress,
        log: &mut EventLog,
    ) -> Result<(), PipelineError> {
        let format = self.config.report_format;
        let content = DeliveryReport::new(state, &progress.escalations).render(format);
        let report_file = self.store.write_report(&state.id, format, &content).await?;

        state.delivery = DeliveryBlock {
            status: TaskStatus::Completed,
            report_file: Some(report_file.display().to_string()),
            escalations: progress.escalations.clone(),
        };
        if !progress.escalations.is_empty() {
            tracing::warn!(count = progress.escalations.len(), "Delivered with work flagged for human review");
        }

        log.emit(
            PipelineEvent::new(kind::DELIVERY_COMPLETE)
                .with("filesChanged", &state.execution.files_changed)
                .with(
                    "qualityGrade",
                    headline_quality(state).map(|q| q.grade.as_str()),
                )
                .with("planId", &state.plan.plan_id)
                .with("requiresHumanReview", state.requires_human_review),
        )
        .await;
        Ok(())
    }
}

fn flag(state: &mut TaskState, progress: &mut RunProgress, escalation: Option<Escalation>) {
    if let Some(escalation) = escalation {
        state.requires_human_review = true;
        progress.escalations.push(escalation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{AiBackend, AiRequest, ScriptedBackend};
    use crate::error::AiError;
    use crate::models::Member;
    use crate::quality::QualityThresholds;
    use crate::testing::{
        approver_approved, client, code_review_pass, coder_reply, critic_pass, planner_reply,
        qa_passed, reviewer_pass, reviewer_reject, summary, ScriptedToolchain,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        config: DevTeamConfig,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("project");
        std::fs::create_dir_all(&project).unwrap();
        std::fs::write(project.join("package.json"), r#"{"dependencies": {"react": "18"}}"#).unwrap();
        let config = DevTeamConfig {
            workspace: dir.path().join("workspace"),
            project_root: project,
            ..Default::default()
        };
        Harness { _dir: dir, config }
    }

    fn orchestrator(config: &DevTeamConfig, ai: AiClient, tools: ScriptedToolchain) -> Orchestrator {
        Orchestrator::new(config.clone(), ai, Arc::new(tools))
    }

    fn names(log: &[PipelineEvent]) -> Vec<String> {
        log.iter()
            .filter(|e| e.event.starts_with("pipeline:") || e.event.starts_with("phase:"))
            .map(|e| match e.str_field("phase") {
                Some(phase) => format!("{}:{phase}", e.event),
                None => e.event.clone(),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_single_task_run_delivers() {
        let h = harness();
        let (ai, backend) = client(
            ScriptedBackend::new()
                .reply(Member::Planner, planner_reply(1))
                .reply(Member::Coder, coder_reply(&["src/Button.tsx"], &[]))
                .reply(Member::Reviewer, reviewer_pass()),
        );
        let orch = orchestrator(&h.config, ai, ScriptedToolchain::new());

        let outcome = orch.run(TriggerPayload::new("Add a button")).await;

        assert!(outcome.success, "{:?}", outcome.error);
        assert!(outcome.run_id.starts_with("task-"));
        assert_eq!(outcome.files_changed, vec!["src/Button.tsx"]);
        assert!(!outcome.requires_human_review);
        assert_eq!(backend.calls(Member::Critic), 0);
        assert_eq!(backend.calls(Member::CodeReviewer), 0);
        assert_eq!(backend.calls(Member::QaTester), 0);

        let state = orch.store().load_current().await.unwrap();
        assert_eq!(state.id, outcome.run_id);
        assert_eq!(state.status(), TaskStatus::Completed);
        assert!(state.completed_at().is_some());
        assert_eq!(state.iterations.planning, 1);
        assert_eq!(state.iterations.delivery, 1);
        assert_eq!(state.validation.passed, Some(true));

        let plan_file = PathBuf::from(state.plan.file.unwrap());
        let plan = orch.store().load_plan(&plan_file).await.unwrap();
        assert_eq!(plan.tasks.len(), 1);

        let report = std::fs::read_to_string(outcome.report_file.unwrap()).unwrap();
        assert!(report.contains("`src/Button.tsx`"));

        let events = orch.store().read_events(None).await.unwrap();
        assert_eq!(
            names(&events),
            vec![
                "pipeline:start",
                "phase:enter:planning",
                "phase:complete:planning",
                "phase:enter:execution",
                "phase:complete:execution",
                "phase:enter:review",
                "phase:complete:review",
                "phase:enter:delivery",
                "phase:complete:delivery",
                "pipeline:complete",
            ]
        );
        assert!(events.iter().all(|e| e.str_field("runId") == Some(outcome.run_id.as_str())));
        assert!(events.iter().any(|e| e.is(kind::DELIVERY_COMPLETE)));
    }

    #[tokio::test]
    async fn test_failing_execution_quality_is_recorded() {
        let mut h = harness();
        h.config.execution.squad.thresholds = QualityThresholds::new(95, 90);
        let (ai, _) = client(
            ScriptedBackend::new()
                .reply(Member::Planner, planner_reply(1))
                .reply(Member::Coder, coder_reply(&[], &[]))
                .reply(Member::Reviewer, reviewer_pass()),
        );
        let orch = orchestrator(&h.config, ai, ScriptedToolchain::new());

        let outcome = orch.run(TriggerPayload::new("Add a button")).await;

        assert!(outcome.success, "{:?}", outcome.error);
        let state = orch.store().load_current().await.unwrap();
        assert_eq!(state.execution.status, TaskStatus::Failed);
        assert_eq!(state.execution.quality.as_ref().unwrap().status, QualityStatus::Fail);
        assert_eq!(state.plan.status, TaskStatus::Completed);

        let events = orch.store().read_events(None).await.unwrap();
        let statuses: Vec<(&str, &str)> = events
            .iter()
            .filter(|e| e.is(kind::PHASE_COMPLETE))
            .filter_map(|e| Some((e.str_field("phase")?, e.str_field("status")?)))
            .collect();
        assert_eq!(
            statuses,
            vec![
                ("planning", "completed"),
                ("execution", "failed"),
                ("review", "completed"),
                ("delivery", "completed"),
            ]
        );
    }

    #[tokio::test]
    async fn test_seven_task_run_uses_full_squads() {
        let h = harness();
        let (ai, backend) = client(
            ScriptedBackend::new()
                .reply(Member::Planner, planner_reply(7))
                .reply(Member::Architect, json!({"frontend": {"framework": "React"}}))
                .reply(Member::Critic, critic_pass())
                .reply(Member::Coder, coder_reply(&["src/a.tsx", "src/b.tsx"], &[]))
                .reply(Member::CodeReviewer, code_review_pass())
                .reply(Member::Reviewer, reviewer_pass())
                .reply(Member::QaTester, qa_passed())
                .reply(Member::FinalApprover, approver_approved()),
        );
        let tools = ScriptedToolchain::new().test_result(summary(6, 0));
        let orch = orchestrator(&h.config, ai, tools);

        let outcome = orch.run(TriggerPayload::new("Build a dashboard")).await;

        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(backend.calls(Member::Architect), 1);
        assert_eq!(backend.calls(Member::FinalApprover), 1);
        let events = orch.store().read_events(None).await.unwrap();
        let modes: Vec<&str> = events
            .iter()
            .filter(|e| e.is(kind::SQUAD_MODE))
            .filter_map(|e| e.str_field("mode"))
            .collect();
        assert_eq!(modes, vec!["complex", "complex", "full"]);
        assert!(!events.iter().any(|e| e.is(kind::DEPS_INSTALL)));
        assert!(outcome.quality_grade.is_some());
    }

    #[tokio::test]
    async fn test_executor_route_reruns_execution_only() {
        let h = harness();
        let (ai, backend) = client(
            ScriptedBackend::new()
                .reply(Member::Planner, planner_reply(1))
                .reply(Member::Coder, coder_reply(&["src/export.ts"], &[]))
                .reply(Member::Reviewer, reviewer_reject("execution"))
                .reply(Member::Reviewer, reviewer_pass()),
        );
        let orch = orchestrator(&h.config, ai, ScriptedToolchain::new());

        let outcome = orch.run(TriggerPayload::new("Add CSV export")).await;

        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(backend.calls(Member::Planner), 1);
        assert_eq!(backend.calls(Member::Coder), 2);
        assert!(backend.prompts(Member::Coder)[1].contains("The export button is missing"));

        let state = orch.store().load_state(&outcome.run_id).await.unwrap();
        assert_eq!(state.retries, 1);
        assert_eq!(state.iterations.planning, 1);
        assert_eq!(state.iterations.execution, 2);
        assert_eq!(state.iterations.review, 2);

        let events = orch.store().read_events(None).await.unwrap();
        let route = events.iter().find(|e| e.is(kind::ROUTE)).unwrap();
        assert_eq!(route.str_field("to"), Some("executor"));
        assert_eq!(route.str_field("reason"), Some("review_rejected"));
        let rejected = events
            .iter()
            .find(|e| e.is(kind::PHASE_COMPLETE) && e.str_field("phase") == Some("review"))
            .unwrap();
        assert_eq!(rejected.str_field("status"), Some("failed"));
    }

    #[tokio::test]
    async fn test_routing_budget_is_bounded() {
        let mut h = harness();
        h.config.max_retries = 2;
        let (ai, backend) = client(
            ScriptedBackend::new()
                .reply(Member::Planner, planner_reply(1))
                .reply(Member::Coder, coder_reply(&["src/a.ts"], &[]))
                .reply(Member::Reviewer, reviewer_reject("plan")),
        );
        let orch = orchestrator(&h.config, ai, ScriptedToolchain::new());

        let outcome = orch.run(TriggerPayload::new("Add CSV export")).await;

        assert!(!outcome.success);
        assert_eq!(outcome.status, TaskStatus::Failed);
        assert_eq!(outcome.route_to, Some(RouteTarget::Planner));
        assert!(outcome.error.as_deref().unwrap().contains("planner"));
        assert_eq!(backend.calls(Member::Planner), 3);
        assert_eq!(backend.calls(Member::Reviewer), 3);

        let events = orch.store().read_events(None).await.unwrap();
        assert_eq!(events.iter().filter(|e| e.is(kind::ROUTE)).count(), 2);
        assert_eq!(events.last().unwrap().event, kind::PIPELINE_FAILED);
    }

    #[tokio::test]
    async fn test_empty_plan_aborts_the_run() {
        let h = harness();
        let (ai, backend) = client(ScriptedBackend::new().fail(Member::Planner, "no model"));
        let orch = orchestrator(&h.config, ai, ScriptedToolchain::new());

        let outcome = orch.run(TriggerPayload::new("Do something")).await;

        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("planning phase failed"));
        assert_eq!(backend.calls(Member::Coder), 0);
        let state = orch.store().load_current().await.unwrap();
        assert_eq!(state.status(), TaskStatus::Failed);
        assert!(state.completed_at().is_some());
    }

    #[tokio::test]
    async fn test_rejection_without_routing_fails_immediately() {
        let mut h = harness();
        h.config.review.enable_auto_routing = false;
        let (ai, backend) = client(
            ScriptedBackend::new()
                .reply(Member::Planner, planner_reply(1))
                .reply(Member::Coder, coder_reply(&["src/a.ts"], &[]))
                .reply(Member::Reviewer, reviewer_reject("execution")),
        );
        let orch = orchestrator(&h.config, ai, ScriptedToolchain::new());

        let outcome = orch.run(TriggerPayload::new("Add CSV export")).await;

        assert!(!outcome.success);
        assert_eq!(backend.calls(Member::Coder), 1);
        assert!(outcome.error.unwrap().contains("routing is disabled"));
    }

    #[tokio::test]
    async fn test_escalation_is_surfaced_in_delivery() {
        let h = harness();
        let (ai, _) = client(
            ScriptedBackend::new()
                .reply(Member::Planner, planner_reply(3))
                .reply(Member::Critic, crate::testing::critic_critical())
                .reply(Member::Coder, coder_reply(&["src/a.ts"], &[]))
                .reply(Member::CodeReviewer, code_review_pass())
                .reply(Member::Reviewer, reviewer_pass())
                .reply(Member::QaTester, qa_passed())
                .reply(Member::FinalApprover, approver_approved()),
        );
        let orch = orchestrator(&h.config, ai, ScriptedToolchain::new());

        let outcome = orch.run(TriggerPayload::new("Add auth")).await;

        assert!(outcome.success, "{:?}", outcome.error);
        assert!(outcome.requires_human_review);
        let state = orch.store().load_current().await.unwrap();
        assert_eq!(state.delivery.escalations.len(), 1);
        assert_eq!(state.delivery.escalations[0].squad, "plan");
        let report = std::fs::read_to_string(outcome.report_file.unwrap()).unwrap();
        assert!(report.contains("Requires human review"));
    }

    struct MissingCodex;

    #[async_trait]
    impl AiBackend for MissingCodex {
        fn name(&self) -> &'static str {
            "codex"
        }

        async fn complete(&self, _request: &AiRequest) -> Result<String, AiError> {
            Err(AiError::Unavailable {
                backend: "codex".into(),
                reason: "codex: command not found".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_unavailable_codex_falls_back_to_api() {
        let h = harness();
        let api = Arc::new(
            ScriptedBackend::new()
                .reply(Member::Planner, planner_reply(1))
                .reply(Member::Coder, coder_reply(&["src/a.ts"], &[]))
                .reply(Member::Reviewer, reviewer_pass()),
        );
        let ai = AiClient::new(Arc::new(MissingCodex)).with_fallback(api.clone(), true);
        let orch = orchestrator(&h.config, ai, ScriptedToolchain::new());

        let outcome = orch.run(TriggerPayload::new("Add a button")).await;

        assert!(outcome.success, "{:?}", outcome.error);
        let events = orch.store().read_events(None).await.unwrap();
        assert_eq!(events.iter().filter(|e| e.is(kind::AI_FALLBACK)).count(), 3);
        assert_eq!(api.calls(Member::Planner), 1);
    }

    #[tokio::test]
    async fn test_global_timeout_fails_the_run() {
        struct Stalled;

        #[async_trait]
        impl AiBackend for Stalled {
            fn name(&self) -> &'static str {
                "stalled"
            }

            async fn complete(&self, _request: &AiRequest) -> Result<String, AiError> {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok("{}".into())
            }
        }

        let mut h = harness();
        h.config.timeout_ms = 50;
        let orch = orchestrator(&h.config, AiClient::new(Arc::new(Stalled)), ScriptedToolchain::new());

        let outcome = orch.run(TriggerPayload::new("Anything")).await;

        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_observer_receives_events() {
        let h = harness();
        let (ai, _) = client(
            ScriptedBackend::new()
                .reply(Member::Planner, planner_reply(1))
                .reply(Member::Coder, coder_reply(&["src/a.ts"], &[]))
                .reply(Member::Reviewer, reviewer_pass()),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let orch = orchestrator(&h.config, ai, ScriptedToolchain::new()).with_observer(tx);

        let trigger = TriggerPayload {
            request: "Add a button".into(),
            requester: Some("alice".into()),
            channel_id: Some("C42".into()),
            timestamp: Some(Utc::now()),
        };
        let outcome = orch.run(trigger).await;

        assert!(outcome.success);
        assert_eq!(rx.recv().await.unwrap().event, kind::PIPELINE_START);
        let state = orch.store().load_current().await.unwrap();
        assert_eq!(state.source.unwrap().channel_id, "C42");
    }
}
