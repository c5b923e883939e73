//! Review squad: reviewer, QA tester and final approver.
//!
//! The reviewer traces request, plan and code against each other. In full
//! mode QA and the approver judge the reviewer's verdict; a failure there
//! sends the reviewer around again with their findings. A reviewer
//! rejection ends the squad at once and decides where the run goes next.

use super::engine::{
    run_squad, Assessment, Escalation, Feedback, Issue, ScoringContext, Severity, SquadSpec,
};
use super::execution_squad::ExecutionOutput;
use super::mode::{self, ReviewMode};
use super::replies::{
    Approval, ApproverReply, MismatchSource, QaReply, ReviewerReply, ScenarioStatus, TestStatus,
};
use crate::ai::{AiClient, AiRequest};
use crate::config::{ReviewSquadConfig, SquadSettings};
use crate::context::ProjectContext;
use crate::events::{kind, EventLog, PipelineEvent};
use crate::models::Member;
use crate::pipeline::RouteTarget;
use crate::plan::Plan;
use crate::prompts::{self, PromptBuilder};
use crate::quality::{self, QualityCheck, QualityScore};
use crate::tooling::{TestSummary, Toolchain};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

pub const REQUIREMENT_TRACEABILITY_WEIGHT: f64 = 25.0;
pub const QA_COVERAGE_WEIGHT: f64 = 20.0;

const CODE_EXCERPT: usize = 4_000;

#[derive(Debug, Clone)]
pub struct ReviewInput {
    pub request: String,
    pub plan: Plan,
    pub execution: ExecutionOutput,
    pub context: ProjectContext,
}

/// The squad's verdict and where a rejection routes the run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewOutcome {
    pub mode: ReviewMode,
    pub approved: bool,
    pub route_to: Option<RouteTarget>,
    pub reviewer: Option<ReviewerReply>,
    pub qa: Option<QaReply>,
    pub tests: Option<TestSummary>,
    pub approval: Option<ApproverReply>,
    /// Findings handed to the phase the run is routed to
    pub issues: Vec<Issue>,
    pub iterations: u32,
    pub quality: QualityScore,
    pub escalation: Option<Escalation>,
}

impl ReviewOutcome {
    /// Markdown summary stored with the run state.
    pub fn report(&self) -> String {
        let mut out = String::from("# Review\n\n");
        let verdict = if self.approved { "approved" } else { "rejected" };
        let _ = writeln!(out, "- Verdict: {verdict} ({} review)", self.mode.as_str());
        if let Some(route) = self.route_to {
            let _ = writeln!(out, "- Routed to: {route}");
        }
        let _ = writeln!(
            out,
            "- Quality: {} ({}, {})",
            self.quality.overall,
            self.quality.grade.as_str(),
            self.quality.status.as_str()
        );
        let _ = writeln!(out, "- Re-reviews: {}", self.iterations);

        match &self.reviewer {
            Some(reviewer) => {
                let _ = writeln!(out, "\n## Reviewer\n\n{}", reviewer.overall_opinion);
                for mismatch in &reviewer.mismatches {
                    let _ = writeln!(out, "- {}", Issue::from(mismatch).render());
                }
            }
            None => out.push_str("\n## Reviewer\n\nNo verdict was produced.\n"),
        }
        if let Some(qa) = &self.qa {
            let passed = qa
                .scenarios
                .iter()
                .filter(|s| s.status == ScenarioStatus::Passed)
                .count();
            let _ = writeln!(out, "\n## QA\n\n{passed}/{} scenarios passed", qa.scenarios.len());
        }
        if let Some(tests) = &self.tests {
            let _ = writeln!(out, "Tests: {} passed, {} failed", tests.passed, tests.failed);
        }
        if let Some(approval) = &self.approval {
            let _ = writeln!(out, "\n## Final approval\n\n{}", approval.overall_opinion);
        }
        out
    }
}

pub struct ReviewSquad {
    ai: AiClient,
    toolchain: Arc<dyn Toolchain>,
    config: ReviewSquadConfig,
    reviewer_rejected: bool,
    qa: Option<QaReply>,
    tests: Option<TestSummary>,
    approval: Option<ApproverReply>,
}

impl ReviewSquad {
    pub fn new(ai: AiClient, toolchain: Arc<dyn Toolchain>, config: ReviewSquadConfig) -> Self {
        Self {
            ai,
            toolchain,
            config,
            reviewer_rejected: false,
            qa: None,
            tests: None,
            approval: None,
        }
    }

    pub async fn run(mut self, input: &ReviewInput, log: &mut EventLog) -> ReviewOutcome {
        let run = run_squad(&mut self, input, log).await;

        let reviewer = run.artifact;
        let reviewer_passed = reviewer.as_ref().map_or(true, |r| r.status.passed());
        let approved = reviewer_passed && run.assessments.iter().all(|a| a.passed);

        let mut issues: Vec<Issue> = reviewer
            .iter()
            .flat_map(|r| r.mismatches.iter().map(Issue::from))
            .collect();
        issues.extend(
            run.assessments
                .iter()
                .filter(|a| !a.passed)
                .flat_map(|a| a.issues.iter().cloned()),
        );

        let route_to = if approved || !self.config.enable_auto_routing {
            None
        } else {
            Some(route_for(reviewer.as_ref(), self.approval.as_ref()))
        };
        if let Some(route) = route_to {
            tracing::info!(%route, "Review rejected the run");
        }

        ReviewOutcome {
            mode: run.mode,
            approved,
            route_to,
            reviewer,
            qa: self.qa,
            tests: self.tests,
            approval: self.approval,
            issues,
            iterations: run.iterations,
            quality: run.quality,
            escalation: run.escalation,
        }
    }

    fn test_timeout(&self) -> Duration {
        Duration::from_millis(self.config.test_timeout_ms)
    }

    async fn qa(&mut self, input: &ReviewInput, log: &mut EventLog) -> anyhow::Result<Assessment> {
        let tests = match self.toolchain.run_tests(&input.context, self.test_timeout()).await {
            Ok(summary) => {
                log.emit(
                    PipelineEvent::new(kind::TEST_RESULT)
                        .with("member", Member::QaTester)
                        .with("passed", summary.passed)
                        .with("failed", summary.failed)
                        .with("skipped", summary.skipped)
                        .with("total", summary.total),
                )
                .await;
                Some(summary)
            }
            Err(e) => {
                tracing::warn!(error = %e, "QA test run failed to complete");
                log.emit(
                    PipelineEvent::new(kind::TEST_ERROR)
                        .with("member", Member::QaTester)
                        .with("error", e.to_string()),
                )
                .await;
                None
            }
        };

        let mut prompt = PromptBuilder::new()
            .request(&input.request)
            .json("Validation criteria", &input.plan.validation_criteria)
            .list("Files changed", &input.execution.files_changed);
        if let Some(tests) = &tests {
            prompt = prompt.json("Automated test results", tests);
        }
        let qa = match self
            .ai
            .ask::<QaReply>(&AiRequest::new(Member::QaTester, prompts::QA_TESTER, prompt.build()), log)
            .await
        {
            Ok(reply) => Some(reply),
            Err(e) if tests.is_some() => {
                tracing::warn!(error = %e, "QA scenarios unavailable, judging on the test run");
                log.emit(PipelineEvent::member_error(Member::QaTester.as_str(), &e)).await;
                None
            }
            Err(e) => return Err(e.into()),
        };

        let mut issues: Vec<Issue> = qa
            .iter()
            .flat_map(|q| q.scenarios.iter())
            .filter(|s| s.status == ScenarioStatus::Failed)
            .map(|s| {
                let detail = s.error.as_deref().unwrap_or("no detail");
                Issue::new("qa_failure", Severity::Major, format!("Scenario `{}` failed: {detail}", s.name))
            })
            .collect();
        if let Some(tests) = &tests {
            issues.extend(tests.failures().map(|case| {
                Issue::new("test_failure", Severity::Major, format!("Test `{}` failed", case.name))
            }));
            if tests.failed > 0 && tests.results.is_empty() {
                issues.push(Issue::new(
                    "test_failure",
                    Severity::Major,
                    format!("{} tests failed", tests.failed),
                ));
            }
        }

        let scenarios_ok = qa.as_ref().map_or(true, |q| q.status == TestStatus::Passed);
        let tests_ok = tests.as_ref().map_or(true, |t| t.failed == 0);
        let summary = format!(
            "{} scenario failures, {} failing tests",
            qa.iter().flat_map(|q| q.scenarios.iter()).filter(|s| s.status == ScenarioStatus::Failed).count(),
            tests.as_ref().map_or(0, |t| t.failed)
        );
        let assessment = if scenarios_ok && tests_ok {
            Assessment {
                issues,
                ..Assessment::pass(Member::QaTester, summary)
            }
        } else {
            Assessment::reject(Member::QaTester, summary, issues)
        };

        let assessment = match &qa {
            Some(reply) => assessment.with_detail(reply),
            None => assessment,
        };
        self.qa = qa;
        self.tests = tests;
        Ok(assessment)
    }

    async fn approve(
        &mut self,
        input: &ReviewInput,
        reviewer: &Option<ReviewerReply>,
        log: &mut EventLog,
    ) -> anyhow::Result<Assessment> {
        let mut prompt = PromptBuilder::new()
            .request(&input.request)
            .json("Tasks", &input.plan.tasks)
            .list("Files changed", &input.execution.files_changed);
        if let Some(reviewer) = reviewer {
            prompt = prompt.json("Reviewer verdict", reviewer);
        }
        if let Some(qa) = &self.qa {
            prompt = prompt.json("QA results", qa);
        }
        if let Some(tests) = &self.tests {
            prompt = prompt.section(
                "Automated tests",
                format!("{} passed, {} failed", tests.passed, tests.failed),
            );
        }

        let reply: ApproverReply = self
            .ai
            .ask(
                &AiRequest::new(Member::FinalApprover, prompts::FINAL_APPROVER, prompt.build()),
                log,
            )
            .await?;

        let issues: Vec<Issue> = reply.issues.iter().cloned().map(Issue::from).collect();
        let assessment = match reply.status {
            Approval::Approved => Assessment {
                issues,
                ..Assessment::pass(Member::FinalApprover, reply.overall_opinion.clone())
            },
            Approval::Rejected => {
                Assessment::reject(Member::FinalApprover, reply.overall_opinion.clone(), issues)
            }
        };
        let assessment = assessment.with_detail(&reply);
        self.approval = Some(reply);
        Ok(assessment)
    }
}

/// The approver's route when it gave one. Otherwise a critical gap against
/// the request or the plan goes back to planning and anything else to
/// execution.
pub fn route_for(reviewer: Option<&ReviewerReply>, approval: Option<&ApproverReply>) -> RouteTarget {
    if let Some(route) = approval
        .filter(|a| a.status == Approval::Rejected)
        .and_then(|a| a.route_to)
    {
        return route;
    }
    let replan = reviewer.is_some_and(|r| {
        r.mismatches.iter().any(|m| {
            m.severity == Severity::Critical
                && matches!(m.source, MismatchSource::Request | MismatchSource::Plan)
        })
    });
    if replan {
        RouteTarget::Planner
    } else {
        RouteTarget::Executor
    }
}

#[async_trait]
impl SquadSpec for ReviewSquad {
    type Input = ReviewInput;
    type Artifact = Option<ReviewerReply>;
    type Mode = ReviewMode;

    fn name(&self) -> &'static str {
        "review"
    }

    fn settings(&self) -> SquadSettings {
        self.config.squad
    }

    fn default_mode(&self) -> ReviewMode {
        self.config.default_mode
    }

    fn mode_label(mode: ReviewMode) -> &'static str {
        mode.as_str()
    }

    /// The tier is fixed by the plan so a reviewer outage cannot skip QA.
    fn classify(&self, input: &ReviewInput, _reviewer: &Option<ReviewerReply>) -> Option<ReviewMode> {
        (!input.plan.is_empty()).then(|| mode::review_mode(&input.plan.mode_signals()))
    }

    fn roster(&self, mode: ReviewMode) -> Vec<Member> {
        mode::review_roster(mode)
    }

    fn producer(&self) -> Member {
        Member::Reviewer
    }

    fn gate(&self, assessments: &[Assessment]) -> bool {
        self.reviewer_rejected || assessments.iter().all(|a| a.passed)
    }

    async fn produce(
        &mut self,
        input: &ReviewInput,
        previous: Option<&Option<ReviewerReply>>,
        feedback: Option<&Feedback>,
        log: &mut EventLog,
    ) -> anyhow::Result<Option<ReviewerReply>> {
        self.reviewer_rejected = false;

        let mut prompt = PromptBuilder::new()
            .request(&input.request)
            .json("Requirements", &input.plan.requirements)
            .json("Tasks", &input.plan.tasks)
            .json("Validation criteria", &input.plan.validation_criteria);
        for file in &input.execution.reply.files {
            let excerpt: String = file.content.chars().take(CODE_EXCERPT).collect();
            prompt = prompt.section(&format!("File {}", file.path), excerpt);
        }
        if let (Some(Some(previous)), Some(feedback)) = (previous, feedback) {
            prompt = prompt
                .json("Your previous verdict", previous)
                .section("QA and approval findings", feedback.render());
        }

        let reply: ReviewerReply = self
            .ai
            .ask(&AiRequest::new(Member::Reviewer, prompts::REVIEWER, prompt.build()), log)
            .await?;
        self.reviewer_rejected = !reply.status.passed();
        tracing::info!(
            passed = reply.status.passed(),
            mismatches = reply.mismatches.len(),
            "Reviewer verdict"
        );
        Ok(Some(reply))
    }

    async fn assess(
        &mut self,
        member: Member,
        input: &ReviewInput,
        reviewer: &Option<ReviewerReply>,
        log: &mut EventLog,
    ) -> anyhow::Result<Assessment> {
        match member {
            Member::QaTester => self.qa(input, log).await,
            Member::FinalApprover => self.approve(input, reviewer, log).await,
            other => anyhow::bail!("{other} is not a quality member of the review squad"),
        }
    }

    fn checks(&self, ctx: &ScoringContext<'_, Option<ReviewerReply>, ReviewMode>) -> Vec<QualityCheck> {
        let traceability = match ctx.artifact {
            Some(reviewer) => {
                let count = |severity| reviewer.mismatches.iter().filter(|m| m.severity == severity).count();
                quality::issue_density(
                    "requirement_traceability",
                    count(Severity::Critical),
                    count(Severity::Major),
                    REQUIREMENT_TRACEABILITY_WEIGHT,
                )
            }
            None => QualityCheck::weighted(
                "requirement_traceability",
                REQUIREMENT_TRACEABILITY_WEIGHT,
                REQUIREMENT_TRACEABILITY_WEIGHT,
            ),
        };
        vec![traceability, qa_coverage(self.qa.as_ref(), self.tests.as_ref())]
    }

    fn risks(&self, reviewer: &Option<ReviewerReply>) -> Vec<String> {
        match reviewer {
            Some(_) => Vec::new(),
            None => vec!["Reviewer produced no verdict; approved without requirement tracing".to_string()],
        }
    }
}

/// Pass rate over executed QA scenarios and automated tests.
pub fn qa_coverage(qa: Option<&QaReply>, tests: Option<&TestSummary>) -> QualityCheck {
    let (mut passed, mut total) = (0, 0);
    for scenario in qa.iter().flat_map(|q| q.scenarios.iter()) {
        match scenario.status {
            ScenarioStatus::Passed => {
                passed += 1;
                total += 1;
            }
            ScenarioStatus::Failed => total += 1,
            ScenarioStatus::Skipped => {}
        }
    }
    if let Some(tests) = tests {
        passed += tests.passed;
        total += tests.passed + tests.failed;
    }
    quality::pass_rate("qa_coverage", passed, total, QA_COVERAGE_WEIGHT)
}
