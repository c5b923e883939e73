//! Execution squad: coder, code reviewer, tester and dependency manager.
//!
//! Files are written to the project as soon as the coder replies, so the
//! reviewer's type check and the tester see the code on disk.

use super::engine::{run_squad, Assessment, Feedback, Issue, ScoringContext, Severity, SquadRun, SquadSpec};
use super::mode::{self, Complexity};
use super::replies::{CodeReviewReply, CoderReply, FileAction};
use crate::ai::{AiClient, AiRequest};
use crate::config::{ExecutionSquadConfig, SquadSettings};
use crate::context::ProjectContext;
use crate::events::{kind, EventLog, PipelineEvent};
use crate::models::Member;
use crate::plan::Plan;
use crate::prompts::{self, PromptBuilder};
use crate::quality::{self, QualityCheck};
use crate::tooling::{self, Diagnostic, DiagnosticLevel, TestSummary, Toolchain};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const CODE_QUALITY_WEIGHT: f64 = 25.0;
pub const TEST_COVERAGE_WEIGHT: f64 = 20.0;

const MANY_FILES: usize = 10;
const MANY_DEPENDENCIES: usize = 3;

/// Characters of each file shown to the code reviewer.
const REVIEW_EXCERPT: usize = 6_000;

#[derive(Debug, Clone)]
pub struct ExecutionInput {
    pub request: String,
    pub plan: Plan,
    /// Where the plan was persisted
    pub plan_file: Option<PathBuf>,
    pub context: ProjectContext,
    /// Findings from a review that routed the run back to execution
    pub review_feedback: Vec<Issue>,
}

/// The coder's reply plus everything the squad did with it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutput {
    pub reply: CoderReply,
    /// Relative paths written or deleted across all passes
    pub files_changed: Vec<String>,
    /// Paths the coder asked for that were refused
    pub rejected_files: Vec<String>,
    pub tests: Option<TestSummary>,
    pub installed: Vec<String>,
}

impl ExecutionOutput {
    pub fn is_empty(&self) -> bool {
        self.reply.files.is_empty()
    }
}

pub struct ExecutionSquad {
    ai: AiClient,
    toolchain: Arc<dyn Toolchain>,
    config: ExecutionSquadConfig,
    last_tests: Option<TestSummary>,
}

impl ExecutionSquad {
    pub fn new(ai: AiClient, toolchain: Arc<dyn Toolchain>, config: ExecutionSquadConfig) -> Self {
        Self {
            ai,
            toolchain,
            config,
            last_tests: None,
        }
    }

    pub async fn run(
        mut self,
        input: &ExecutionInput,
        log: &mut EventLog,
    ) -> SquadRun<ExecutionOutput, Complexity> {
        run_squad(&mut self, input, log).await
    }

    fn lint_timeout(&self) -> Duration {
        Duration::from_millis(self.config.lint_timeout_ms)
    }

    fn test_timeout(&self) -> Duration {
        Duration::from_millis(self.config.test_timeout_ms)
    }

    async fn write_files(
        &self,
        input: &ExecutionInput,
        reply: &CoderReply,
        previous: Option<&ExecutionOutput>,
        log: &mut EventLog,
    ) -> ExecutionOutput {
        let root = &input.context.project_root;
        let mut files_changed = previous.map(|p| p.files_changed.clone()).unwrap_or_default();
        let mut written = Vec::new();
        let mut rejected = Vec::new();

        for file in &reply.files {
            match tooling::write_generated(root, file).await {
                Ok(_) => {
                    if !files_changed.contains(&file.path) {
                        files_changed.push(file.path.clone());
                    }
                    written.push(file.path.clone());
                }
                Err(e) => {
                    tracing::warn!(path = %file.path, error = %e, "Skipping generated file");
                    rejected.push(file.path.clone());
                }
            }
        }

        let deleted = reply
            .files
            .iter()
            .filter(|f| f.action == FileAction::Delete)
            .count();
        log.emit(
            PipelineEvent::new(kind::FILES_WRITTEN)
                .with("files", &written)
                .with("deleted", deleted)
                .with("rejected", &rejected),
        )
        .await;

        ExecutionOutput {
            reply: reply.clone(),
            files_changed,
            rejected_files: rejected,
            tests: None,
            installed: Vec::new(),
        }
    }

    async fn code_review(
        &mut self,
        input: &ExecutionInput,
        output: &ExecutionOutput,
        log: &mut EventLog,
    ) -> Assessment {
        let ctx = &input.context;
        let type_errors = match self.toolchain.type_check(ctx, self.lint_timeout()).await {
            Ok(errors) => errors,
            Err(e) => {
                tracing::warn!(error = %e, "Type check unavailable");
                Vec::new()
            }
        };
        let lint = match self.toolchain.lint(ctx, self.lint_timeout()).await {
            Ok(findings) => findings,
            Err(e) => {
                tracing::warn!(error = %e, "Lint unavailable");
                Vec::new()
            }
        };

        let mut prompt = PromptBuilder::new()
            .request(&input.request)
            .json("Tasks", &input.plan.tasks);
        for file in &output.reply.files {
            let excerpt: String = file.content.chars().take(REVIEW_EXCERPT).collect();
            prompt = prompt.section(&format!("File {}", file.path), excerpt);
        }
        let prompt = prompt
            .list("Type errors", type_errors.iter().map(describe))
            .list("Lint findings", lint.iter().map(describe))
            .build();

        let reply = match self
            .ai
            .ask::<CodeReviewReply>(
                &AiRequest::new(Member::CodeReviewer, prompts::CODE_REVIEWER, prompt),
                log,
            )
            .await
        {
            Ok(reply) => Some(reply),
            Err(e) => {
                tracing::warn!(error = %e, "Code reviewer unavailable, judging on tool output");
                log.emit(PipelineEvent::member_error(Member::CodeReviewer.as_str(), &e)).await;
                None
            }
        };

        let mut issues: Vec<Issue> = type_errors.iter().map(type_error_issue).collect();
        issues.extend(lint.iter().map(lint_issue));
        if let Some(reply) = &reply {
            issues.extend(reply.issues.iter().cloned().map(Issue::from));
        }

        let type_safe = reply
            .as_ref()
            .and_then(|r| r.checklist.as_ref())
            .map_or(true, |c| c.type_safety);
        let critical = issues.iter().filter(|i| i.severity == Severity::Critical).count();
        let summary = reply
            .as_ref()
            .map(|r| r.overall_opinion.clone())
            .filter(|o| !o.is_empty())
            .unwrap_or_else(|| format!("{} type errors, {} lint findings", type_errors.len(), lint.len()));

        let assessment = if critical == 0 && type_safe {
            Assessment {
                issues,
                ..Assessment::pass(Member::CodeReviewer, summary)
            }
        } else {
            Assessment::reject(Member::CodeReviewer, summary, issues)
        };
        match reply {
            Some(reply) => assessment.with_detail(&reply),
            None => assessment,
        }
    }

    async fn test(&mut self, input: &ExecutionInput, log: &mut EventLog) -> Assessment {
        if !self.config.run_tests {
            return Assessment::pass(Member::Tester, "Test run disabled");
        }

        let summary = match self.toolchain.run_tests(&input.context, self.test_timeout()).await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::warn!(error = %e, "Test run failed to complete");
                log.emit(PipelineEvent::new(kind::TEST_ERROR).with("error", e.to_string())).await;
                return Assessment::pass(Member::Tester, format!("Tests could not run: {e}"));
            }
        };

        log.emit(
            PipelineEvent::new(kind::TEST_RESULT)
                .with("passed", summary.passed)
                .with("failed", summary.failed)
                .with("skipped", summary.skipped)
                .with("total", summary.total),
        )
        .await;

        let text = format!("{} passed, {} failed", summary.passed, summary.failed);
        let assessment = if summary.failed == 0 {
            Assessment::pass(Member::Tester, text)
        } else {
            let mut issues: Vec<Issue> = summary
                .failures()
                .map(|case| {
                    Issue::new(
                        "test_failure",
                        Severity::Major,
                        format!("Test `{}` failed", case.name),
                    )
                    .with_suggestion(case.message.clone().unwrap_or_default())
                })
                .collect();
            if issues.is_empty() {
                issues.push(Issue::new("test_failure", Severity::Major, text.clone()));
            }
            Assessment::reject(Member::Tester, text, issues)
        };
        let assessment = assessment.with_detail(&summary);
        self.last_tests = Some(summary);
        assessment
    }
}

fn describe(d: &Diagnostic) -> String {
    format!("{}:{}:{} {}", d.file, d.line, d.column, d.message)
}

fn type_error_issue(d: &Diagnostic) -> Issue {
    Issue {
        line: Some(d.line),
        ..Issue::new("type_error", Severity::Critical, d.message.clone())
            .with_target(d.file.clone())
            .with_suggestion("Fix type error")
    }
}

fn lint_issue(d: &Diagnostic) -> Issue {
    let severity = match d.level {
        DiagnosticLevel::Error => Severity::Major,
        DiagnosticLevel::Warning => Severity::Minor,
    };
    let suggestion = if d.fixable {
        "Auto-fix available"
    } else {
        "Fix lint issue"
    };
    Issue {
        line: Some(d.line),
        auto_resolvable: d.fixable,
        ..Issue::new("lint_error", severity, d.message.clone())
            .with_target(d.file.clone())
            .with_suggestion(suggestion)
    }
}

#[async_trait]
impl SquadSpec for ExecutionSquad {
    type Input = ExecutionInput;
    type Artifact = ExecutionOutput;
    type Mode = Complexity;

    fn name(&self) -> &'static str {
        "execution"
    }

    fn settings(&self) -> SquadSettings {
        self.config.squad
    }

    fn default_mode(&self) -> Complexity {
        self.config.default_mode
    }

    fn mode_label(mode: Complexity) -> &'static str {
        mode.as_str()
    }

    /// The tier is fixed by the plan so a failed first draft cannot change it.
    fn classify(&self, input: &ExecutionInput, _output: &ExecutionOutput) -> Option<Complexity> {
        (!input.plan.is_empty()).then(|| mode::classify(&input.plan.mode_signals()))
    }

    fn roster(&self, mode: Complexity) -> Vec<Member> {
        mode::execution_roster(mode)
    }

    fn producer(&self) -> Member {
        Member::Coder
    }

    fn is_post_loop(&self, member: Member) -> bool {
        member == Member::DependencyManager
    }

    async fn produce(
        &mut self,
        input: &ExecutionInput,
        previous: Option<&ExecutionOutput>,
        feedback: Option<&Feedback>,
        log: &mut EventLog,
    ) -> anyhow::Result<ExecutionOutput> {
        let mut prompt = PromptBuilder::new()
            .request(&input.request)
            .section("Project", input.context.summary())
            .json("Plan", &input.plan);
        if let Some(file) = &input.plan_file {
            prompt = prompt.section("Plan file", file.display().to_string());
        }
        if !input.review_feedback.is_empty() {
            prompt = prompt.list(
                "Review findings on the previous attempt",
                input.review_feedback.iter().map(Issue::render),
            );
        }
        if let (Some(previous), Some(feedback)) = (previous, feedback) {
            prompt = prompt
                .list("Files from the previous pass", previous.reply.files.iter().map(|f| &f.path))
                .section("Feedback to address", feedback.render());
        }

        let reply: CoderReply = self
            .ai
            .ask(&AiRequest::new(Member::Coder, prompts::CODER, prompt.build()), log)
            .await?;
        tracing::info!(files = reply.files.len(), "Coder produced files");

        Ok(self.write_files(input, &reply, previous, log).await)
    }

    async fn assess(
        &mut self,
        member: Member,
        input: &ExecutionInput,
        output: &ExecutionOutput,
        log: &mut EventLog,
    ) -> anyhow::Result<Assessment> {
        match member {
            Member::CodeReviewer => Ok(self.code_review(input, output, log).await),
            Member::Tester => Ok(self.test(input, log).await),
            other => anyhow::bail!("{other} is not a quality member of the execution squad"),
        }
    }

    async fn finish(
        &mut self,
        members: &[Member],
        input: &ExecutionInput,
        output: &mut ExecutionOutput,
        log: &mut EventLog,
    ) {
        output.tests = self.last_tests.take();

        let added = output.reply.dependencies.added.clone();
        if !members.contains(&Member::DependencyManager) || added.is_empty() {
            return;
        }

        log.emit(
            PipelineEvent::new(kind::DEPS_INSTALL)
                .with("member", Member::DependencyManager)
                .with("packages", &added),
        )
        .await;
        match self
            .toolchain
            .install(&input.context, &added, self.test_timeout())
            .await
        {
            Ok(()) => {
                log.emit(PipelineEvent::new(kind::DEPS_COMPLETE).with("packages", &added))
                    .await;
                output.installed = added;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Dependency install failed");
                log.emit(PipelineEvent::new(kind::DEPS_ERROR).with("error", e.to_string()))
                    .await;
            }
        }
    }

    fn checks(&self, ctx: &ScoringContext<'_, ExecutionOutput, Complexity>) -> Vec<QualityCheck> {
        vec![code_quality(ctx.artifact), test_coverage(ctx.events)]
    }

    fn risks(&self, output: &ExecutionOutput) -> Vec<String> {
        let mut risks = Vec::new();
        if output.reply.files.len() > MANY_FILES {
            risks.push("Large number of files changed - review carefully".to_string());
        }
        if output.reply.dependencies.added.len() > MANY_DEPENDENCIES {
            risks.push("Multiple new dependencies - verify compatibility".to_string());
        }
        if !output.rejected_files.is_empty() {
            risks.push(format!(
                "Refused to write outside the project: {}",
                output.rejected_files.join(", ")
            ));
        }
        risks
    }
}

/// Files present (10), a reviewable change size (8), few new packages (7).
pub fn code_quality(output: &ExecutionOutput) -> QualityCheck {
    let files = output.reply.files.len();
    let mut value = 0.0;
    if files > 0 {
        value += 10.0;
    }
    if (1..=MANY_FILES).contains(&files) {
        value += 8.0;
    }
    if output.reply.dependencies.added.len() <= MANY_DEPENDENCIES {
        value += 7.0;
    }
    QualityCheck::weighted("code_quality", value, CODE_QUALITY_WEIGHT)
}

/// Pass rate of the latest `test:result`; full marks without one.
pub fn test_coverage(events: &[PipelineEvent]) -> QualityCheck {
    let count = |e: &PipelineEvent, key: &str| e.field(key).and_then(|v| v.as_u64()).unwrap_or(0) as u32;
    match events.iter().rev().find(|e| e.is(kind::TEST_RESULT)) {
        Some(event) => {
            let passed = count(event, "passed");
            let failed = count(event, "failed");
            quality::pass_rate("test_coverage", passed, passed + failed, TEST_COVERAGE_WEIGHT)
        }
        None => QualityCheck::weighted("test_coverage", TEST_COVERAGE_WEIGHT, TEST_COVERAGE_WEIGHT),
    }
}
