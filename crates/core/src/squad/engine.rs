//! Bounded rework loop shared by every squad.
//!
//! ```text
//! start -> primary -> classify mode -> quality members -> gate
//!                          ^                               |
//!                          +------ rework (bounded) -------+
//! gate fails after the budget -> escalation flag
//! -> post-loop members -> complete -> score
//! ```
//!
//! A squad supplies its roster, member invocations, gate and check set
//! through [`SquadSpec`]; [`run_squad`] owns the loop, the events and the
//! scoring.

use crate::config::SquadSettings;
use crate::events::{kind, EventLog, PipelineEvent};
use crate::models::Member;
use crate::quality::{self, QualityCheck, QualityScore, QualityThresholds};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Major,
    #[default]
    Minor,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Major => "major",
            Severity::Minor => "minor",
        }
    }
}

/// A finding raised by a quality member.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Issue {
    pub category: String,
    pub severity: Severity,
    pub description: String,
    pub suggestion: String,
    /// File or task the finding points at
    pub target: Option<String>,
    pub line: Option<u32>,
    pub auto_resolvable: bool,
}

impl Issue {
    pub fn new(category: &str, severity: Severity, description: impl Into<String>) -> Self {
        Self {
            category: category.to_string(),
            severity,
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = suggestion.into();
        self
    }

    /// `[major] description (target:line) -> suggestion`
    pub fn render(&self) -> String {
        let mut out = format!("[{}] {}", self.severity.as_str(), self.description);
        if let Some(target) = &self.target {
            match self.line {
                Some(line) => out.push_str(&format!(" ({target}:{line})")),
                None => out.push_str(&format!(" ({target})")),
            }
        }
        if !self.suggestion.is_empty() {
            out.push_str(&format!(" -> {}", self.suggestion));
        }
        out
    }
}

/// One quality member's verdict on the current artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assessment {
    pub member: Member,
    pub passed: bool,
    pub summary: String,
    pub issues: Vec<Issue>,
    /// The member's full reply, kept for reports and feedback
    #[serde(default)]
    pub detail: Value,
}

impl Assessment {
    pub fn pass(member: Member, summary: impl Into<String>) -> Self {
        Self {
            member,
            passed: true,
            summary: summary.into(),
            issues: Vec::new(),
            detail: Value::Null,
        }
    }

    pub fn reject(member: Member, summary: impl Into<String>, issues: Vec<Issue>) -> Self {
        Self {
            member,
            passed: false,
            summary: summary.into(),
            issues,
            detail: Value::Null,
        }
    }

    pub fn with_detail(mut self, detail: impl Serialize) -> Self {
        self.detail = serde_json::to_value(detail).unwrap_or(Value::Null);
        self
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.issues.iter().filter(|i| i.severity == severity).count()
    }
}

/// What the producer sees on a rework pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feedback {
    pub iteration: u32,
    pub assessments: Vec<Assessment>,
}

impl Feedback {
    pub fn issues(&self) -> impl Iterator<Item = &Issue> {
        self.assessments.iter().flat_map(|a| a.issues.iter())
    }

    pub fn rejections(&self) -> impl Iterator<Item = &Assessment> {
        self.assessments.iter().filter(|a| !a.passed)
    }

    /// One bullet per rejection and per issue, for rework prompts.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for assessment in self.rejections() {
            out.push_str(&format!("- {} rejected: {}\n", assessment.member, assessment.summary));
            for issue in &assessment.issues {
                out.push_str(&format!("  - {}\n", issue.render()));
            }
        }
        out
    }
}

/// Marks an artifact that left the loop without passing its gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Escalation {
    pub requires_human_review: bool,
    pub squad: String,
    pub reason: String,
    pub iterations: u32,
    pub outstanding: Vec<Issue>,
}

/// Inputs to a squad's domain checks.
pub struct ScoringContext<'a, A, M> {
    pub artifact: &'a A,
    pub mode: M,
    pub roster: &'a [Member],
    pub assessments: &'a [Assessment],
    pub iterations: u32,
    pub events: &'a [PipelineEvent],
}

/// A squad: roster selection, member invocations, gate and checks.
#[async_trait]
pub trait SquadSpec: Send {
    type Input: Sync;
    type Artifact: Default + Send + Sync;
    type Mode: Copy + PartialEq + Send + Sync + Serialize;

    fn name(&self) -> &'static str;

    fn settings(&self) -> SquadSettings;

    /// Used when [`SquadSpec::classify`] has no signal.
    fn default_mode(&self) -> Self::Mode;

    fn mode_label(mode: Self::Mode) -> &'static str;

    /// Pick the mode from the input, or from the first artifact when the input carries no signal yet.
    fn classify(&self, input: &Self::Input, artifact: &Self::Artifact) -> Option<Self::Mode>;

    fn roster(&self, mode: Self::Mode) -> Vec<Member>;

    fn producer(&self) -> Member;

    /// Members run once after the loop instead of inside it.
    fn is_post_loop(&self, _member: Member) -> bool {
        false
    }

    /// Run the primary member. `feedback` is set on rework passes.
    async fn produce(
        &mut self,
        input: &Self::Input,
        previous: Option<&Self::Artifact>,
        feedback: Option<&Feedback>,
        log: &mut EventLog,
    ) -> anyhow::Result<Self::Artifact>;

    async fn assess(
        &mut self,
        member: Member,
        input: &Self::Input,
        artifact: &Self::Artifact,
        log: &mut EventLog,
    ) -> anyhow::Result<Assessment>;

    /// Default gate: every quality member passed.
    fn gate(&self, assessments: &[Assessment]) -> bool {
        assessments.iter().all(|a| a.passed)
    }

    /// Post-loop work such as dependency installation.
    async fn finish(
        &mut self,
        _members: &[Member],
        _input: &Self::Input,
        _artifact: &mut Self::Artifact,
        _log: &mut EventLog,
    ) {
    }

    /// Squad-specific checks scored alongside the shared ones.
    fn checks(&self, ctx: &ScoringContext<'_, Self::Artifact, Self::Mode>) -> Vec<QualityCheck>;

    fn risks(&self, _artifact: &Self::Artifact) -> Vec<String> {
        Vec::new()
    }
}

/// Everything a squad run produced.
#[derive(Debug, Clone)]
pub struct SquadRun<A, M> {
    pub id: String,
    pub mode: M,
    pub members: Vec<Member>,
    /// Rework passes performed
    pub iterations: u32,
    /// Primary member invocations, at most `max_rework_iterations + 1`
    pub invocations: u32,
    pub artifact: A,
    pub approved: bool,
    pub assessments: Vec<Assessment>,
    pub escalation: Option<Escalation>,
    pub quality: QualityScore,
}

pub const SQUAD_FLOW_WEIGHT: f64 = 25.0;
pub const ACTOR_ALIGNMENT_WEIGHT: f64 = 15.0;
pub const REWORK_CONTROL_WEIGHT: f64 = 15.0;

#[tracing::instrument(skip_all, fields(squad = spec.name()))]
pub async fn run_squad<S: SquadSpec>(
    spec: &mut S,
    input: &S::Input,
    log: &mut EventLog,
) -> SquadRun<S::Artifact, S::Mode> {
    let settings = spec.settings();
    let squad = spec.name();
    let id = format!("{squad}-{}", uuid::Uuid::new_v4().simple());
    let first_event = log.len();

    log.emit(
        PipelineEvent::new(kind::SQUAD_START)
            .with("squad", squad)
            .with("squadId", &id),
    )
    .await;

    let mut invocations = 1;
    let mut artifact = produce_or_empty(spec, input, None, None, log).await;

    let mode = spec
        .classify(input, &artifact)
        .unwrap_or_else(|| spec.default_mode());
    let members = spec.roster(mode);
    let producer = spec.producer();
    let reviewers: Vec<Member> = members
        .iter()
        .copied()
        .filter(|m| *m != producer && !spec.is_post_loop(*m))
        .collect();

    tracing::info!(mode = S::mode_label(mode), members = ?members, "Squad mode selected");
    log.emit(
        PipelineEvent::new(kind::SQUAD_MODE)
            .with("squad", squad)
            .with("mode", mode)
            .with("members", &members),
    )
    .await;

    let mut iterations = 0;
    let mut assessments = assess_all(spec, &reviewers, input, &artifact, log).await;
    let mut approved = spec.gate(&assessments);
    if !reviewers.is_empty() {
        log.emit(gate_event(squad, 0, approved, &assessments)).await;
    }

    while !approved && iterations < settings.max_rework_iterations {
        iterations += 1;
        log.emit(
            PipelineEvent::new(kind::REWORK_START)
                .with("squad", squad)
                .with("iteration", iterations)
                .with("issues", assessments.iter().map(|a| a.issues.len()).sum::<usize>()),
        )
        .await;

        let feedback = Feedback {
            iteration: iterations,
            assessments: std::mem::take(&mut assessments),
        };
        invocations += 1;
        artifact = produce_or_empty(spec, input, Some(&artifact), Some(&feedback), log).await;
        assessments = assess_all(spec, &reviewers, input, &artifact, log).await;
        approved = spec.gate(&assessments);

        log.emit(
            PipelineEvent::new(kind::REWORK_COMPLETE)
                .with("squad", squad)
                .with("iteration", iterations)
                .with("passed", approved),
        )
        .await;
    }

    let escalation = if !approved && settings.enable_auto_escalation {
        let outstanding: Vec<Issue> = assessments
            .iter()
            .filter(|a| !a.passed)
            .flat_map(|a| a.issues.iter().cloned())
            .collect();
        let escalation = Escalation {
            requires_human_review: true,
            squad: squad.to_string(),
            reason: "max_iterations_exceeded".to_string(),
            iterations,
            outstanding,
        };
        tracing::warn!(iterations, "Squad exhausted its rework budget, flagging for human review");
        log.emit(
            PipelineEvent::new(kind::ESCALATION)
                .with("squad", squad)
                .with("reason", &escalation.reason)
                .with("iterations", iterations)
                .with("issues", escalation.outstanding.len()),
        )
        .await;
        Some(escalation)
    } else {
        None
    };

    spec.finish(&members, input, &mut artifact, log).await;

    log.emit(
        PipelineEvent::new(kind::SQUAD_COMPLETE)
            .with("squad", squad)
            .with("mode", mode)
            .with("iterations", iterations)
            .with("approved", approved),
    )
    .await;

    let quality = {
        let events = log.since(first_event);
        let ctx = ScoringContext {
            artifact: &artifact,
            mode,
            roster: &members,
            assessments: &assessments,
            iterations,
            events,
        };
        let expected = spec.roster(mode);
        let mut checks = vec![
            squad_flow(events, &serde_json::to_value(mode).unwrap_or(Value::Null)),
            actor_alignment(events, &expected),
        ];
        checks.extend(spec.checks(&ctx));
        checks.push(quality::rework_control(
            iterations,
            settings.max_rework_iterations,
            settings.rework_penalty,
            REWORK_CONTROL_WEIGHT,
        ));
        score_or_floor(checks, settings.thresholds, spec.risks(&artifact))
    };

    log.emit(
        PipelineEvent::new(kind::QUALITY_SCORE)
            .with("squad", squad)
            .with("score", quality.overall)
            .with("grade", quality.grade.as_str())
            .with("status", quality.status.as_str())
            .with("checks", &quality.checks),
    )
    .await;

    SquadRun {
        id,
        mode,
        members,
        iterations,
        invocations,
        artifact,
        approved,
        assessments,
        escalation,
        quality,
    }
}

async fn produce_or_empty<S: SquadSpec>(
    spec: &mut S,
    input: &S::Input,
    previous: Option<&S::Artifact>,
    feedback: Option<&Feedback>,
    log: &mut EventLog,
) -> S::Artifact {
    let member = spec.producer();
    log.emit(PipelineEvent::new(kind::MEMBER_START).with("member", member)).await;
    match spec.produce(input, previous, feedback, log).await {
        Ok(artifact) => {
            log.emit(PipelineEvent::new(kind::MEMBER_COMPLETE).with("member", member))
                .await;
            artifact
        }
        Err(e) => {
            tracing::warn!(%member, error = %e, "Producer failed, continuing with an empty artifact");
            log.emit(PipelineEvent::member_error(member.as_str(), &e)).await;
            S::Artifact::default()
        }
    }
}

async fn assess_all<S: SquadSpec>(
    spec: &mut S,
    members: &[Member],
    input: &S::Input,
    artifact: &S::Artifact,
    log: &mut EventLog,
) -> Vec<Assessment> {
    let mut out = Vec::with_capacity(members.len());
    for &member in members {
        log.emit(PipelineEvent::new(kind::MEMBER_START).with("member", member)).await;
        let assessment = match spec.assess(member, input, artifact, log).await {
            Ok(a) => {
                log.emit(
                    PipelineEvent::new(kind::MEMBER_COMPLETE)
                        .with("member", member)
                        .with("passed", a.passed)
                        .with("issues", a.issues.len()),
                )
                .await;
                a
            }
            Err(e) => {
                tracing::warn!(%member, error = %e, "Quality member failed, assuming pass");
                log.emit(PipelineEvent::member_error(member.as_str(), &e)).await;
                Assessment::pass(member, format!("{member} unavailable: {e}"))
            }
        };
        out.push(assessment);
    }
    out
}

fn gate_event(squad: &str, iteration: u32, passed: bool, assessments: &[Assessment]) -> PipelineEvent {
    let verdicts: serde_json::Map<String, Value> = assessments
        .iter()
        .map(|a| (a.member.as_str().to_string(), Value::Bool(a.passed)))
        .collect();
    PipelineEvent::new(kind::QUALITY_CHECK)
        .with("squad", squad)
        .with("iteration", iteration)
        .with("passed", passed)
        .with("verdicts", verdicts)
        .with("issues", assessments.iter().map(|a| a.issues.len()).sum::<usize>())
}

/// Start (8), complete (9), and mode consistency across events (8).
pub fn squad_flow(events: &[PipelineEvent], mode: &Value) -> QualityCheck {
    let has_start = events.iter().any(|e| e.is(kind::SQUAD_START));
    let has_complete = events.iter().any(|e| e.is(kind::SQUAD_COMPLETE));
    let consistent = events
        .iter()
        .filter_map(|e| e.field("mode"))
        .all(|m| m == mode);

    let mut value = 0.0;
    if has_start {
        value += 8.0;
    }
    if has_complete {
        value += 9.0;
    }
    if consistent {
        value += 8.0;
    }
    QualityCheck::weighted("squad_flow", value, SQUAD_FLOW_WEIGHT)
}

/// Full marks when the announced roster covers every required member.
pub fn actor_alignment(events: &[PipelineEvent], required: &[Member]) -> QualityCheck {
    let announced: Vec<Member> = events
        .iter()
        .filter(|e| e.is(kind::SQUAD_MODE))
        .filter_map(|e| e.field("members"))
        .filter_map(|m| serde_json::from_value::<Vec<Member>>(m.clone()).ok())
        .flatten()
        .collect();
    let all_present = required.iter().all(|m| announced.contains(m));
    let value = if all_present {
        ACTOR_ALIGNMENT_WEIGHT
    } else {
        (ACTOR_ALIGNMENT_WEIGHT / 2.0).floor()
    };
    QualityCheck::weighted("actor_alignment", value, ACTOR_ALIGNMENT_WEIGHT)
}

/// Scoring only fails on malformed checks; report that as a zero score.
fn score_or_floor(
    checks: Vec<QualityCheck>,
    thresholds: QualityThresholds,
    risks: Vec<String>,
) -> QualityScore {
    match quality::score(checks.clone(), thresholds, risks.clone()) {
        Ok(score) => score,
        Err(e) => {
            tracing::error!(error = %e, "Quality checks rejected");
            QualityScore {
                overall: 0,
                grade: quality::Grade::F,
                status: quality::QualityStatus::Fail,
                checks,
                risks,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::squad::Complexity;

    /// Counts upward; the critic accepts once the count reaches `target`.
    #[derive(Default)]
    struct Counter {
        settings: SquadSettings,
        producer_fails: bool,
        feedback_seen: Vec<String>,
    }

    #[async_trait]
    impl SquadSpec for Counter {
        type Input = u32;
        type Artifact = u32;
        type Mode = Complexity;

        fn name(&self) -> &'static str {
            "counter"
        }

        fn settings(&self) -> SquadSettings {
            self.settings
        }

        fn default_mode(&self) -> Complexity {
            Complexity::Simple
        }

        fn mode_label(mode: Complexity) -> &'static str {
            mode.as_str()
        }

        fn classify(&self, target: &u32, _artifact: &u32) -> Option<Complexity> {
            (*target > 50).then_some(Complexity::Complex)
        }

        fn roster(&self, mode: Complexity) -> Vec<Member> {
            match mode {
                Complexity::Complex => vec![Member::Planner, Member::Architect, Member::Critic],
                _ => vec![Member::Planner, Member::Critic],
            }
        }

        fn producer(&self) -> Member {
            Member::Planner
        }

        async fn produce(
            &mut self,
            _target: &u32,
            previous: Option<&u32>,
            feedback: Option<&Feedback>,
            _log: &mut EventLog,
        ) -> anyhow::Result<u32> {
            if let Some(feedback) = feedback {
                self.feedback_seen.push(feedback.render());
            }
            if self.producer_fails {
                anyhow::bail!("planner offline");
            }
            Ok(previous.copied().unwrap_or(0) + 1)
        }

        async fn assess(
            &mut self,
            member: Member,
            target: &u32,
            count: &u32,
            _log: &mut EventLog,
        ) -> anyhow::Result<Assessment> {
            if member == Member::Architect {
                anyhow::bail!("architect offline");
            }
            if count >= target {
                return Ok(Assessment::pass(member, "enough"));
            }
            let issue = Issue::new("completeness", Severity::Critical, format!("count {count} is below {target}"))
                .with_suggestion("count higher");
            Ok(Assessment::reject(member, "too low", vec![issue]))
        }

        fn checks(&self, _ctx: &ScoringContext<'_, u32, Complexity>) -> Vec<QualityCheck> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn test_first_pass_approval() {
        let mut squad = Counter::default();
        let mut log = EventLog::in_memory();

        let run = run_squad(&mut squad, &1, &mut log).await;

        assert!(run.approved);
        assert_eq!(run.invocations, 1);
        assert_eq!(run.iterations, 0);
        assert_eq!(run.artifact, 1);
        assert!(run.escalation.is_none());
        assert_eq!(run.quality.overall, 100);
        assert_eq!(log.count(kind::REWORK_START), 0);
        assert_eq!(log.count(kind::SQUAD_COMPLETE), 1);
    }

    #[tokio::test]
    async fn test_rework_until_gate_passes() {
        let mut squad = Counter::default();
        let mut log = EventLog::in_memory();

        let run = run_squad(&mut squad, &3, &mut log).await;

        assert!(run.approved);
        assert_eq!(run.artifact, 3);
        assert_eq!(run.iterations, 2);
        assert_eq!(run.invocations, 3);
        assert_eq!(squad.feedback_seen.len(), 2);
        assert!(squad.feedback_seen[0].contains("critic rejected: too low"));
        assert!(squad.feedback_seen[0].contains("[critical] count 1 is below 3 -> count higher"));
    }

    #[tokio::test]
    async fn test_producer_bound_and_escalation() {
        let mut squad = Counter::default();
        let mut log = EventLog::in_memory();

        let run = run_squad(&mut squad, &10, &mut log).await;

        assert!(!run.approved);
        assert_eq!(run.invocations, 4);
        assert_eq!(run.iterations, 3);
        let escalation = run.escalation.unwrap();
        assert!(escalation.requires_human_review);
        assert_eq!(escalation.squad, "counter");
        assert_eq!(escalation.reason, "max_iterations_exceeded");
        assert_eq!(escalation.outstanding.len(), 1);
        assert_eq!(log.count(kind::ESCALATION), 1);
        // The artifact is left as produced.
        assert_eq!(run.artifact, 4);
    }

    #[tokio::test]
    async fn test_escalation_can_be_disabled() {
        let mut squad = Counter {
            settings: SquadSettings {
                max_rework_iterations: 1,
                enable_auto_escalation: false,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut log = EventLog::in_memory();

        let run = run_squad(&mut squad, &10, &mut log).await;

        assert!(!run.approved);
        assert_eq!(run.invocations, 2);
        assert!(run.escalation.is_none());
        assert_eq!(log.count(kind::ESCALATION), 0);
    }

    #[tokio::test]
    async fn test_zero_rework_budget_runs_producer_once() {
        let mut squad = Counter {
            settings: SquadSettings {
                max_rework_iterations: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut log = EventLog::in_memory();

        let run = run_squad(&mut squad, &5, &mut log).await;

        assert_eq!(run.invocations, 1);
        assert!(run.escalation.is_some());
    }

    #[tokio::test]
    async fn test_producer_failure_yields_empty_artifact() {
        let mut squad = Counter {
            producer_fails: true,
            ..Default::default()
        };
        let mut log = EventLog::in_memory();

        let run = run_squad(&mut squad, &1, &mut log).await;

        assert_eq!(run.artifact, 0);
        assert_eq!(run.invocations, 4);
        assert_eq!(log.count("planner:error"), 4);
    }

    #[tokio::test]
    async fn test_quality_member_failure_counts_as_pass() {
        let mut squad = Counter::default();
        let mut log = EventLog::in_memory();

        // Targets above 50 pull the architect in, which always fails.
        let run = run_squad(&mut squad, &60, &mut log).await;

        assert_eq!(run.mode, Complexity::Complex);
        assert_eq!(log.count("architect:error"), 4);
        let architect = run
            .assessments
            .iter()
            .find(|a| a.member == Member::Architect)
            .unwrap();
        assert!(architect.passed);
    }

    #[test]
    fn test_squad_flow_detects_mode_drift() {
        let mode = serde_json::json!("simple");
        let events = vec![
            PipelineEvent::new(kind::SQUAD_START),
            PipelineEvent::new(kind::SQUAD_MODE).with("mode", "simple"),
            PipelineEvent::new(kind::SQUAD_COMPLETE).with("mode", "complex"),
        ];
        assert_eq!(squad_flow(&events, &mode).score, 17.0);
        assert_eq!(squad_flow(&events[..2], &mode).score, 16.0);
    }

    #[test]
    fn test_actor_alignment_halves_on_missing_member() {
        let events = vec![PipelineEvent::new(kind::SQUAD_MODE).with("members", [Member::Planner])];
        let check = actor_alignment(&events, &[Member::Planner, Member::Critic]);
        assert_eq!(check.score, 7.0);
        let check = actor_alignment(&events, &[Member::Planner]);
        assert_eq!(check.score, ACTOR_ALIGNMENT_WEIGHT);
    }
}
