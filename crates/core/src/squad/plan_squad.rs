//! Plan squad: planner, optional architect, optional critic.

use super::engine::{run_squad, Assessment, Feedback, Issue, ScoringContext, SquadRun, SquadSpec};
use super::mode::{self, Complexity};
use super::replies::{CriticReply, PlannerReply};
use crate::ai::{AiClient, AiRequest};
use crate::config::{PlanSquadConfig, SquadSettings};
use crate::context::ProjectContext;
use crate::events::EventLog;
use crate::models::Member;
use crate::plan::{Architecture, Plan, PlanMetadata, PlanReview};
use crate::prompts::{self, PromptBuilder};
use crate::quality::{self, QualityCheck};
use async_trait::async_trait;
use chrono::Utc;

pub const CRITIC_FLOW_WEIGHT: f64 = 20.0;
pub const PLANNING_OUTPUT_WEIGHT: f64 = 25.0;

#[derive(Debug, Clone)]
pub struct PlanInput {
    pub task_id: String,
    pub request: String,
    pub context: ProjectContext,
    /// Findings from a review that routed the run back to planning
    pub review_feedback: Vec<Issue>,
}

pub struct PlanSquad {
    ai: AiClient,
    config: PlanSquadConfig,
    architecture: Option<Architecture>,
    critic_opinion: String,
}

impl PlanSquad {
    pub fn new(ai: AiClient, config: PlanSquadConfig) -> Self {
        Self {
            ai,
            config,
            architecture: None,
            critic_opinion: String::new(),
        }
    }

    /// Run the squad and stamp the plan with its mode, review and score.
    pub async fn run(mut self, input: &PlanInput, log: &mut EventLog) -> SquadRun<Plan, Complexity> {
        let mut run = run_squad(&mut self, input, log).await;

        let plan = &mut run.artifact;
        plan.metadata.mode = run.mode;
        plan.metadata.members = run.members.iter().map(|m| m.to_string()).collect();
        plan.metadata.iterations = run.iterations;
        plan.review = Some(PlanReview {
            critic_opinion: self.critic_opinion,
            iterations: run.iterations,
            approved: run.approved,
        });
        plan.quality = Some(run.quality.clone());
        plan.escalation = run.escalation.clone();
        run
    }

    fn planner_prompt(&self, input: &PlanInput, previous: Option<&Plan>, feedback: Option<&Feedback>) -> String {
        let mut prompt = PromptBuilder::new()
            .request(&input.request)
            .section("Project", input.context.summary());
        if !input.review_feedback.is_empty() {
            prompt = prompt.list(
                "Review findings on the previous attempt",
                input.review_feedback.iter().map(Issue::render),
            );
        }
        if let Some(architecture) = &self.architecture {
            prompt = prompt.json("Architecture", architecture);
        }
        if let (Some(previous), Some(feedback)) = (previous, feedback) {
            prompt = prompt
                .json("Previous plan", &previous.tasks)
                .section("Feedback to address", feedback.render());
        }
        prompt.build()
    }
}

#[async_trait]
impl SquadSpec for PlanSquad {
    type Input = PlanInput;
    type Artifact = Plan;
    type Mode = Complexity;

    fn name(&self) -> &'static str {
        "plan"
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

    fn classify(&self, _input: &PlanInput, plan: &Plan) -> Option<Complexity> {
        if plan.is_empty() {
            return None;
        }
        Some(mode::classify(&plan.mode_signals()))
    }

    fn roster(&self, mode: Complexity) -> Vec<Member> {
        mode::plan_roster(mode)
    }

    fn producer(&self) -> Member {
        Member::Planner
    }

    async fn produce(
        &mut self,
        input: &PlanInput,
        previous: Option<&Plan>,
        feedback: Option<&Feedback>,
        log: &mut EventLog,
    ) -> anyhow::Result<Plan> {
        let prompt = self.planner_prompt(input, previous, feedback);
        let reply: PlannerReply = self
            .ai
            .ask(&AiRequest::new(Member::Planner, prompts::PLANNER, prompt), log)
            .await?;

        tracing::info!(tasks = reply.tasks.len(), "Planner produced a plan");
        Ok(Plan {
            metadata: PlanMetadata {
                plan_id: Plan::new_id(),
                task_id: input.task_id.clone(),
                mode: self.config.default_mode,
                members: Vec::new(),
                iterations: feedback.map_or(0, |f| f.iteration),
                created_at: Utc::now(),
            },
            requirements: reply.requirements,
            tasks: reply.tasks,
            architecture: self.architecture.clone(),
            decisions: reply.decisions,
            validation_criteria: reply.validation_criteria,
            ..Default::default()
        })
    }

    async fn assess(
        &mut self,
        member: Member,
        input: &PlanInput,
        plan: &Plan,
        log: &mut EventLog,
    ) -> anyhow::Result<Assessment> {
        match member {
            Member::Architect => {
                let prompt = PromptBuilder::new()
                    .request(&input.request)
                    .section("Project", input.context.summary())
                    .json("Tasks", &plan.tasks)
                    .json("Decisions so far", &plan.decisions)
                    .build();
                let architecture: Architecture = self
                    .ai
                    .ask(&AiRequest::new(Member::Architect, prompts::ARCHITECT, prompt), log)
                    .await?;
                let assessment = Assessment::pass(Member::Architect, "Architecture defined")
                    .with_detail(&architecture);
                self.architecture = Some(architecture);
                Ok(assessment)
            }
            Member::Critic => {
                let mut prompt = PromptBuilder::new()
                    .request(&input.request)
                    .json("Plan", plan);
                if plan.architecture.is_none() {
                    if let Some(architecture) = &self.architecture {
                        prompt = prompt.json("Architecture", architecture);
                    }
                }
                let reply: CriticReply = self
                    .ai
                    .ask(&AiRequest::new(Member::Critic, prompts::CRITIC, prompt.build()), log)
                    .await?;

                self.critic_opinion = reply.overall_opinion.clone();
                let issues: Vec<Issue> = reply.issues.iter().cloned().map(Issue::from).collect();
                let assessment = if reply.status.passed() {
                    Assessment {
                        issues,
                        ..Assessment::pass(Member::Critic, reply.overall_opinion.clone())
                    }
                } else {
                    Assessment::reject(Member::Critic, reply.overall_opinion.clone(), issues)
                };
                Ok(assessment.with_detail(&reply))
            }
            other => anyhow::bail!("{other} is not part of the plan squad"),
        }
    }

    async fn finish(
        &mut self,
        _members: &[Member],
        _input: &PlanInput,
        plan: &mut Plan,
        _log: &mut EventLog,
    ) {
        if plan.architecture.is_none() {
            plan.architecture = self.architecture.clone();
        }
    }

    fn checks(&self, ctx: &ScoringContext<'_, Plan, Complexity>) -> Vec<QualityCheck> {
        vec![critic_flow(ctx.assessments), planning_output(ctx.artifact)]
    }

    fn risks(&self, plan: &Plan) -> Vec<String> {
        let mut risks = plan.structural_problems();
        if let Some(architecture) = &plan.architecture {
            risks.extend(architecture.risks.iter().map(|r| r.description.clone()));
        }
        risks
    }
}

/// Issue density of the critic's last verdict; full marks when no critic ran.
pub fn critic_flow(assessments: &[Assessment]) -> QualityCheck {
    use super::engine::Severity;
    match assessments.iter().find(|a| a.member == Member::Critic) {
        Some(critic) => quality::issue_density(
            "critic_flow",
            critic.count(Severity::Critical),
            critic.count(Severity::Major),
            CRITIC_FLOW_WEIGHT,
        ),
        None => QualityCheck::weighted("critic_flow", CRITIC_FLOW_WEIGHT, CRITIC_FLOW_WEIGHT),
    }
}

/// Tasks (10), functional requirements (5), validation criteria (5) and a
/// consistent dependency graph (5).
pub fn planning_output(plan: &Plan) -> QualityCheck {
    let mut value = 0.0;
    if !plan.tasks.is_empty() {
        value += 10.0;
    }
    if !plan.requirements.functional.is_empty() {
        value += 5.0;
    }
    if !plan.validation_criteria.is_empty() {
        value += 5.0;
    }
    if !plan.is_empty() && plan.structural_problems().is_empty() {
        value += 5.0;
    }
    QualityCheck::weighted("planning_output", value, PLANNING_OUTPUT_WEIGHT)
}
