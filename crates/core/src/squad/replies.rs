//! Typed replies for every AI-backed member.
//!
//! Decoding is lenient about missing optional fields and strict about the
//! verdicts that drive gates and routing.

use super::engine::{Issue, Severity};
use crate::ai::MemberReply;
use crate::pipeline::RouteTarget;
use crate::plan::{Architecture, Decision, Requirements, Task, ValidationCriterion};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    #[serde(alias = "approved", alias = "passed")]
    Pass,
    #[serde(alias = "rejected", alias = "failed")]
    Reject,
}

impl Verdict {
    pub fn passed(&self) -> bool {
        *self == Verdict::Pass
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    #[default]
    Passed,
    Failed,
    Partial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Approval {
    Approved,
    Rejected,
}

/// Issue as written by members, with their per-member target keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReportedIssue {
    pub category: String,
    pub severity: Severity,
    pub description: String,
    #[serde(alias = "recommendation")]
    pub suggestion: String,
    #[serde(alias = "targetTask", alias = "targetFile")]
    pub target: Option<String>,
    pub line: Option<u32>,
    pub auto_resolvable: bool,
}

impl From<ReportedIssue> for Issue {
    fn from(r: ReportedIssue) -> Self {
        Issue {
            category: r.category,
            severity: r.severity,
            description: r.description,
            suggestion: r.suggestion,
            target: r.target,
            line: r.line,
            auto_resolvable: r.auto_resolvable,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PlannerReply {
    pub requirements: Requirements,
    pub tasks: Vec<Task>,
    pub decisions: Vec<Decision>,
    #[serde(alias = "validationCriteria")]
    pub validation_criteria: Vec<ValidationCriterion>,
}

impl MemberReply for PlannerReply {
    fn validate(&self) -> Result<(), String> {
        match self.tasks.iter().find(|t| t.id.trim().is_empty() || t.title.trim().is_empty()) {
            Some(task) => Err(format!("task missing id or title: {task:?}")),
            None => Ok(()),
        }
    }
}

impl MemberReply for Architecture {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriticReply {
    pub status: Verdict,
    #[serde(default)]
    pub overall_opinion: String,
    #[serde(default)]
    pub issues: Vec<ReportedIssue>,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

impl MemberReply for CriticReply {}

/// A file the coder wants written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedFile {
    pub path: String,
    #[serde(default)]
    pub action: FileAction,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    #[default]
    Create,
    Modify,
    Delete,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Changes {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoderReply {
    pub files: Vec<GeneratedFile>,
    pub imports: Changes,
    pub dependencies: Changes,
}

impl MemberReply for CoderReply {
    fn validate(&self) -> Result<(), String> {
        match self.files.iter().find(|f| f.path.trim().is_empty()) {
            Some(_) => Err("generated file with empty path".to_string()),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CodeChecklist {
    pub type_safety: bool,
    pub code_style: bool,
    pub best_practices: bool,
    pub error_handling: bool,
    pub security_check: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeReviewReply {
    pub status: Verdict,
    #[serde(default)]
    pub overall_opinion: String,
    #[serde(default)]
    pub issues: Vec<ReportedIssue>,
    #[serde(default)]
    pub checklist: Option<CodeChecklist>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

impl MemberReply for CodeReviewReply {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MismatchSource {
    Request,
    #[default]
    Plan,
    Execution,
}

/// A gap between the request, the plan and what was built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Mismatch {
    pub category: String,
    pub severity: Severity,
    pub description: String,
    pub source: MismatchSource,
    pub suggestion: String,
    pub target_task: Option<String>,
    pub target_file: Option<String>,
}

impl From<&Mismatch> for Issue {
    fn from(m: &Mismatch) -> Self {
        Issue {
            category: m.category.clone(),
            severity: m.severity,
            description: m.description.clone(),
            suggestion: m.suggestion.clone(),
            target: m.target_task.clone().or_else(|| m.target_file.clone()),
            line: None,
            auto_resolvable: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewerReply {
    pub status: Verdict,
    #[serde(default)]
    pub overall_opinion: String,
    #[serde(default)]
    pub mismatches: Vec<Mismatch>,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

impl MemberReply for ReviewerReply {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QaScenario {
    pub name: String,
    pub description: String,
    pub steps: Vec<String>,
    pub status: ScenarioStatus,
    pub error: Option<String>,
    pub evidence: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScenarioStatus {
    #[default]
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QaReply {
    pub status: TestStatus,
    pub scenarios: Vec<QaScenario>,
    pub logs: Vec<String>,
}

impl MemberReply for QaReply {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproverReply {
    pub status: Approval,
    #[serde(default)]
    pub overall_opinion: String,
    #[serde(default)]
    pub route_to: Option<RouteTarget>,
    #[serde(default)]
    pub issues: Vec<ReportedIssue>,
    #[serde(default)]
    pub next_action: Option<String>,
}

impl MemberReply for ApproverReply {
    fn validate(&self) -> Result<(), String> {
        if self.status == Approval::Approved && self.route_to.is_some() {
            return Err("approved verdict must not carry a route".to_string());
        }
        Ok(())
    }
}
