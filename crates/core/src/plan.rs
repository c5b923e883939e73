//! # Plan
//!
//! The structured implementation plan produced by the plan squad and
//! consumed by execution and review. A persisted plan is never mutated;
//! rework produces a new plan with a fresh `planId`.

use crate::quality::QualityScore;
use crate::squad::mode::{Complexity, ModeSignals};
use crate::squad::Escalation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Assignee {
    Frontend,
    Backend,
    #[default]
    Fullstack,
}

/// One unit of implementation work.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub assignee: Assignee,
    pub target_files: Vec<String>,
    /// Ids of other tasks in the same plan
    pub dependencies: Vec<String>,
    pub estimated_time: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Requirements {
    pub functional: Vec<String>,
    pub non_functional: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionCategory {
    TechStack,
    #[default]
    Architecture,
    Pattern,
    Library,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Decision {
    pub category: DecisionCategory,
    pub choice: String,
    pub reason: String,
    pub alternatives: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CriterionKind {
    #[default]
    Functional,
    Visual,
    Performance,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationCriterion {
    pub scenario: String,
    pub expected: String,
    #[serde(rename = "type")]
    pub kind: CriterionKind,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StackChoice {
    pub framework: String,
    pub libraries: Vec<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DatabaseChoice {
    #[serde(rename = "type")]
    pub kind: String,
    pub orm: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheChoice {
    #[serde(rename = "type")]
    pub kind: String,
    pub usage: Vec<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ThirdPartyIntegration {
    pub name: String,
    pub purpose: String,
    pub integration: String,
    pub fallback: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Risk {
    pub description: String,
    pub mitigation: String,
    pub severity: Option<String>,
}

/// Architecture decisions contributed by the architect on complex plans.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Architecture {
    pub frontend: Option<StackChoice>,
    pub backend: Option<StackChoice>,
    pub database: Option<DatabaseChoice>,
    pub cache: Option<CacheChoice>,
    pub third_party: Vec<ThirdPartyIntegration>,
    pub decisions: Vec<Decision>,
    pub risks: Vec<Risk>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanMetadata {
    pub plan_id: String,
    pub task_id: String,
    pub mode: Complexity,
    #[serde(default)]
    pub members: Vec<String>,
    pub iterations: u32,
    pub created_at: DateTime<Utc>,
}

impl Default for PlanMetadata {
    fn default() -> Self {
        Self {
            plan_id: String::new(),
            task_id: String::new(),
            mode: Complexity::Simple,
            members: Vec::new(),
            iterations: 0,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanReview {
    pub critic_opinion: String,
    pub iterations: u32,
    pub approved: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub metadata: PlanMetadata,
    #[serde(default)]
    pub requirements: Requirements,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<Architecture>,
    #[serde(default)]
    pub decisions: Vec<Decision>,
    #[serde(default)]
    pub validation_criteria: Vec<ValidationCriterion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<PlanReview>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualityScore>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<Escalation>,
}

/// Keyword table for estimating packages a plan will pull in.
const DEPENDENCY_HINTS: &[(&[&str], &str)] = &[
    (&["zustand", "state management"], "zustand"),
    (&["react-query", "tanstack"], "@tanstack/react-query"),
    (&["axios", "http client"], "axios"),
    (&["prisma", "orm"], "prisma"),
    (&["tailwind"], "tailwindcss"),
    (&["chart", "recharts"], "recharts"),
    (&["date", "dayjs"], "dayjs"),
];

impl Plan {
    pub fn new_id() -> String {
        format!("plan-{}", uuid::Uuid::new_v4().simple())
    }

    pub fn id(&self) -> &str {
        &self.metadata.plan_id
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn has_database(&self) -> bool {
        self.architecture
            .as_ref()
            .is_some_and(|a| a.database.as_ref().is_some_and(|d| !d.kind.is_empty()))
    }

    pub fn has_third_party(&self) -> bool {
        self.architecture
            .as_ref()
            .is_some_and(|a| !a.third_party.is_empty())
    }

    /// Packages the task descriptions suggest will be added.
    pub fn estimated_dependencies(&self) -> Vec<&'static str> {
        let text = self
            .tasks
            .iter()
            .map(|t| format!("{} {}", t.title, t.description))
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();

        DEPENDENCY_HINTS
            .iter()
            .filter(|(keywords, _)| keywords.iter().any(|k| text.contains(k)))
            .map(|(_, package)| *package)
            .collect()
    }

    pub fn mode_signals(&self) -> ModeSignals {
        ModeSignals {
            task_count: self.tasks.len(),
            has_database: self.has_database(),
            has_third_party: self.has_third_party(),
            new_dependencies: self.estimated_dependencies().len(),
        }
    }

    /// Structural problems: duplicate ids and dependencies on unknown tasks.
    pub fn structural_problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let mut seen = HashSet::new();
        for task in &self.tasks {
            if task.id.trim().is_empty() {
                problems.push(format!("task `{}` has no id", task.title));
            } else if !seen.insert(task.id.as_str()) {
                problems.push(format!("duplicate task id `{}`", task.id));
            }
        }
        for task in &self.tasks {
            for dep in &task.dependencies {
                if !seen.contains(dep.as_str()) {
                    problems.push(format!("task `{}` depends on unknown task `{dep}`", task.id));
                }
            }
        }
        problems
    }

    pub fn target_files(&self) -> Vec<&str> {
        let mut files: Vec<&str> = self
            .tasks
            .iter()
            .flat_map(|t| t.target_files.iter().map(String::as_str))
            .collect();
        files.sort_unstable();
        files.dedup();
        files
    }
}
