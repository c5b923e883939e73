//! Mode classification.
//!
//! A squad's roster is a pure function of its mode, and the mode is a pure
//! function of a few plan signals. Adding tasks never lowers the tier.

use crate::models::Member;
use serde::{Deserialize, Serialize};

/// Signals extracted from a plan (or the request being planned).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModeSignals {
    pub task_count: usize,
    pub has_database: bool,
    pub has_third_party: bool,
    pub new_dependencies: usize,
}

/// Tier used by the plan and execution squads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Medium,
    Complex,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Simple => "simple",
            Complexity::Medium => "medium",
            Complexity::Complex => "complex",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "simple" => Some(Complexity::Simple),
            "medium" => Some(Complexity::Medium),
            "complex" => Some(Complexity::Complex),
            _ => None,
        }
    }
}

/// Tier used by the review squad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewMode {
    Basic,
    Full,
}

impl ReviewMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewMode::Basic => "basic",
            ReviewMode::Full => "full",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "basic" => Some(ReviewMode::Basic),
            "full" => Some(ReviewMode::Full),
            _ => None,
        }
    }
}

pub fn classify(signals: &ModeSignals) -> Complexity {
    if signals.task_count > 5
        || signals.has_database
        || signals.has_third_party
        || signals.new_dependencies > 2
    {
        Complexity::Complex
    } else if signals.task_count > 2 || signals.new_dependencies >= 1 {
        Complexity::Medium
    } else {
        Complexity::Simple
    }
}

/// Full review whenever the plan sits above the lowest tier.
pub fn review_mode(signals: &ModeSignals) -> ReviewMode {
    match classify(signals) {
        Complexity::Simple => ReviewMode::Basic,
        _ => ReviewMode::Full,
    }
}

pub fn plan_roster(mode: Complexity) -> Vec<Member> {
    match mode {
        Complexity::Simple => vec![Member::Planner],
        Complexity::Medium => vec![Member::Planner, Member::Critic],
        Complexity::Complex => vec![Member::Planner, Member::Architect, Member::Critic],
    }
}

pub fn execution_roster(mode: Complexity) -> Vec<Member> {
    match mode {
        Complexity::Simple => vec![Member::Coder],
        Complexity::Medium => vec![Member::Coder, Member::CodeReviewer, Member::Tester],
        Complexity::Complex => vec![
            Member::Coder,
            Member::CodeReviewer,
            Member::Tester,
            Member::DependencyManager,
        ],
    }
}

pub fn review_roster(mode: ReviewMode) -> Vec<Member> {
    match mode {
        ReviewMode::Basic => vec![Member::Reviewer],
        ReviewMode::Full => vec![Member::Reviewer, Member::QaTester, Member::FinalApprover],
    }
}
