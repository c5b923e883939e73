//! # Pipeline Phases
//!
//! Phase ordering and the review-driven routing budget.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Phases of a run, in order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    #[default]
    Planning,
    Execution,
    Review,
    Delivery,
}

impl PipelinePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelinePhase::Planning => "planning",
            PipelinePhase::Execution => "execution",
            PipelinePhase::Review => "review",
            PipelinePhase::Delivery => "delivery",
        }
    }

    pub fn next(&self) -> Option<PipelinePhase> {
        match self {
            PipelinePhase::Planning => Some(PipelinePhase::Execution),
            PipelinePhase::Execution => Some(PipelinePhase::Review),
            PipelinePhase::Review => Some(PipelinePhase::Delivery),
            PipelinePhase::Delivery => None,
        }
    }
}

impl fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a rejected review sends the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteTarget {
    Planner,
    Executor,
}

impl RouteTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteTarget::Planner => "planner",
            RouteTarget::Executor => "executor",
        }
    }

    /// Phase the run restarts from.
    pub fn phase(&self) -> PipelinePhase {
        match self {
            RouteTarget::Planner => PipelinePhase::Planning,
            RouteTarget::Executor => PipelinePhase::Execution,
        }
    }
}

impl fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of asking the budget for another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    Retry(PipelinePhase),
    Exhausted { attempts: u32, route_to: RouteTarget },
}

/// Counts routed retries against `max_retries`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryBudget {
    max_retries: u32,
    attempts: u32,
}

impl RetryBudget {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record a rejection. The (max+1)-th rejection exhausts the budget.
    pub fn reject(&mut self, route_to: RouteTarget) -> RouteDecision {
        if self.attempts < self.max_retries {
            self.attempts += 1;
            RouteDecision::Retry(route_to.phase())
        } else {
            RouteDecision::Exhausted {
                attempts: self.attempts,
                route_to,
            }
        }
    }
}
