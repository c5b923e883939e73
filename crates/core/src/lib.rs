//! # DevTeam Core
//!
//! The engine behind the virtual dev team: a request goes through planning,
//! execution, review and delivery, each phase handled by a squad of AI
//! members that rework their output until a quality gate passes.
//!
//! ## Architecture
//!
//! - `orchestrator` - Phase state machine, review routing, delivery
//! - `squad/` - Generic rework loop plus the plan, execution and review squads
//! - `quality` - Weighted quality checks, grades and thresholds
//! - `ai/` - AI backends (`api`, `codex`, `offline`) with fallback
//! - `tooling` - Type checker, linter, test runner and installer subprocesses
//! - `store` - Run state, plans, reports and the NDJSON event log
//!
//! ## Usage
//!
//! ```rust,ignore
//! use devteam_core::{DevTeamConfig, Orchestrator, TriggerPayload};
//!
//! let config = DevTeamConfig::load().await;
//! let orchestrator = Orchestrator::from_config(config, None);
//! let outcome = orchestrator.run(TriggerPayload::new("Add CSV export")).await;
//! ```

pub mod ai;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod plan;
pub mod prompts;
pub mod quality;
pub mod squad;
pub mod store;
pub mod task_state;
pub mod tooling;

#[cfg(test)]
mod testing;

pub use config::{DevTeamConfig, ProviderKind, ReportFormat};
pub use error::{AiError, PipelineError, StoreError, ToolError};
pub use events::{EventLog, PipelineEvent};
pub use orchestrator::{Orchestrator, RunOutcome, TriggerPayload};
pub use pipeline::{PipelinePhase, RouteTarget};
pub use store::RunStore;
pub use task_state::{TaskState, TaskStatus};
