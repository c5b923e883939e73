//! # Squads
//!
//! Plan, execution and review squads. Each one implements [`SquadSpec`] and
//! is driven by the shared [`run_squad`] loop.

pub mod engine;
pub mod execution_squad;
pub mod mode;
pub mod plan_squad;
pub mod replies;
pub mod review_squad;

pub use engine::{
    actor_alignment, run_squad, squad_flow, Assessment, Escalation, Feedback, Issue,
    ScoringContext, Severity, SquadRun, SquadSpec,
};
pub use execution_squad::{ExecutionInput, ExecutionOutput, ExecutionSquad};
pub use mode::{Complexity, ModeSignals, ReviewMode};
pub use plan_squad::{PlanInput, PlanSquad};
pub use review_squad::{ReviewInput, ReviewOutcome, ReviewSquad};
