//! Autonomy scheduling primitives: adaptive heartbeat pacing, rate/quiet
//! hours budgeting, cron-style job execution, and idempotent multi-step
//! workflows. `autonomy::AutonomyOrchestrator` ties these together into a
//! single tick loop; this module only holds the individual mechanisms.

mod budget;
mod cron;
mod heartbeat;
mod workflow;

pub use budget::AutonomyBudget;
pub use cron::{CronJob, CronJobType, CronService, TickOutcome};
pub use heartbeat::HeartbeatRunner;
pub use workflow::{StepOutcome, WorkflowRuntime, WorkflowStep};
