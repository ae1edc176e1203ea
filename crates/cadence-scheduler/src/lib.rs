//! Job scheduling for Cadence.
//!
//! Resolves dependencies between jobs, fires due schedules, and drives executions through
//! their lifecycle on top of the execution engine.

pub mod metrics;
pub mod orchestrator;
pub mod resolver;
pub mod running;
pub mod tick;
pub mod timer;

pub use metrics::{ExecutionMetrics, MetricsSnapshot};
pub use orchestrator::{
    ExecutionEvent, Orchestrator, OrchestratorBuilder, RunningJob, SubmitOutcome, SubmitRequest,
};
pub use resolver::{DependencyGraph, DependencyResolver};
pub use running::{RunningGuard, RunningJobs};
pub use tick::{SchedulerLoop, TickReport};
pub use timer::DelayedTasks;
