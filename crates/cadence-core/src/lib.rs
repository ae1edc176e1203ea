//! Core domain types and traits for the Cadence batch orchestrator.
//!
//! This crate contains:
//! - Resource identifiers and common types
//! - Job definitions, schedules and execution records
//! - The execution status state machine
//! - Executor, grid, alert and admission traits
//! - A wall clock abstraction

pub mod admission;
pub mod alert;
pub mod clock;
pub mod error;
pub mod execution;
pub mod executor;
pub mod grid;
pub mod id;
pub mod job;
pub mod schedule;

pub use error::{Error, Result};
pub use id::{ExecutionId, JobId, ScheduleId};
