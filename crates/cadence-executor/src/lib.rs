//! Job execution for Cadence.
//!
//! Provides:
//! - An executor registry keyed by job type
//! - Shell and interpreter-backed executors
//! - The execution engine (local worker pool and remote grid paths)
//! - A circuit breaker and a resilient grid client decorator

pub mod breaker;
pub mod engine;
pub mod grid;
pub mod registry;
pub mod shell;

pub use breaker::{BreakerState, CircuitBreaker};
pub use engine::ExecutionEngine;
pub use grid::ResilientGridClient;
pub use registry::ExecutorRegistry;
pub use shell::ShellExecutor;

pub use cadence_core::executor::{ExecutionContext, JobExecutor, TaskOutput};
