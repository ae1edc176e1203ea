//! Job store for Cadence.
//!
//! Provides the `JobStore` repository trait and an in-memory implementation.

pub mod error;
pub mod memory;
pub mod repo;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryJobStore;
pub use repo::{ExecutionFilter, JobStore};
