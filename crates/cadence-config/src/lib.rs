//! KDL configuration parsing for Cadence.
//!
//! This crate handles parsing of:
//! - System configuration (cadence.kdl)
//! - Job catalogs (jobs.kdl)
//! - Command templating

mod kdl_util;

pub mod error;
pub mod jobs;
pub mod system;
pub mod variables;

pub use error::{ConfigError, ConfigResult};
pub use jobs::{JobCatalog, parse_job_catalog};
pub use system::{
    AdmissionSettings, DependencySettings, ExecutorSettings, GridSettings, OrchestratorConfig,
    OverflowPolicy, ResolutionWindow, SchedulerSettings, parse_system_config,
};
pub use variables::{VariableContext, VariableContextBuilder};
