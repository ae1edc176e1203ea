//! Job definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::JobId;
use crate::execution::Parameters;

/// Kind of work a job performs. Selects the executor from the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Shell,
    Python,
    Java,
    StoredProcedure,
    Other(String),
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobType::Shell => write!(f, "shell"),
            JobType::Python => write!(f, "python"),
            JobType::Java => write!(f, "java"),
            JobType::StoredProcedure => write!(f, "stored_procedure"),
            JobType::Other(name) => write!(f, "{}", name),
        }
    }
}

impl std::str::FromStr for JobType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "shell" | "sh" => JobType::Shell,
            "python" => JobType::Python,
            "java" => JobType::Java,
            "stored_procedure" | "stored-procedure" => JobType::StoredProcedure,
            other => JobType::Other(other.to_string()),
        })
    }
}

/// Resource needs of a job, keyed by resource pool name (e.g. `cpu`, `memory_mb`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceRequirements(BTreeMap<String, u32>);

impl ResourceRequirements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, pool: impl Into<String>, amount: u32) -> Self {
        self.0.insert(pool.into(), amount);
        self
    }

    pub fn insert(&mut self, pool: impl Into<String>, amount: u32) {
        self.0.insert(pool.into(), amount);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn as_map(&self) -> &BTreeMap<String, u32> {
        &self.0
    }
}

/// A reusable, static specification of a unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: JobId,
    /// Unique job name.
    pub name: String,
    pub description: Option<String>,
    pub job_type: JobType,
    /// Command or script reference. May contain `${name}` placeholders.
    pub command: String,
    pub active: bool,
    /// Higher runs first on the grid.
    pub priority: i32,
    pub max_retries: u32,
    pub retry_interval_seconds: u64,
    /// Job-specific timeout; the system default applies when unset.
    pub timeout_minutes: Option<u32>,
    pub resources: ResourceRequirements,
    /// Critical jobs are sent to the grid when grid integration is enabled.
    pub critical: bool,
    pub alert_on_success: bool,
    pub alert_on_failure: bool,
    /// Jobs that must have succeeded in the resolution window before this one runs.
    pub dependencies: BTreeSet<JobId>,
    /// Default parameters, overridden by submission parameters.
    pub parameters: Parameters,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobDefinition {
    /// Create an active job with default retry and alert settings.
    pub fn new(name: impl Into<String>, job_type: JobType, command: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            name: name.into(),
            description: None,
            job_type,
            command: command.into(),
            active: true,
            priority: 5,
            max_retries: 3,
            retry_interval_seconds: 60,
            timeout_minutes: None,
            resources: ResourceRequirements::default(),
            critical: false,
            alert_on_success: false,
            alert_on_failure: true,
            dependencies: BTreeSet::new(),
            parameters: Parameters::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Effective timeout: the job's own, or `default` when the job declares none.
    pub fn timeout(&self, default: Duration) -> Duration {
        match self.timeout_minutes {
            Some(minutes) if minutes > 0 => Duration::from_secs(u64::from(minutes) * 60),
            _ => default,
        }
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_seconds)
    }

    pub fn has_dependencies(&self) -> bool {
        !self.dependencies.is_empty()
    }

    /// Job defaults overlaid with the given submission parameters.
    pub fn merged_parameters(&self, overrides: &Parameters) -> Parameters {
        let mut merged = self.parameters.clone();
        merged.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }
}
