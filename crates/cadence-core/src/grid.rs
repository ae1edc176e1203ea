//! Remote compute grid integration.
//!
//! The grid is an external service that accepts job submissions and reports their status.
//! Submissions carry the execution id so a job can be cancelled before its grid id is known.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::execution::Metrics;
use crate::{ExecutionId, JobId, Result};

/// A job submission to the grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridJobRequest {
    pub job_id: JobId,
    pub job_name: String,
    /// Correlation id.
    pub execution_id: ExecutionId,
    pub job_type: String,
    pub priority: i32,
    pub timeout_minutes: u64,
    pub resources: BTreeMap<String, u32>,
    pub context: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridSubmission {
    pub accepted: bool,
    pub grid_job_id: Option<String>,
    pub message: Option<String>,
}

impl GridSubmission {
    pub fn accepted(grid_job_id: impl Into<String>) -> Self {
        Self {
            accepted: true,
            grid_job_id: Some(grid_job_id.into()),
            message: None,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            grid_job_id: None,
            message: Some(message.into()),
        }
    }
}

/// Status of a grid job as reported by the grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum GridJobState {
    Pending,
    Running,
    Completed {
        success: bool,
        output: Option<String>,
        error: Option<String>,
        log_path: Option<String>,
    },
    Failed {
        error: String,
    },
}

impl GridJobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, GridJobState::Completed { .. } | GridJobState::Failed { .. })
    }
}

/// Resource usage reported by the grid after completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GridJobMetrics {
    pub cpu_time_ms: Option<u64>,
    pub memory_used_mb: Option<u64>,
    pub disk_io_bytes: Option<u64>,
    pub network_io_bytes: Option<u64>,
    pub execution_node: Option<String>,
}

impl GridJobMetrics {
    pub fn to_map(&self) -> Metrics {
        let mut map = Metrics::new();
        if let Some(v) = self.cpu_time_ms {
            map.insert("cpu_time_ms".into(), v.into());
        }
        if let Some(v) = self.memory_used_mb {
            map.insert("memory_used_mb".into(), v.into());
        }
        if let Some(v) = self.disk_io_bytes {
            map.insert("disk_io_bytes".into(), v.into());
        }
        if let Some(v) = self.network_io_bytes {
            map.insert("network_io_bytes".into(), v.into());
        }
        if let Some(node) = &self.execution_node {
            map.insert("execution_node".into(), node.clone().into());
        }
        map
    }
}

/// Client for the remote grid.
#[async_trait]
pub trait GridClient: Send + Sync {
    async fn submit_job(&self, request: &GridJobRequest) -> Result<GridSubmission>;

    async fn job_status(&self, grid_job_id: &str) -> Result<GridJobState>;

    async fn job_metrics(&self, grid_job_id: &str) -> Result<GridJobMetrics>;

    /// Returns whether the grid knew the job and cancelled it.
    async fn cancel_job(&self, grid_job_id: &str) -> Result<bool>;

    async fn cancel_job_by_execution_id(&self, execution_id: ExecutionId) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_map_skips_missing_values() {
        let metrics = GridJobMetrics {
            cpu_time_ms: Some(1200),
            execution_node: Some("node-7".into()),
            ..Default::default()
        };
        let map = metrics.to_map();
        assert_eq!(map.len(), 2);
        assert_eq!(map["cpu_time_ms"], 1200);
        assert_eq!(map["execution_node"], "node-7");
    }

    #[test]
    fn test_state_terminality() {
        assert!(!GridJobState::Running.is_terminal());
        assert!(GridJobState::Failed { error: "lost".into() }.is_terminal());
    }
}
