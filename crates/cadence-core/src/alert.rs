//! Alert delivery.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::execution::JobExecution;
use crate::job::JobDefinition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertType {
    Success,
    Failure,
    Timeout,
    Cancelled,
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertType::Success => write!(f, "success"),
            AlertType::Failure => write!(f, "failure"),
            AlertType::Timeout => write!(f, "timeout"),
            AlertType::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Destination for job alerts. Delivery failures never affect execution status.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send_alert(
        &self,
        job: &JobDefinition,
        execution: &JobExecution,
        alert_type: AlertType,
    ) -> Result<()>;
}

/// Writes alerts to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn send_alert(
        &self,
        job: &JobDefinition,
        execution: &JobExecution,
        alert_type: AlertType,
    ) -> Result<()> {
        match alert_type {
            AlertType::Success => tracing::info!(
                job = %job.name,
                execution_id = %execution.id,
                duration_ms = ?execution.duration_ms,
                "job succeeded"
            ),
            _ => tracing::warn!(
                job = %job.name,
                execution_id = %execution.id,
                status = %execution.status,
                error = execution.error_message.as_deref().unwrap_or(""),
                alert = %alert_type,
                "job did not succeed"
            ),
        }
        Ok(())
    }
}
