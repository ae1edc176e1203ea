//! Executor trait and the context handed to executors.
//!
//! Executors run the body of a job (a shell command, a script, a stored procedure call).
//! The engine drives them through the PRE, MAIN and POST steps.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::execution::{Parameters, TriggerType};
use crate::job::JobType;
use crate::{ExecutionId, JobId, Result};

/// Everything an executor needs to run one execution.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub job_id: JobId,
    pub job_name: String,
    pub job_type: JobType,
    pub execution_id: ExecutionId,
    /// Command with `${name}` placeholders already resolved.
    pub command: String,
    pub parameters: Parameters,
    pub retry_count: u32,
    pub trigger_type: TriggerType,
    pub triggered_by: String,
    pub timeout: Duration,
    /// Cancelled when the execution times out or is cancelled by an operator.
    pub cancel: CancellationToken,
}

/// Serialized form of a context, sent to the grid.
#[derive(Serialize)]
struct ContextPayload<'a> {
    job_id: JobId,
    job_name: &'a str,
    job_type: String,
    execution_id: ExecutionId,
    command: &'a str,
    parameters: &'a Parameters,
    retry_count: u32,
    trigger_type: TriggerType,
    triggered_by: &'a str,
    timeout_seconds: u64,
}

impl ExecutionContext {
    pub fn to_payload(&self) -> serde_json::Value {
        let payload = ContextPayload {
            job_id: self.job_id,
            job_name: &self.job_name,
            job_type: self.job_type.to_string(),
            execution_id: self.execution_id,
            command: &self.command,
            parameters: &self.parameters,
            retry_count: self.retry_count,
            trigger_type: self.trigger_type,
            triggered_by: &self.triggered_by,
            timeout_seconds: self.timeout.as_secs(),
        };
        serde_json::to_value(payload).unwrap_or(serde_json::Value::Null)
    }
}

/// What an executor step produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub process_id: Option<u32>,
    pub output_parameters: Parameters,
}

impl TaskOutput {
    pub fn ok() -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            ..Default::default()
        }
    }

    /// Error message for a failed step: stderr, falling back to the exit code.
    pub fn failure_message(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        match self.exit_code {
            Some(code) => format!("process exited with code {}", code),
            None => "process terminated without an exit code".to_string(),
        }
    }
}

/// Trait for job executors.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Name of this executor.
    fn name(&self) -> &'static str;

    /// Preparation step. A failure here aborts the execution.
    async fn pre_execute(&self, _ctx: &ExecutionContext) -> Result<TaskOutput> {
        Ok(TaskOutput::ok())
    }

    /// The job body.
    async fn execute(&self, ctx: &ExecutionContext) -> Result<TaskOutput>;

    /// Cleanup step. A failure here only produces a warning.
    async fn post_execute(&self, _ctx: &ExecutionContext) -> Result<TaskOutput> {
        Ok(TaskOutput::ok())
    }
}
