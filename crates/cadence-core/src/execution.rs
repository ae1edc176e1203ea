//! Execution records and the execution status state machine.
//!
//! ```text
//! PENDING ──► QUEUED ──► RUNNING ──► SUCCESS | FAILED | TIMEOUT
//!    │          ▲                             │        │
//!    ▼          │                             ▼        ▼
//! WAITING_DEPENDENCY          (new instance) RETRYING ─┘
//! ```
//!
//! A retry never mutates the failed execution: it creates a new execution that starts in
//! `RETRYING` and moves to `QUEUED` when resubmitted. Every non-terminal state may move
//! to `CANCELLED`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::job::JobDefinition;
use crate::{Error, ExecutionId, JobId, Result, ScheduleId};

/// Input or output parameters of an execution.
pub type Parameters = BTreeMap<String, String>;

/// Free-form execution metrics (cpu time, memory, execution node, ...).
pub type Metrics = BTreeMap<String, serde_json::Value>;

/// Status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    WaitingDependency,
    Queued,
    Running,
    Success,
    Failed,
    Timeout,
    Retrying,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Success
                | ExecutionStatus::Failed
                | ExecutionStatus::Timeout
                | ExecutionStatus::Cancelled
        )
    }

    /// Failed and timed-out executions may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecutionStatus::Failed | ExecutionStatus::Timeout)
    }

    /// Queued and running executions may be cancelled through the orchestrator.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, ExecutionStatus::Queued | ExecutionStatus::Running)
    }

    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;

        if self.is_terminal() {
            return false;
        }
        if next == Cancelled {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, WaitingDependency)
                | (WaitingDependency, Queued)
                | (Retrying, Queued)
                | (Queued, Running)
                | (Queued, Failed)
                | (Running, Success)
                | (Running, Failed)
                | (Running, Timeout)
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExecutionStatus::Pending => "PENDING",
            ExecutionStatus::WaitingDependency => "WAITING_DEPENDENCY",
            ExecutionStatus::Queued => "QUEUED",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Success => "SUCCESS",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Timeout => "TIMEOUT",
            ExecutionStatus::Retrying => "RETRYING",
            ExecutionStatus::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// Why an execution was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Scheduled,
    Manual,
    Retry,
    Dependency,
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerType::Scheduled => write!(f, "scheduled"),
            TriggerType::Manual => write!(f, "manual"),
            TriggerType::Retry => write!(f, "retry"),
            TriggerType::Dependency => write!(f, "dependency"),
        }
    }
}

/// Phase of the three-step execution protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepPhase {
    Pre,
    Main,
    Post,
}

impl StepPhase {
    pub fn step_number(&self) -> u32 {
        match self {
            StepPhase::Pre => 1,
            StepPhase::Main => 2,
            StepPhase::Post => 3,
        }
    }
}

impl std::fmt::Display for StepPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepPhase::Pre => write!(f, "pre"),
            StepPhase::Main => write!(f, "main"),
            StepPhase::Post => write!(f, "post"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Succeeded,
    Failed,
}

/// One recorded phase of an execution. Steps are append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub execution_id: ExecutionId,
    pub step_number: u32,
    pub phase: StepPhase,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl ExecutionStep {
    pub fn succeeded(&self) -> bool {
        self.status == StepStatus::Succeeded
    }
}

/// One concrete, timed run of a job definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: ExecutionId,
    pub job_id: JobId,
    pub job_name: String,
    pub schedule_id: Option<ScheduleId>,
    pub status: ExecutionStatus,
    pub trigger_type: TriggerType,
    pub triggered_by: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub retry_count: u32,
    /// The execution this one retries.
    pub retry_of: Option<ExecutionId>,
    pub parameters: Parameters,
    pub output_parameters: Parameters,
    pub host: Option<String>,
    pub process_id: Option<String>,
    pub grid_job_id: Option<String>,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub error_message: Option<String>,
    pub warning_message: Option<String>,
    pub log_ref: Option<String>,
    pub metrics: Metrics,
    pub steps: Vec<ExecutionStep>,
    pub cancelled_by: Option<String>,
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Alert bookkeeping; may change after the terminal status is persisted.
    pub alerted: bool,
}

impl JobExecution {
    /// Create a `PENDING` execution of `job`.
    pub fn new(
        job: &JobDefinition,
        trigger_type: TriggerType,
        triggered_by: impl Into<String>,
        parameters: Parameters,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ExecutionId::new(),
            job_id: job.id,
            job_name: job.name.clone(),
            schedule_id: None,
            status: ExecutionStatus::Pending,
            trigger_type,
            triggered_by: triggered_by.into(),
            created_at: now,
            started_at: None,
            finished_at: None,
            duration_ms: None,
            retry_count: 0,
            retry_of: None,
            parameters,
            output_parameters: Parameters::new(),
            host: None,
            process_id: None,
            grid_job_id: None,
            exit_code: None,
            output: None,
            error_message: None,
            warning_message: None,
            log_ref: None,
            metrics: Metrics::new(),
            steps: Vec::new(),
            cancelled_by: None,
            cancelled_at: None,
            alerted: false,
        }
    }

    /// Create the `RETRYING` successor of a failed or timed-out execution.
    ///
    /// Parameters are carried forward unchanged.
    pub fn retry_of(
        original: &JobExecution,
        triggered_by: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ExecutionId::new(),
            job_id: original.job_id,
            job_name: original.job_name.clone(),
            schedule_id: original.schedule_id,
            status: ExecutionStatus::Retrying,
            trigger_type: TriggerType::Retry,
            triggered_by: triggered_by.into(),
            created_at: now,
            started_at: None,
            finished_at: None,
            duration_ms: None,
            retry_count: original.retry_count + 1,
            retry_of: Some(original.id),
            parameters: original.parameters.clone(),
            output_parameters: Parameters::new(),
            host: None,
            process_id: None,
            grid_job_id: None,
            exit_code: None,
            output: None,
            error_message: None,
            warning_message: None,
            log_ref: None,
            metrics: Metrics::new(),
            steps: Vec::new(),
            cancelled_by: None,
            cancelled_at: None,
            alerted: false,
        }
    }

    /// Move to `next`, rejecting transitions the state machine does not allow.
    pub fn transition(&mut self, next: ExecutionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidState(format!(
                "execution {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Stamp the end time and compute the duration from the start time.
    pub fn finish_at(&mut self, finished_at: DateTime<Utc>) {
        self.finished_at = Some(finished_at);
        let started = self.started_at.unwrap_or(self.created_at);
        self.duration_ms = Some((finished_at - started).num_milliseconds().max(0) as u64);
    }
}

/// Outcome of running one execution through the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    /// Non-fatal problem on an otherwise successful run (e.g. POST step failure).
    pub warning: Option<String>,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub cancelled: bool,
    pub steps: Vec<ExecutionStep>,
    pub metrics: Metrics,
    pub output_parameters: Parameters,
    pub host: Option<String>,
    pub process_id: Option<String>,
    pub grid_job_id: Option<String>,
    pub log_ref: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Terminal status this result maps to.
    pub fn final_status(&self) -> ExecutionStatus {
        if self.timed_out {
            ExecutionStatus::Timeout
        } else if self.cancelled {
            ExecutionStatus::Cancelled
        } else if self.success {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Failed
        }
    }

    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }
}
