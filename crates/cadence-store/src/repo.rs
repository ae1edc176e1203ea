//! Repository trait for jobs, schedules, dependency edges and executions.

use async_trait::async_trait;
use cadence_core::execution::{ExecutionStatus, ExecutionStep, JobExecution, TriggerType};
use cadence_core::job::JobDefinition;
use cadence_core::schedule::JobSchedule;
use cadence_core::{ExecutionId, JobId, ScheduleId};
use chrono::{DateTime, Utc};

use crate::StoreResult;

/// Filter for execution history queries. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub job_id: Option<JobId>,
    pub status: Option<ExecutionStatus>,
    pub trigger_type: Option<TriggerType>,
    /// Inclusive lower bound on creation time.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on creation time.
    pub until: Option<DateTime<Utc>>,
    pub retry_of: Option<ExecutionId>,
    pub limit: Option<usize>,
}

impl ExecutionFilter {
    pub fn for_job(job_id: JobId) -> Self {
        Self {
            job_id: Some(job_id),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: ExecutionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, execution: &JobExecution) -> bool {
        self.job_id.is_none_or(|id| execution.job_id == id)
            && self.status.is_none_or(|s| execution.status == s)
            && self.trigger_type.is_none_or(|t| execution.trigger_type == t)
            && self.since.is_none_or(|since| execution.created_at >= since)
            && self.until.is_none_or(|until| execution.created_at < until)
            && self
                .retry_of
                .is_none_or(|original| execution.retry_of == Some(original))
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get_job(&self, id: JobId) -> StoreResult<JobDefinition>;
    async fn find_job_by_name(&self, name: &str) -> StoreResult<Option<JobDefinition>>;
    async fn list_jobs(&self) -> StoreResult<Vec<JobDefinition>>;
    /// Insert or replace. Names must stay unique.
    async fn save_job(&self, job: &JobDefinition) -> StoreResult<()>;

    async fn save_schedule(&self, schedule: &JobSchedule) -> StoreResult<()>;
    /// Active schedules with `next_run_time <= now`, earliest first.
    async fn find_due_schedules(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<JobSchedule>>;
    async fn schedules_for_job(&self, job_id: JobId) -> StoreResult<Vec<JobSchedule>>;
    async fn update_schedule(
        &self,
        id: ScheduleId,
        next_run_time: Option<DateTime<Utc>>,
        last_run_time: Option<DateTime<Utc>>,
        active: bool,
    ) -> StoreResult<()>;
    /// Returns the number of schedules changed.
    async fn set_schedules_active(&self, job_id: JobId, active: bool) -> StoreResult<usize>;

    /// Jobs `job_id` depends on.
    async fn find_dependencies(&self, job_id: JobId) -> StoreResult<Vec<JobId>>;
    /// Jobs that depend on `job_id`.
    async fn find_dependents(&self, job_id: JobId) -> StoreResult<Vec<JobId>>;
    async fn add_dependency(&self, job_id: JobId, depends_on: JobId) -> StoreResult<()>;
    /// Returns whether the edge existed.
    async fn remove_dependency(&self, job_id: JobId, depends_on: JobId) -> StoreResult<bool>;

    /// Executions of `job_id` created at or after `since`, newest first.
    async fn find_recent_executions(
        &self,
        job_id: JobId,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<JobExecution>>;
    async fn get_execution(&self, id: ExecutionId) -> StoreResult<JobExecution>;
    /// Insert or replace.
    async fn save_execution(&self, execution: &JobExecution) -> StoreResult<()>;
    /// Append a step to its execution.
    async fn save_step(&self, step: &ExecutionStep) -> StoreResult<()>;
    /// Matching executions, newest first.
    async fn query_executions(&self, filter: &ExecutionFilter) -> StoreResult<Vec<JobExecution>>;
}
