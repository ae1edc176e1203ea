//! In-memory job store.

use async_trait::async_trait;
use cadence_core::execution::{ExecutionStep, JobExecution};
use cadence_core::job::JobDefinition;
use cadence_core::schedule::JobSchedule;
use cadence_core::{ExecutionId, JobId, ScheduleId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::repo::{ExecutionFilter, JobStore};
use crate::{StoreError, StoreResult};

#[derive(Debug, Default)]
struct Tables {
    jobs: HashMap<JobId, JobDefinition>,
    schedules: HashMap<ScheduleId, JobSchedule>,
    executions: HashMap<ExecutionId, JobExecution>,
}

/// Job store backed by in-process maps.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    tables: RwLock<Tables>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn newest_first(executions: &mut [JobExecution]) {
    executions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn get_job(&self, id: JobId) -> StoreResult<JobDefinition> {
        let tables = self.tables.read().await;
        tables
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("job {}", id)))
    }

    async fn find_job_by_name(&self, name: &str) -> StoreResult<Option<JobDefinition>> {
        let tables = self.tables.read().await;
        Ok(tables.jobs.values().find(|j| j.name == name).cloned())
    }

    async fn list_jobs(&self) -> StoreResult<Vec<JobDefinition>> {
        let tables = self.tables.read().await;
        let mut jobs: Vec<_> = tables.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(jobs)
    }

    async fn save_job(&self, job: &JobDefinition) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if tables
            .jobs
            .values()
            .any(|j| j.name == job.name && j.id != job.id)
        {
            return Err(StoreError::Duplicate(format!("job name '{}'", job.name)));
        }
        tables.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn save_schedule(&self, schedule: &JobSchedule) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if !tables.jobs.contains_key(&schedule.job_id) {
            return Err(StoreError::NotFound(format!("job {}", schedule.job_id)));
        }
        tables.schedules.insert(schedule.id, schedule.clone());
        Ok(())
    }

    async fn find_due_schedules(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<JobSchedule>> {
        let tables = self.tables.read().await;
        let mut due: Vec<_> = tables
            .schedules
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|s| (s.next_run_time, s.id));
        due.truncate(limit);
        Ok(due)
    }

    async fn schedules_for_job(&self, job_id: JobId) -> StoreResult<Vec<JobSchedule>> {
        let tables = self.tables.read().await;
        let mut schedules: Vec<_> = tables
            .schedules
            .values()
            .filter(|s| s.job_id == job_id)
            .cloned()
            .collect();
        schedules.sort_by_key(|s| s.id);
        Ok(schedules)
    }

    async fn update_schedule(
        &self,
        id: ScheduleId,
        next_run_time: Option<DateTime<Utc>>,
        last_run_time: Option<DateTime<Utc>>,
        active: bool,
    ) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let schedule = tables
            .schedules
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("schedule {}", id)))?;
        schedule.next_run_time = next_run_time;
        if last_run_time.is_some() {
            schedule.last_run_time = last_run_time;
        }
        schedule.active = active;
        Ok(())
    }

    async fn set_schedules_active(&self, job_id: JobId, active: bool) -> StoreResult<usize> {
        let mut tables = self.tables.write().await;
        let mut changed = 0;
        for schedule in tables.schedules.values_mut() {
            if schedule.job_id == job_id && schedule.active != active {
                schedule.active = active;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn find_dependencies(&self, job_id: JobId) -> StoreResult<Vec<JobId>> {
        let tables = self.tables.read().await;
        let job = tables
            .jobs
            .get(&job_id)
            .ok_or_else(|| StoreError::NotFound(format!("job {}", job_id)))?;
        Ok(job.dependencies.iter().copied().collect())
    }

    async fn find_dependents(&self, job_id: JobId) -> StoreResult<Vec<JobId>> {
        let tables = self.tables.read().await;
        let mut dependents: Vec<_> = tables
            .jobs
            .values()
            .filter(|j| j.dependencies.contains(&job_id))
            .map(|j| j.id)
            .collect();
        dependents.sort();
        Ok(dependents)
    }

    async fn add_dependency(&self, job_id: JobId, depends_on: JobId) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if !tables.jobs.contains_key(&depends_on) {
            return Err(StoreError::NotFound(format!("job {}", depends_on)));
        }
        let job = tables
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| StoreError::NotFound(format!("job {}", job_id)))?;
        job.dependencies.insert(depends_on);
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn remove_dependency(&self, job_id: JobId, depends_on: JobId) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        let job = tables
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| StoreError::NotFound(format!("job {}", job_id)))?;
        let removed = job.dependencies.remove(&depends_on);
        if removed {
            job.updated_at = Utc::now();
        }
        Ok(removed)
    }

    async fn find_recent_executions(
        &self,
        job_id: JobId,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<JobExecution>> {
        let tables = self.tables.read().await;
        let mut executions: Vec<_> = tables
            .executions
            .values()
            .filter(|e| e.job_id == job_id && e.created_at >= since)
            .cloned()
            .collect();
        newest_first(&mut executions);
        Ok(executions)
    }

    async fn get_execution(&self, id: ExecutionId) -> StoreResult<JobExecution> {
        let tables = self.tables.read().await;
        tables
            .executions
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("execution {}", id)))
    }

    async fn save_execution(&self, execution: &JobExecution) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        tables.executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn save_step(&self, step: &ExecutionStep) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let execution = tables
            .executions
            .get_mut(&step.execution_id)
            .ok_or_else(|| StoreError::NotFound(format!("execution {}", step.execution_id)))?;
        execution.steps.push(step.clone());
        Ok(())
    }

    async fn query_executions(&self, filter: &ExecutionFilter) -> StoreResult<Vec<JobExecution>> {
        let tables = self.tables.read().await;
        let mut executions: Vec<_> = tables
            .executions
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        newest_first(&mut executions);
        if let Some(limit) = filter.limit {
            executions.truncate(limit);
        }
        Ok(executions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::execution::{ExecutionStatus, Parameters, StepPhase, StepStatus, TriggerType};
    use cadence_core::job::JobType;
    use cadence_core::schedule::ScheduleSpec;
    use chrono::{Duration, TimeZone};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, h, m, 0).unwrap()
    }

    fn execution(job: &JobDefinition, created_at: DateTime<Utc>) -> JobExecution {
        JobExecution::new(job, TriggerType::Manual, "ops", Parameters::new(), created_at)
    }

    #[tokio::test]
    async fn test_save_and_get_job() {
        let store = MemoryJobStore::new();
        let job = JobDefinition::new("extract", JobType::Shell, "true");
        store.save_job(&job).await.unwrap();

        assert_eq!(store.get_job(job.id).await.unwrap().name, "extract");
        assert!(store.find_job_by_name("extract").await.unwrap().is_some());
        assert!(matches!(
            store.get_job(JobId::new()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_job_names_unique() {
        let store = MemoryJobStore::new();
        store
            .save_job(&JobDefinition::new("extract", JobType::Shell, "true"))
            .await
            .unwrap();
        let result = store
            .save_job(&JobDefinition::new("extract", JobType::Shell, "false"))
            .await;
        assert!(matches!(result, Err(StoreError::Duplicate(_))));
    }

    #[tokio::test]
    async fn test_due_schedules_ordered_and_limited() {
        let store = MemoryJobStore::new();
        let job = JobDefinition::new("extract", JobType::Shell, "true");
        store.save_job(&job).await.unwrap();

        let early = JobSchedule::new(job.id, ScheduleSpec::OneTime { at: at(1, 0) }, at(0, 0)).unwrap();
        let late = JobSchedule::new(job.id, ScheduleSpec::OneTime { at: at(2, 0) }, at(0, 0)).unwrap();
        let future = JobSchedule::new(job.id, ScheduleSpec::OneTime { at: at(9, 0) }, at(0, 0)).unwrap();
        for s in [&late, &future, &early] {
            store.save_schedule(s).await.unwrap();
        }

        let due = store.find_due_schedules(at(3, 0), 10).await.unwrap();
        assert_eq!(due.iter().map(|s| s.id).collect::<Vec<_>>(), vec![early.id, late.id]);

        let due = store.find_due_schedules(at(3, 0), 1).await.unwrap();
        assert_eq!(due.len(), 1);

        assert_eq!(store.set_schedules_active(job.id, false).await.unwrap(), 3);
        assert!(store.find_due_schedules(at(3, 0), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_schedule_keeps_last_run_when_unset() {
        let store = MemoryJobStore::new();
        let job = JobDefinition::new("extract", JobType::Shell, "true");
        store.save_job(&job).await.unwrap();
        let schedule =
            JobSchedule::new(job.id, ScheduleSpec::Interval { seconds: 60 }, at(0, 0)).unwrap();
        store.save_schedule(&schedule).await.unwrap();

        store
            .update_schedule(schedule.id, Some(at(0, 2)), Some(at(0, 1)), true)
            .await
            .unwrap();
        store
            .update_schedule(schedule.id, Some(at(0, 3)), None, true)
            .await
            .unwrap();

        let stored = &store.schedules_for_job(job.id).await.unwrap()[0];
        assert_eq!(stored.next_run_time, Some(at(0, 3)));
        assert_eq!(stored.last_run_time, Some(at(0, 1)));
    }

    #[tokio::test]
    async fn test_dependency_edges() {
        let store = MemoryJobStore::new();
        let extract = JobDefinition::new("extract", JobType::Shell, "true");
        let load = JobDefinition::new("load", JobType::Shell, "true");
        store.save_job(&extract).await.unwrap();
        store.save_job(&load).await.unwrap();

        store.add_dependency(load.id, extract.id).await.unwrap();
        assert_eq!(store.find_dependencies(load.id).await.unwrap(), vec![extract.id]);
        assert_eq!(store.find_dependents(extract.id).await.unwrap(), vec![load.id]);

        assert!(store.remove_dependency(load.id, extract.id).await.unwrap());
        assert!(!store.remove_dependency(load.id, extract.id).await.unwrap());
        assert!(matches!(
            store.add_dependency(load.id, JobId::new()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_executions_newest_first_and_filtered() {
        let store = MemoryJobStore::new();
        let job = JobDefinition::new("extract", JobType::Shell, "true");
        store.save_job(&job).await.unwrap();

        let old = execution(&job, at(1, 0));
        let mut recent = execution(&job, at(5, 0));
        recent.status = ExecutionStatus::Failed;
        store.save_execution(&old).await.unwrap();
        store.save_execution(&recent).await.unwrap();

        let found = store.find_recent_executions(job.id, at(0, 0)).await.unwrap();
        assert_eq!(found[0].id, recent.id);
        assert_eq!(found.len(), 2);

        let found = store.find_recent_executions(job.id, at(2, 0)).await.unwrap();
        assert_eq!(found.len(), 1);

        let failed = store
            .query_executions(&ExecutionFilter::for_job(job.id).with_status(ExecutionStatus::Failed))
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, recent.id);

        let window = ExecutionFilter {
            since: Some(at(0, 0)),
            until: Some(at(1, 0) + Duration::minutes(1)),
            ..Default::default()
        };
        let found = store.query_executions(&window).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, old.id);

        let limited = store
            .query_executions(&ExecutionFilter::default().with_limit(1))
            .await
            .unwrap();
        assert_eq!(limited[0].id, recent.id);
    }

    #[tokio::test]
    async fn test_save_step_appends() {
        let store = MemoryJobStore::new();
        let job = JobDefinition::new("extract", JobType::Shell, "true");
        let exec = execution(&job, at(1, 0));
        store.save_execution(&exec).await.unwrap();

        let step = ExecutionStep {
            execution_id: exec.id,
            step_number: 1,
            phase: StepPhase::Pre,
            status: StepStatus::Succeeded,
            started_at: at(1, 0),
            finished_at: at(1, 0),
            output: None,
            error: None,
        };
        store.save_step(&step).await.unwrap();
        assert_eq!(store.get_execution(exec.id).await.unwrap().steps.len(), 1);

        let orphan = ExecutionStep {
            execution_id: ExecutionId::new(),
            ..step
        };
        assert!(store.save_step(&orphan).await.is_err());
    }
}
