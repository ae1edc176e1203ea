//! Set of jobs with an execution in flight.
//!
//! Membership is taken when an execution is dispatched and held by a [`RunningGuard`]
//! until the execution has genuinely terminated. Dropping the guard is the only way to
//! leave the set.

use cadence_core::{ExecutionId, JobId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Default)]
pub struct RunningJobs {
    inner: Arc<Mutex<HashMap<JobId, ExecutionId>>>,
}

impl RunningJobs {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, ExecutionId>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim `job_id` for `execution_id`. Returns `None` if the job is already running.
    pub fn try_claim(&self, job_id: JobId, execution_id: ExecutionId) -> Option<RunningGuard> {
        let mut running = self.lock();
        if running.contains_key(&job_id) {
            return None;
        }
        running.insert(job_id, execution_id);
        Some(RunningGuard {
            jobs: self.clone(),
            job_id,
            execution_id,
        })
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        self.lock().contains_key(&job_id)
    }

    /// Execution currently holding `job_id`.
    pub fn execution_of(&self, job_id: JobId) -> Option<ExecutionId> {
        self.lock().get(&job_id).copied()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<(JobId, ExecutionId)> {
        let mut entries: Vec<_> = self.lock().iter().map(|(j, e)| (*j, *e)).collect();
        entries.sort();
        entries
    }
}

/// Membership of one job in [`RunningJobs`].
#[derive(Debug)]
pub struct RunningGuard {
    jobs: RunningJobs,
    job_id: JobId,
    execution_id: ExecutionId,
}

impl RunningGuard {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let mut running = self.jobs.lock();
        if running.get(&self.job_id) == Some(&self.execution_id) {
            running.remove(&self.job_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_is_exclusive_per_job() {
        let running = RunningJobs::new();
        let job = JobId::new();

        let guard = running.try_claim(job, ExecutionId::new()).unwrap();
        assert!(running.try_claim(job, ExecutionId::new()).is_none());
        assert!(running.try_claim(JobId::new(), ExecutionId::new()).is_some());
        assert_eq!(running.execution_of(job), Some(guard.execution_id()));

        drop(guard);
        assert!(!running.contains(job));
        assert!(running.try_claim(job, ExecutionId::new()).is_some());
    }

    #[test]
    fn test_concurrent_claims() {
        let running = RunningJobs::new();
        let job = JobId::new();
        let claimed = std::sync::Barrier::new(16);

        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    let running = running.clone();
                    let claimed = &claimed;
                    scope.spawn(move || {
                        let guard = running.try_claim(job, ExecutionId::new());
                        // Hold every guard until all threads have tried
                        claimed.wait();
                        usize::from(guard.is_some())
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(winners, 1);
        assert!(running.is_empty());
    }
}
