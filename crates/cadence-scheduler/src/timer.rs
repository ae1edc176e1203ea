//! Keyed one-shot delayed tasks on the tokio timer.

use cadence_core::{ExecutionId, JobId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug)]
struct Pending {
    job_id: JobId,
    handle: JoinHandle<()>,
}

/// Delayed tasks keyed by the execution they belong to.
///
/// A task removes its own entry when it fires, so a pending task can always be aborted
/// through its key or its job.
#[derive(Debug, Clone, Default)]
pub struct DelayedTasks {
    tasks: Arc<Mutex<HashMap<ExecutionId, Pending>>>,
}

impl DelayedTasks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ExecutionId, Pending>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `task` after `delay`. Replaces any task already pending under `key`.
    pub fn schedule<F>(&self, job_id: JobId, key: ExecutionId, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let tasks = self.tasks.clone();
        // Held across the spawn so the task cannot remove its entry before it exists.
        let mut pending = self.lock();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tasks.lock().unwrap_or_else(|e| e.into_inner()).remove(&key);
            task.await;
        });
        if let Some(previous) = pending.insert(key, Pending { job_id, handle }) {
            previous.handle.abort();
        }
        debug!(job_id = %job_id, key = %key, delay_ms = delay.as_millis() as u64, "Delayed task scheduled");
    }

    /// Abort the task pending under `key`.
    pub fn cancel(&self, key: ExecutionId) -> bool {
        match self.lock().remove(&key) {
            Some(pending) => {
                pending.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Abort every task pending for `job_id`. Returns how many were aborted.
    pub fn cancel_job(&self, job_id: JobId) -> usize {
        let mut pending = self.lock();
        let keys: Vec<ExecutionId> = pending
            .iter()
            .filter(|(_, p)| p.job_id == job_id)
            .map(|(k, _)| *k)
            .collect();
        for key in &keys {
            if let Some(p) = pending.remove(key) {
                p.handle.abort();
            }
        }
        keys.len()
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    pub fn pending_for(&self, job_id: JobId) -> usize {
        self.lock().values().filter(|p| p.job_id == job_id).count()
    }

    /// Abort everything.
    pub fn shutdown(&self) {
        for (_, pending) in self.lock().drain() {
            pending.handle.abort();
        }
    }
}
