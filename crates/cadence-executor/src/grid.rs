//! Resilient grid client.
//!
//! Wraps any [`GridClient`] with a bounded retry and a circuit breaker while exposing the
//! same trait. Only transient errors are retried and counted by the breaker.

use async_trait::async_trait;
use cadence_config::GridSettings;
use cadence_core::clock::Clock;
use cadence_core::grid::{GridClient, GridJobMetrics, GridJobRequest, GridJobState, GridSubmission};
use cadence_core::{ExecutionId, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::breaker::{BreakerState, CircuitBreaker};

pub struct ResilientGridClient<C> {
    inner: C,
    breaker: CircuitBreaker,
    attempts: u32,
    backoff: Duration,
}

impl<C: GridClient> ResilientGridClient<C> {
    pub fn new(inner: C, settings: &GridSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner,
            breaker: CircuitBreaker::new(
                "grid",
                settings.breaker_threshold,
                settings.breaker_cooldown,
                clock,
            ),
            attempts: settings.retry_attempts.max(1),
            backoff: settings.retry_backoff,
        }
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    async fn call<T, F, Fut>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let mut attempt = 1;
        loop {
            self.breaker.try_acquire()?;
            match f().await {
                Ok(value) => {
                    self.breaker.on_success();
                    return Ok(value);
                }
                Err(e) if e.is_transient() => {
                    self.breaker.on_failure();
                    if attempt >= self.attempts {
                        warn!(operation, attempt, error = %e, "Grid call failed");
                        return Err(e);
                    }
                    debug!(operation, attempt, error = %e, "Retrying grid call");
                    tokio::time::sleep(self.backoff * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    // The grid answered; only the request was bad.
                    self.breaker.on_success();
                    return Err(e);
                }
            }
        }
    }
}

#[async_trait]
impl<C: GridClient> GridClient for ResilientGridClient<C> {
    async fn submit_job(&self, request: &GridJobRequest) -> Result<GridSubmission> {
        self.call("submit_job", || self.inner.submit_job(request)).await
    }

    async fn job_status(&self, grid_job_id: &str) -> Result<GridJobState> {
        self.call("job_status", || self.inner.job_status(grid_job_id))
            .await
    }

    async fn job_metrics(&self, grid_job_id: &str) -> Result<GridJobMetrics> {
        self.call("job_metrics", || self.inner.job_metrics(grid_job_id))
            .await
    }

    async fn cancel_job(&self, grid_job_id: &str) -> Result<bool> {
        self.call("cancel_job", || self.inner.cancel_job(grid_job_id))
            .await
    }

    async fn cancel_job_by_execution_id(&self, execution_id: ExecutionId) -> Result<bool> {
        self.call("cancel_job_by_execution_id", || {
            self.inner.cancel_job_by_execution_id(execution_id)
        })
        .await
    }
}
