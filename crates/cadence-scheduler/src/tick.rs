//! The scheduling loop.
//!
//! Each tick fires due schedules, offers held executions for dispatch again, releases
//! waiting executions whose dependencies have since been met, and times out `RUNNING`
//! records that nothing drives any more.

use cadence_config::SchedulerSettings;
use cadence_core::Result;
use cadence_core::clock::Clock;
use cadence_core::schedule::JobSchedule;
use cadence_store::JobStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::orchestrator::{Orchestrator, SubmitOutcome, SubmitRequest};

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub due: usize,
    pub submitted: usize,
    pub skipped: usize,
    pub errors: usize,
    /// Held executions dispatched.
    pub released: usize,
    /// Waiting executions whose dependencies were met.
    pub promoted: usize,
    /// Stale running executions marked timed out.
    pub reconciled: usize,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        *self == TickReport::default()
    }
}

pub struct SchedulerLoop {
    orchestrator: Orchestrator,
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
}

impl SchedulerLoop {
    pub fn new(orchestrator: Orchestrator, clock: Arc<dyn Clock>, settings: SchedulerSettings) -> Self {
        Self {
            store: orchestrator.store().clone(),
            orchestrator,
            clock,
            settings,
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Run one scheduling pass.
    pub async fn tick(&self) -> Result<TickReport> {
        let now = self.clock.now();
        let due = self
            .store
            .find_due_schedules(now, self.settings.batch_size)
            .await?;
        let mut report = TickReport {
            due: due.len(),
            ..Default::default()
        };

        for schedule in &due {
            let request = SubmitRequest::scheduled(schedule.job_id, schedule.id);
            match self.orchestrator.submit(request).await {
                Ok(SubmitOutcome::Skipped) => report.skipped += 1,
                Ok(outcome) => {
                    debug!(schedule_id = %schedule.id, ?outcome, "Schedule fired");
                    report.submitted += 1;
                }
                Err(e) => {
                    warn!(
                        schedule_id = %schedule.id,
                        job_id = %schedule.job_id,
                        error = %e,
                        "Scheduled submission failed"
                    );
                    report.errors += 1;
                }
            }

            // Advanced regardless of the submission outcome
            if let Err(e) = self.advance(schedule, now).await {
                warn!(schedule_id = %schedule.id, error = %e, "Failed to advance schedule");
            }
        }

        report.released = self.orchestrator.drain_backlog().await;
        report.promoted = self.orchestrator.reconsider_waiting().await;
        report.reconciled = self
            .orchestrator
            .reconcile_stale(self.settings.stale_grace)
            .await;
        Ok(report)
    }

    async fn advance(&self, schedule: &JobSchedule, fired_at: DateTime<Utc>) -> Result<()> {
        let next = match schedule.following_run(fired_at) {
            Ok(next) => next,
            Err(e) => {
                warn!(schedule_id = %schedule.id, spec = %schedule.spec, error = %e, "Cannot compute next run, deactivating");
                None
            }
        };
        self.store
            .update_schedule(schedule.id, next, Some(fired_at), next.is_some())
            .await?;
        Ok(())
    }

    /// Tick every poll interval until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            batch_size = self.settings.batch_size,
            "Starting scheduler loop"
        );

        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => match self.tick().await {
                    Ok(report) if report.is_idle() => {}
                    Ok(report) => debug!(?report, "Tick complete"),
                    Err(e) => warn!(error = %e, "Scheduler tick failed"),
                },
            }
        }

        self.orchestrator.shutdown();
        info!("Scheduler loop stopped");
    }
}
