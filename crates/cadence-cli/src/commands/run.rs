//! Long-running scheduler command.

use anyhow::{Context, Result};
use cadence_scheduler::SchedulerLoop;
use std::path::Path;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::load_runtime;

/// Cancelled on SIGTERM or SIGINT.
fn install_shutdown_handler() -> Result<CancellationToken> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        }
        trigger.cancel();
    });
    Ok(token)
}

/// Run the scheduler loop until interrupted, then wait for in-flight executions.
pub async fn run(jobs: &Path, config: &Path) -> Result<()> {
    let runtime = load_runtime(jobs, config).await?;
    let shutdown = install_shutdown_handler()?;
    let grace = runtime.config.cancel_wait;

    let scheduler = SchedulerLoop::new(
        runtime.orchestrator.clone(),
        runtime.clock.clone(),
        runtime.config.scheduler.clone(),
    );
    scheduler.run(shutdown).await;

    let orchestrator = &runtime.orchestrator;
    let running = orchestrator.running_jobs().await?;
    if !running.is_empty() {
        info!(
            running = running.len(),
            grace_secs = grace.as_secs(),
            "Waiting for running executions"
        );
        let drained = tokio::time::timeout(grace, async {
            while !orchestrator.running_jobs().await.map(|r| r.is_empty()).unwrap_or(true) {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        })
        .await;
        if drained.is_err() {
            for job in orchestrator.running_jobs().await? {
                info!(job = %job.job_name, execution_id = %job.execution_id, "Cancelling execution at shutdown");
                orchestrator.cancel(job.execution_id, "shutdown").await?;
            }
        }
    }

    let metrics = orchestrator.metrics();
    info!(
        submitted = metrics.submitted,
        completed = metrics.completed,
        failed = metrics.failed,
        timed_out = metrics.timed_out,
        cancelled = metrics.cancelled,
        "Scheduler stopped"
    );
    Ok(())
}
