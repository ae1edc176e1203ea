//! One-shot manual trigger command.

use anyhow::{Context, Result, bail};
use cadence_core::execution::{ExecutionStatus, JobExecution};
use cadence_scheduler::{ExecutionEvent, SubmitOutcome, SubmitRequest};
use cadence_store::ExecutionFilter;
use std::path::Path;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

use super::load_runtime;

const IDLE_CHECK: Duration = Duration::from_millis(200);

/// Submit `job_name` manually and wait for it, its retries and any dependents it triggers.
pub async fn trigger(
    jobs: &Path,
    config: &Path,
    job_name: &str,
    params: Vec<(String, String)>,
    json: bool,
) -> Result<()> {
    let runtime = load_runtime(jobs, config).await?;
    let job = runtime
        .catalog
        .job(job_name)
        .with_context(|| format!("No job named '{}' in {}", job_name, jobs.display()))?
        .clone();
    let orchestrator = &runtime.orchestrator;
    let started = runtime.clock.now();

    let mut events = orchestrator.subscribe();
    let request = SubmitRequest::manual(job.id, "cli").with_parameters(params.into_iter().collect());
    match orchestrator.submit(request).await? {
        SubmitOutcome::WaitingDependency(id) => {
            let unmet = orchestrator.resolver().unmet_dependencies(job.id).await?;
            let names: Vec<String> = unmet
                .iter()
                .filter_map(|id| runtime.catalog.jobs.iter().find(|j| j.id == *id))
                .map(|j| j.name.clone())
                .collect();
            bail!(
                "Execution {} is waiting on dependencies: {}",
                id,
                names.join(", ")
            );
        }
        SubmitOutcome::Rejected(id) => bail!("Execution {} was rejected by admission control", id),
        outcome => println!("Submitted {} ({:?})", job.name, outcome),
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => print_event(&event, json),
                Err(RecvError::Lagged(missed)) => println!("... {} events missed", missed),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::time::sleep(IDLE_CHECK) => {
                // No scheduler loop runs here, so held executions are offered again by hand
                orchestrator.drain_backlog().await;
                if orchestrator.is_idle() {
                    break;
                }
            }
        }
    }

    let filter = ExecutionFilter {
        since: Some(started),
        ..Default::default()
    };
    let mut history = orchestrator.execution_history(&filter).await?;
    history.reverse();

    println!();
    println!("{:<24} {:<20} {:<10} {:>10} {:>5}", "JOB", "STATUS", "TRIGGER", "DURATION", "EXIT");
    for execution in &history {
        println!(
            "{:<24} {:<20} {:<10} {:>10} {:>5}",
            execution.job_name,
            execution.status.to_string(),
            execution.trigger_type.to_string(),
            execution
                .duration_ms
                .map(|ms| format!("{}ms", ms))
                .unwrap_or_else(|| "-".into()),
            execution
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".into()),
        );
    }

    let last = history.iter().rev().find(|e| e.job_id == job.id);
    match last {
        Some(execution) if execution.status == ExecutionStatus::Success => Ok(()),
        Some(execution) => bail!("{} finished {}{}", job.name, execution.status, error_suffix(execution)),
        None => bail!("{} did not run", job.name),
    }
}

fn error_suffix(execution: &JobExecution) -> String {
    execution
        .error_message
        .as_deref()
        .map(|e| format!(": {}", e))
        .unwrap_or_default()
}

fn print_event(event: &ExecutionEvent, json: bool) {
    if json {
        if let Ok(line) = serde_json::to_string(event) {
            println!("{}", line);
        }
        return;
    }
    match event {
        ExecutionEvent::Waiting { job, .. } => println!("{:<24} waiting on dependencies", job),
        ExecutionEvent::Queued { job, execution_id } => println!("{:<24} queued {}", job, execution_id),
        ExecutionEvent::Dispatched { job, .. } => println!("{:<24} running", job),
        ExecutionEvent::Finished {
            job,
            status,
            duration_ms,
            ..
        } => println!(
            "{:<24} {} after {}ms",
            job,
            status,
            duration_ms.unwrap_or(0)
        ),
        ExecutionEvent::RetryScheduled { job, delay_secs, .. } => {
            println!("{:<24} retry in {}s", job, delay_secs)
        }
    }
}
