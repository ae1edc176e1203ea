//! CLI command implementations.

pub mod run;
pub mod trigger;

use anyhow::{Context, Result};
use cadence_config::{JobCatalog, OrchestratorConfig};
use cadence_core::clock::{Clock, SystemClock};
use cadence_core::schedule::JobSchedule;
use cadence_executor::{ExecutionEngine, ExecutorRegistry};
use cadence_scheduler::{DependencyGraph, Orchestrator};
use cadence_store::{JobStore, MemoryJobStore};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Parse a `key=value` parameter override.
pub fn parse_param(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got '{}'", s)),
    }
}

pub fn validate(path: &Path) -> Result<()> {
    let catalog = JobCatalog::load(path)
        .with_context(|| format!("Failed to load job catalog: {}", path.display()))?;

    let graph = DependencyGraph::from_jobs(&catalog.jobs);
    let order = graph.topological_order()?;

    println!("Catalog is valid: {} jobs, {} schedules", catalog.jobs.len(), catalog.schedules.len());
    for (position, id) in order.iter().enumerate() {
        if let Some(job) = catalog.jobs.iter().find(|j| j.id == *id) {
            let needs: Vec<&str> = job
                .dependencies
                .iter()
                .filter_map(|dep| catalog.jobs.iter().find(|j| j.id == *dep))
                .map(|j| j.name.as_str())
                .collect();
            if needs.is_empty() {
                println!("{:>3}. {}", position + 1, job.name);
            } else {
                println!("{:>3}. {} (needs {})", position + 1, job.name, needs.join(", "));
            }
        }
    }
    Ok(())
}

/// An orchestrator over an in-memory store loaded from a job catalog.
pub struct Runtime {
    pub config: OrchestratorConfig,
    pub clock: Arc<dyn Clock>,
    pub orchestrator: Orchestrator,
    pub catalog: JobCatalog,
}

pub async fn load_runtime(jobs: &Path, config: &Path) -> Result<Runtime> {
    let config = OrchestratorConfig::load(config)
        .with_context(|| format!("Failed to load configuration: {}", config.display()))?;
    let catalog = JobCatalog::load(jobs)
        .with_context(|| format!("Failed to load job catalog: {}", jobs.display()))?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(MemoryJobStore::new());
    for job in &catalog.jobs {
        store.save_job(job).await?;
    }
    for (job_id, spec) in &catalog.schedules {
        let schedule = JobSchedule::new(*job_id, spec.clone(), clock.now())?;
        store.save_schedule(&schedule).await?;
    }
    info!(
        jobs = catalog.jobs.len(),
        schedules = catalog.schedules.len(),
        "Job catalog loaded"
    );

    if config.grid.enabled {
        warn!("Grid execution is enabled but no grid endpoint is configured, running everything locally");
    }

    let registry = ExecutorRegistry::with_defaults(config.executor.drain_grace);
    let engine = ExecutionEngine::new(store.clone(), registry, config.executor.clone())
        .with_clock(clock.clone());
    let orchestrator = Orchestrator::builder(store.clone(), Arc::new(engine))
        .config(&config)
        .clock(clock.clone())
        .build();

    Ok(Runtime {
        config,
        clock,
        orchestrator,
        catalog,
    })
}
