//! Execution engine.
//!
//! Runs one execution to completion, either on the bounded local worker pool or on the
//! remote grid, recording PRE, MAIN and POST steps as it goes.
//!
//! Every tracked execution owns a cancellation token. Operator cancellation cancels the
//! token directly; a timeout cancels a child token handed to the executor, so the engine
//! can tell the two apart when reporting the outcome.

use cadence_config::{ExecutorSettings, GridSettings, OverflowPolicy, VariableContextBuilder};
use cadence_core::clock::{Clock, SystemClock};
use cadence_core::execution::{
    ExecutionResult, ExecutionStatus, ExecutionStep, JobExecution, StepPhase, StepStatus,
};
use cadence_core::executor::{ExecutionContext, JobExecutor, TaskOutput};
use cadence_core::grid::{GridClient, GridJobRequest, GridJobState};
use cadence_core::job::JobDefinition;
use cadence_core::{Error, ExecutionId, Result};
use cadence_store::JobStore;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::registry::ExecutorRegistry;

/// Host marker recorded on executions that ran on the grid.
pub const GRID_HOST: &str = "grid";

/// How long to wait for an executor to wind down after its token was cancelled.
const STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
struct ExecutionHandle {
    cancel: CancellationToken,
    grid_job_id: Option<String>,
    /// Set once the grid confirmed a cancel for `grid_job_id`.
    grid_cancelled: bool,
}

/// Outcome of running the three steps.
#[derive(Debug, Default)]
struct StepsOutcome {
    steps: Vec<ExecutionStep>,
    main: Option<TaskOutput>,
    error: Option<String>,
    warning: Option<String>,
    cancelled: bool,
}

pub struct ExecutionEngine {
    store: Arc<dyn JobStore>,
    registry: ExecutorRegistry,
    grid: Option<Arc<dyn GridClient>>,
    settings: ExecutorSettings,
    grid_settings: GridSettings,
    clock: Arc<dyn Clock>,
    pool: Arc<Semaphore>,
    handles: Mutex<HashMap<ExecutionId, ExecutionHandle>>,
    host: String,
}

impl ExecutionEngine {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: ExecutorRegistry,
        settings: ExecutorSettings,
    ) -> Self {
        let pool = Arc::new(Semaphore::new(settings.pool_size.max(1)));
        Self {
            store,
            registry,
            grid: None,
            settings,
            grid_settings: GridSettings::default(),
            clock: Arc::new(SystemClock),
            pool,
            handles: Mutex::new(HashMap::new()),
            host: local_host_name(),
        }
    }

    pub fn with_grid(mut self, grid: Arc<dyn GridClient>, settings: GridSettings) -> Self {
        self.grid = Some(grid);
        self.grid_settings = settings;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn default_timeout(&self) -> Duration {
        self.settings.default_timeout
    }

    fn handles(&self) -> std::sync::MutexGuard<'_, HashMap<ExecutionId, ExecutionHandle>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start tracking an execution so it can be cancelled before it starts running.
    pub fn track(&self, execution_id: ExecutionId) -> CancellationToken {
        self.handles()
            .entry(execution_id)
            .or_insert_with(|| ExecutionHandle {
                cancel: CancellationToken::new(),
                grid_job_id: None,
                grid_cancelled: false,
            })
            .cancel
            .clone()
    }

    fn untrack(&self, execution_id: ExecutionId) {
        self.handles().remove(&execution_id);
    }

    pub fn is_tracked(&self, execution_id: ExecutionId) -> bool {
        self.handles().contains_key(&execution_id)
    }

    pub fn active_executions(&self) -> usize {
        self.handles().len()
    }

    /// Grid is used only when enabled and the job declares resources, is critical, or
    /// has a heavy-compute type.
    pub fn should_use_grid(&self, job: &JobDefinition) -> bool {
        self.grid.is_some()
            && self.grid_settings.enabled
            && (!job.resources.is_empty()
                || job.critical
                || self.grid_settings.is_heavy(&job.job_type.to_string()))
    }

    /// Run `execution` of `job` to completion.
    ///
    /// The execution must be `QUEUED`. The engine moves it to `RUNNING` and fills in the
    /// running-phase fields; the terminal status is left to the caller.
    pub async fn execute(
        &self,
        job: &JobDefinition,
        execution: &mut JobExecution,
    ) -> ExecutionResult {
        let cancel = self.track(execution.id);
        let result = self.run(job, execution, &cancel).await;
        self.untrack(execution.id);

        info!(
            job = %job.name,
            execution_id = %execution.id,
            status = %result.final_status(),
            duration_ms = ?result.duration_ms(),
            "Execution finished"
        );
        result
    }

    async fn run(
        &self,
        job: &JobDefinition,
        execution: &mut JobExecution,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        if cancel.is_cancelled() {
            return cancelled_result();
        }

        let timeout = job.timeout(self.settings.default_timeout);
        let ctx = self.context(job, execution, timeout, cancel.child_token());

        if let Some(grid) = self.grid.clone() {
            if self.should_use_grid(job) {
                match self.submit_to_grid(grid.as_ref(), job, &ctx).await {
                    Some(grid_job_id) => {
                        return self
                            .run_on_grid(grid.as_ref(), execution, &ctx, cancel, grid_job_id)
                            .await;
                    }
                    None => info!(
                        job = %job.name,
                        execution_id = %execution.id,
                        "Falling back to local execution"
                    ),
                }
            }
        }

        self.run_local(job, execution, &ctx, cancel).await
    }

    fn context(
        &self,
        job: &JobDefinition,
        execution: &JobExecution,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> ExecutionContext {
        let variables = VariableContextBuilder::new()
            .with_parameters(execution.parameters.clone())
            .with_job(job.id, job.name.clone())
            .with_execution(execution.id, execution.retry_count)
            .with_date(self.clock.now())
            .build();

        ExecutionContext {
            job_id: job.id,
            job_name: job.name.clone(),
            job_type: job.job_type.clone(),
            execution_id: execution.id,
            command: variables.interpolate(&job.command),
            parameters: execution.parameters.clone(),
            retry_count: execution.retry_count,
            trigger_type: execution.trigger_type,
            triggered_by: execution.triggered_by.clone(),
            timeout,
            cancel,
        }
    }

    async fn mark_running(
        &self,
        execution: &mut JobExecution,
        host: &str,
        grid_job_id: Option<String>,
    ) -> Result<DateTime<Utc>> {
        execution.transition(ExecutionStatus::Running)?;
        let started_at = self.clock.now();
        execution.started_at = Some(started_at);
        execution.host = Some(host.to_string());
        execution.grid_job_id = grid_job_id;
        if let Err(e) = self.store.save_execution(execution).await {
            warn!(execution_id = %execution.id, error = %e, "Failed to persist running state");
        }
        Ok(started_at)
    }

    // Local path

    async fn run_local(
        &self,
        job: &JobDefinition,
        execution: &mut JobExecution,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let Some(executor) = self.registry.get(&job.job_type) else {
            return ExecutionResult::failed(format!(
                "no executor registered for job type '{}'",
                job.job_type
            ));
        };

        let permit = match self.settings.overflow {
            OverflowPolicy::Queue => tokio::select! {
                permit = self.pool.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return ExecutionResult::failed("local worker pool is closed"),
                },
                _ = cancel.cancelled() => return cancelled_result(),
            },
            OverflowPolicy::Reject => match self.pool.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(job = %job.name, execution_id = %execution.id, "Local worker pool full");
                    return ExecutionResult::failed("local worker pool is full");
                }
            },
        };

        let started_at = match self.mark_running(execution, &self.host, None).await {
            Ok(started_at) => started_at,
            Err(e) => return ExecutionResult::failed(e.to_string()),
        };
        debug!(
            job = %job.name,
            execution_id = %execution.id,
            command = %ctx.command,
            timeout_secs = ctx.timeout.as_secs(),
            "Running locally"
        );

        let steps = self.run_steps(executor.as_ref(), ctx);
        tokio::pin!(steps);

        let (outcome, timed_out) = tokio::select! {
            outcome = &mut steps => (Some(outcome), false),
            _ = tokio::time::sleep(ctx.timeout) => {
                warn!(
                    job = %job.name,
                    execution_id = %execution.id,
                    timeout_secs = ctx.timeout.as_secs(),
                    "Execution timed out"
                );
                ctx.cancel.cancel();
                let stopped = tokio::time::timeout(
                    self.settings.drain_grace + STOP_GRACE,
                    &mut steps,
                )
                .await
                .ok();
                (stopped, true)
            }
        };
        drop(permit);

        let outcome = outcome.unwrap_or_default();
        let mut result = ExecutionResult {
            started_at: Some(started_at),
            finished_at: Some(self.clock.now()),
            host: Some(self.host.clone()),
            ..Default::default()
        };

        if let Some(main) = &outcome.main {
            result.exit_code = main.exit_code;
            result.process_id = main.process_id.map(|pid| pid.to_string());
            result.output = (!main.stdout.is_empty()).then(|| main.stdout.clone());
            result.output_parameters = main.output_parameters.clone();
        }
        if let Some(ms) = result.duration_ms() {
            result.metrics.insert("duration_ms".into(), ms.into());
        }
        result.metrics.insert("executor".into(), executor.name().into());
        result.steps = outcome.steps;
        result.warning = outcome.warning;

        if timed_out {
            result.timed_out = true;
            result.error = Some(format!(
                "execution exceeded timeout of {}s",
                ctx.timeout.as_secs()
            ));
        } else if outcome.cancelled || cancel.is_cancelled() {
            result.cancelled = true;
            result.error = Some("execution cancelled".to_string());
        } else if outcome.error.is_some() {
            result.error = outcome.error;
        } else {
            result.success = true;
        }
        result
    }

    async fn run_steps(&self, executor: &dyn JobExecutor, ctx: &ExecutionContext) -> StepsOutcome {
        let mut outcome = StepsOutcome::default();

        let started = self.clock.now();
        let pre = executor.pre_execute(ctx).await;
        let step_ok = self.record_step(&mut outcome, ctx, StepPhase::Pre, started, &pre).await;
        if !step_ok {
            outcome.error = Some(format!(
                "pre-execution step failed: {}",
                step_error(&pre)
            ));
            return outcome;
        }

        let started = self.clock.now();
        let main = executor.execute(ctx).await;
        let main_ok = self.record_step(&mut outcome, ctx, StepPhase::Main, started, &main).await;
        if let Ok(output) = &main {
            outcome.main = Some(output.clone());
        }
        if !main_ok {
            outcome.error = Some(step_error(&main));
            return outcome;
        }

        let started = self.clock.now();
        let post = executor.post_execute(ctx).await;
        if !self.record_step(&mut outcome, ctx, StepPhase::Post, started, &post).await {
            let warning = format!("post-execution step failed: {}", step_error(&post));
            warn!(execution_id = %ctx.execution_id, warning = %warning, "Post step failed");
            outcome.warning = Some(warning);
        }
        outcome
    }

    /// Append and persist a step. Returns whether the step succeeded.
    async fn record_step(
        &self,
        outcome: &mut StepsOutcome,
        ctx: &ExecutionContext,
        phase: StepPhase,
        started_at: DateTime<Utc>,
        result: &Result<TaskOutput>,
    ) -> bool {
        let succeeded = matches!(result, Ok(output) if output.success);
        if matches!(result, Err(Error::ExecutionCancelled)) {
            outcome.cancelled = true;
        }

        let step = ExecutionStep {
            execution_id: ctx.execution_id,
            step_number: phase.step_number(),
            phase,
            status: if succeeded {
                StepStatus::Succeeded
            } else {
                StepStatus::Failed
            },
            started_at,
            finished_at: self.clock.now(),
            output: match result {
                Ok(output) if !output.stdout.is_empty() => Some(output.stdout.clone()),
                _ => None,
            },
            error: (!succeeded).then(|| step_error(result)),
        };
        if let Err(e) = self.store.save_step(&step).await {
            warn!(execution_id = %ctx.execution_id, phase = %phase, error = %e, "Failed to persist step");
        }
        outcome.steps.push(step);
        succeeded
    }

    // Grid path

    async fn submit_to_grid(
        &self,
        grid: &dyn GridClient,
        job: &JobDefinition,
        ctx: &ExecutionContext,
    ) -> Option<String> {
        let mut resources: BTreeMap<String, u32> = job.resources.as_map().clone();
        if resources.is_empty() {
            resources.insert("cpu".to_string(), 1);
            resources.insert("memory_mb".to_string(), 1024);
        }

        let request = GridJobRequest {
            job_id: job.id,
            job_name: job.name.clone(),
            execution_id: ctx.execution_id,
            job_type: job.job_type.to_string(),
            priority: job.priority,
            timeout_minutes: ctx.timeout.as_secs().div_ceil(60),
            resources,
            context: ctx.to_payload(),
        };

        match grid.submit_job(&request).await {
            Ok(submission) if submission.accepted => match submission.grid_job_id {
                Some(grid_job_id) => {
                    info!(
                        job = %job.name,
                        execution_id = %ctx.execution_id,
                        grid_job_id = %grid_job_id,
                        "Submitted to grid"
                    );
                    Some(grid_job_id)
                }
                None => {
                    warn!(execution_id = %ctx.execution_id, "Grid accepted job without an id");
                    None
                }
            },
            Ok(submission) => {
                warn!(
                    execution_id = %ctx.execution_id,
                    message = submission.message.as_deref().unwrap_or(""),
                    "Grid rejected job"
                );
                None
            }
            Err(e) => {
                warn!(execution_id = %ctx.execution_id, error = %e, "Grid submission failed");
                None
            }
        }
    }

    async fn run_on_grid(
        &self,
        grid: &dyn GridClient,
        execution: &mut JobExecution,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
        grid_job_id: String,
    ) -> ExecutionResult {
        if let Some(handle) = self.handles().get_mut(&execution.id) {
            handle.grid_job_id = Some(grid_job_id.clone());
        }

        // Cancelled while the submission was in flight
        if cancel.is_cancelled() {
            self.cancel_remote(grid, execution.id, &grid_job_id).await;
            return ExecutionResult {
                grid_job_id: Some(grid_job_id),
                ..cancelled_result()
            };
        }

        let started_at = match self
            .mark_running(execution, GRID_HOST, Some(grid_job_id.clone()))
            .await
        {
            Ok(started_at) => started_at,
            Err(e) => return ExecutionResult::failed(e.to_string()),
        };

        let mut result = ExecutionResult {
            started_at: Some(started_at),
            host: Some(GRID_HOST.to_string()),
            grid_job_id: Some(grid_job_id.clone()),
            ..Default::default()
        };

        let poll_interval = self.grid_settings.poll_interval.max(Duration::from_millis(1));
        let max_polls = u64::try_from(
            ctx.timeout
                .as_millis()
                .div_ceil(poll_interval.as_millis()),
        )
        .unwrap_or(u64::MAX)
        .max(1);

        let mut finished = None;
        for poll in 1..=max_polls {
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = cancel.cancelled() => {
                    self.cancel_remote(grid, execution.id, &grid_job_id).await;
                    result.cancelled = true;
                    result.error = Some("execution cancelled".to_string());
                    break;
                }
            }

            match grid.job_status(&grid_job_id).await {
                Ok(state) if state.is_terminal() => {
                    finished = Some(state);
                    break;
                }
                Ok(state) => debug!(grid_job_id = %grid_job_id, poll, state = ?state, "Grid job in progress"),
                Err(e) => warn!(grid_job_id = %grid_job_id, poll, error = %e, "Grid status poll failed"),
            }
        }

        let step_started = started_at;
        match finished {
            Some(GridJobState::Completed {
                success,
                output,
                error,
                log_path,
            }) => {
                result.success = success;
                result.output = output;
                result.error = if success {
                    None
                } else {
                    Some(error.unwrap_or_else(|| "grid job failed".to_string()))
                };
                result.log_ref = log_path;
                match grid.job_metrics(&grid_job_id).await {
                    Ok(metrics) => result.metrics = metrics.to_map(),
                    Err(e) => warn!(grid_job_id = %grid_job_id, error = %e, "Failed to fetch grid metrics"),
                }
            }
            Some(GridJobState::Failed { error }) => {
                result.error = Some(error);
            }
            Some(GridJobState::Pending | GridJobState::Running) | None => {
                if !result.cancelled {
                    warn!(
                        grid_job_id = %grid_job_id,
                        execution_id = %execution.id,
                        "Grid job exceeded its poll budget"
                    );
                    if let Err(e) = grid.cancel_job(&grid_job_id).await {
                        error!(grid_job_id = %grid_job_id, error = %e, "Failed to cancel timed out grid job");
                    }
                    result.timed_out = true;
                    result.error = Some(format!(
                        "grid execution exceeded timeout of {}s",
                        ctx.timeout.as_secs()
                    ));
                }
            }
        }

        result.finished_at = Some(self.clock.now());
        let step = ExecutionStep {
            execution_id: execution.id,
            step_number: StepPhase::Main.step_number(),
            phase: StepPhase::Main,
            status: if result.success {
                StepStatus::Succeeded
            } else {
                StepStatus::Failed
            },
            started_at: step_started,
            finished_at: self.clock.now(),
            output: result.output.clone(),
            error: result.error.clone(),
        };
        if let Err(e) = self.store.save_step(&step).await {
            warn!(execution_id = %execution.id, error = %e, "Failed to persist step");
        }
        result.steps.push(step);
        result
    }

    /// Cancel `grid_job_id` unless the grid already confirmed a cancel for it.
    async fn cancel_remote(&self, grid: &dyn GridClient, execution_id: ExecutionId, grid_job_id: &str) {
        let confirmed = self
            .handles()
            .get(&execution_id)
            .is_some_and(|h| h.grid_cancelled);
        if confirmed {
            return;
        }
        match grid.cancel_job(grid_job_id).await {
            Ok(true) => info!(execution_id = %execution_id, grid_job_id, "Cancelled grid job"),
            Ok(false) => warn!(execution_id = %execution_id, grid_job_id, "Grid did not confirm cancel"),
            Err(e) => error!(execution_id = %execution_id, grid_job_id, error = %e, "Failed to cancel grid job"),
        }
    }

    // Cancellation

    /// Cancel a tracked or remote execution. Returns whether cancellation was confirmed.
    pub async fn cancel_execution(&self, execution_id: ExecutionId) -> Result<bool> {
        let handle = self.handles().get(&execution_id).cloned();

        match handle {
            Some(ExecutionHandle {
                cancel,
                grid_job_id: None,
                ..
            }) => {
                info!(execution_id = %execution_id, "Cancelling local execution");
                cancel.cancel();
                Ok(true)
            }
            Some(ExecutionHandle {
                cancel,
                grid_job_id: Some(grid_job_id),
                ..
            }) => {
                let grid = self
                    .grid
                    .as_ref()
                    .ok_or_else(|| Error::Internal("grid execution without a grid client".into()))?;
                let confirmed = grid.cancel_job(&grid_job_id).await?;
                if confirmed {
                    info!(execution_id = %execution_id, grid_job_id = %grid_job_id, "Cancelled grid execution");
                    if let Some(handle) = self.handles().get_mut(&execution_id) {
                        handle.grid_cancelled = true;
                    }
                    cancel.cancel();
                }
                Ok(confirmed)
            }
            None => match &self.grid {
                Some(grid) => grid.cancel_job_by_execution_id(execution_id).await,
                None => Ok(false),
            },
        }
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("registry", &self.registry)
            .field("settings", &self.settings)
            .field("grid_enabled", &(self.grid.is_some() && self.grid_settings.enabled))
            .field("active", &self.active_executions())
            .finish()
    }
}

fn cancelled_result() -> ExecutionResult {
    ExecutionResult {
        cancelled: true,
        error: Some("execution cancelled".to_string()),
        ..Default::default()
    }
}

fn step_error(result: &Result<TaskOutput>) -> String {
    match result {
        Ok(output) => output.failure_message(),
        Err(e) => e.to_string(),
    }
}

fn local_host_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string())
}
