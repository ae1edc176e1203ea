//! Execution orchestrator.
//!
//! Drives executions through their lifecycle:
//!
//! ```text
//! submit ─► dependencies met? ──no──► WAITING_DEPENDENCY (reconsidered every tick)
//!                 │ yes
//!                 ▼
//!              QUEUED ─► running set + admission ──held──► backlog
//!                 │ granted
//!                 ▼
//!          execution engine ─► completion: persist, release, alert,
//!                                          trigger dependents or schedule a retry
//! ```
//!
//! At most one execution per job is dispatched at a time. Membership in the running set
//! is held by a guard owned by the dispatched task, so it is released only once the
//! execution has terminated.

use cadence_config::{OrchestratorConfig, OverflowPolicy, ResolutionWindow};
use cadence_core::admission::{Admission, AlwaysAdmit, CapacityAdmission};
use cadence_core::alert::{AlertSink, AlertType, TracingAlertSink};
use cadence_core::clock::{Clock, SystemClock};
use cadence_core::execution::{
    ExecutionResult, ExecutionStatus, JobExecution, Parameters, TriggerType,
};
use cadence_core::job::JobDefinition;
use cadence_core::schedule::ScheduleSpec;
use cadence_core::{Error, ExecutionId, JobId, Result, ScheduleId};
use cadence_executor::ExecutionEngine;
use cadence_store::{ExecutionFilter, JobStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::metrics::{ExecutionMetrics, MetricsSnapshot};
use crate::resolver::DependencyResolver;
use crate::running::{RunningGuard, RunningJobs};
use crate::timer::DelayedTasks;

/// Actor recorded on retries created by the orchestrator itself.
pub const AUTO_RETRY_ACTOR: &str = "auto-retry";
/// Actor recorded on scheduled submissions.
pub const SCHEDULER_ACTOR: &str = "scheduler";

const SYSTEM_ACTOR: &str = "system";
const EVENT_CAPACITY: usize = 256;

/// A request to run a job.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub job_id: JobId,
    pub trigger_type: TriggerType,
    pub triggered_by: String,
    /// Overrides the job's default parameters.
    pub parameters: Parameters,
    pub schedule_id: Option<ScheduleId>,
}

impl SubmitRequest {
    pub fn manual(job_id: JobId, actor: impl Into<String>) -> Self {
        Self {
            job_id,
            trigger_type: TriggerType::Manual,
            triggered_by: actor.into(),
            parameters: Parameters::new(),
            schedule_id: None,
        }
    }

    pub fn scheduled(job_id: JobId, schedule_id: ScheduleId) -> Self {
        Self {
            job_id,
            trigger_type: TriggerType::Scheduled,
            triggered_by: SCHEDULER_ACTOR.to_string(),
            parameters: Parameters::new(),
            schedule_id: Some(schedule_id),
        }
    }

    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

/// What happened to a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Handed to the execution engine.
    Dispatched(ExecutionId),
    /// `QUEUED` but held back until the job stops running or resources free up.
    Queued(ExecutionId),
    /// Dependencies unmet. May be an existing waiting execution for the same window.
    WaitingDependency(ExecutionId),
    /// Admission denied under the reject policy; the execution failed.
    Rejected(ExecutionId),
    /// Scheduled submission while the job was already running.
    Skipped,
}

impl SubmitOutcome {
    pub fn execution_id(&self) -> Option<ExecutionId> {
        match self {
            SubmitOutcome::Dispatched(id)
            | SubmitOutcome::Queued(id)
            | SubmitOutcome::WaitingDependency(id)
            | SubmitOutcome::Rejected(id) => Some(*id),
            SubmitOutcome::Skipped => None,
        }
    }
}

/// Lifecycle events, broadcast to subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    Waiting {
        job: String,
        execution_id: ExecutionId,
    },
    Queued {
        job: String,
        execution_id: ExecutionId,
    },
    Dispatched {
        job: String,
        execution_id: ExecutionId,
    },
    Finished {
        job: String,
        execution_id: ExecutionId,
        status: ExecutionStatus,
        duration_ms: Option<u64>,
    },
    RetryScheduled {
        job: String,
        execution_id: ExecutionId,
        delay_secs: u64,
    },
}

/// One entry of the running-jobs view.
#[derive(Debug, Clone, Serialize)]
pub struct RunningJob {
    pub execution_id: ExecutionId,
    pub job_id: JobId,
    pub job_name: String,
    pub status: ExecutionStatus,
    pub trigger_type: TriggerType,
    pub triggered_by: String,
    pub started_at: Option<DateTime<Utc>>,
    pub running_seconds: i64,
    pub host: Option<String>,
}

struct Shared {
    store: Arc<dyn JobStore>,
    engine: Arc<ExecutionEngine>,
    resolver: DependencyResolver,
    admission: Arc<dyn Admission>,
    alerts: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    on_deny: OverflowPolicy,
    cancel_wait: Duration,
    running: RunningJobs,
    retries: DelayedTasks,
    metrics: ExecutionMetrics,
    events: broadcast::Sender<ExecutionEvent>,
    backlog: Mutex<VecDeque<ExecutionId>>,
    completions: Mutex<HashMap<ExecutionId, watch::Sender<Option<ExecutionStatus>>>>,
    cancel_requests: Mutex<HashMap<ExecutionId, String>>,
}

pub struct OrchestratorBuilder {
    store: Arc<dyn JobStore>,
    engine: Arc<ExecutionEngine>,
    admission: Option<Arc<dyn Admission>>,
    alerts: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    window: ResolutionWindow,
    on_deny: OverflowPolicy,
    cancel_wait: Duration,
    capacity: BTreeMap<String, u32>,
}

impl OrchestratorBuilder {
    pub fn new(store: Arc<dyn JobStore>, engine: Arc<ExecutionEngine>) -> Self {
        let defaults = OrchestratorConfig::default();
        Self {
            store,
            engine,
            admission: None,
            alerts: Arc::new(TracingAlertSink),
            clock: Arc::new(SystemClock),
            window: defaults.dependencies.window,
            on_deny: defaults.admission.on_deny,
            cancel_wait: defaults.cancel_wait,
            capacity: defaults.admission.capacity,
        }
    }

    /// Take the dependency window, admission and cancel settings from `config`.
    pub fn config(mut self, config: &OrchestratorConfig) -> Self {
        self.window = config.dependencies.window;
        self.on_deny = config.admission.on_deny;
        self.capacity = config.admission.capacity.clone();
        self.cancel_wait = config.cancel_wait;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn admission(mut self, admission: Arc<dyn Admission>) -> Self {
        self.admission = Some(admission);
        self
    }

    pub fn alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn build(self) -> Orchestrator {
        let admission = self.admission.unwrap_or_else(|| {
            if self.capacity.is_empty() {
                Arc::new(AlwaysAdmit)
            } else {
                Arc::new(CapacityAdmission::new(self.capacity))
            }
        });
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Orchestrator {
            shared: Arc::new(Shared {
                resolver: DependencyResolver::new(
                    self.store.clone(),
                    self.clock.clone(),
                    self.window,
                ),
                store: self.store,
                engine: self.engine,
                admission,
                alerts: self.alerts,
                clock: self.clock,
                on_deny: self.on_deny,
                cancel_wait: self.cancel_wait,
                running: RunningJobs::new(),
                retries: DelayedTasks::new(),
                metrics: ExecutionMetrics::new(),
                events,
                backlog: Mutex::new(VecDeque::new()),
                completions: Mutex::new(HashMap::new()),
                cancel_requests: Mutex::new(HashMap::new()),
            }),
        }
    }
}

/// Coordinates submission, dispatch, completion, cancellation and retries.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Orchestrator {
    pub fn builder(store: Arc<dyn JobStore>, engine: Arc<ExecutionEngine>) -> OrchestratorBuilder {
        OrchestratorBuilder::new(store, engine)
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.shared.store
    }

    pub fn resolver(&self) -> &DependencyResolver {
        &self.shared.resolver
    }

    fn emit(&self, event: ExecutionEvent) {
        // No subscribers is fine.
        let _ = self.shared.events.send(event);
    }

    async fn persist(&self, execution: &JobExecution) {
        if let Err(e) = self.shared.store.save_execution(execution).await {
            error!(execution_id = %execution.id, error = %e, "Failed to persist execution");
        }
    }

    // Submission

    /// Submit a job for execution.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitOutcome> {
        let shared = &self.shared;
        let job = shared.store.get_job(request.job_id).await?;
        if !job.active {
            return Err(Error::Inactive(job.name));
        }

        if request.trigger_type == TriggerType::Scheduled && shared.running.contains(job.id) {
            info!(job = %job.name, "Job already running, skipping scheduled run");
            return Ok(SubmitOutcome::Skipped);
        }

        let parameters = job.merged_parameters(&request.parameters);
        let mut execution = JobExecution::new(
            &job,
            request.trigger_type,
            request.triggered_by,
            parameters,
            shared.clock.now(),
        );
        execution.schedule_id = request.schedule_id;

        if !shared.resolver.check_dependencies(job.id).await? {
            if let Some(existing) = self.waiting_execution(job.id).await? {
                debug!(job = %job.name, execution_id = %existing.id, "Already waiting on dependencies");
                return Ok(SubmitOutcome::WaitingDependency(existing.id));
            }
            execution.transition(ExecutionStatus::WaitingDependency)?;
            shared.store.save_execution(&execution).await?;
            info!(job = %job.name, execution_id = %execution.id, "Waiting on dependencies");
            self.emit(ExecutionEvent::Waiting {
                job: job.name.clone(),
                execution_id: execution.id,
            });
            return Ok(SubmitOutcome::WaitingDependency(execution.id));
        }

        self.queue(&job, &mut execution).await?;
        Ok(self.dispatch(job, execution))
    }

    /// The job's waiting execution in the current window, if any.
    async fn waiting_execution(&self, job_id: JobId) -> Result<Option<JobExecution>> {
        let since = self.shared.resolver.window_start();
        let recent = self
            .shared
            .store
            .find_recent_executions(job_id, since)
            .await?;
        Ok(recent
            .into_iter()
            .find(|e| e.status == ExecutionStatus::WaitingDependency))
    }

    /// Move a new execution to `QUEUED` and persist it.
    async fn queue(&self, job: &JobDefinition, execution: &mut JobExecution) -> Result<()> {
        execution.transition(ExecutionStatus::Queued)?;
        self.shared.store.save_execution(execution).await?;
        self.shared.metrics.record_submitted();
        debug!(job = %job.name, execution_id = %execution.id, trigger = %execution.trigger_type, "Execution queued");
        self.emit(ExecutionEvent::Queued {
            job: job.name.clone(),
            execution_id: execution.id,
        });
        Ok(())
    }

    /// Dispatch a `QUEUED` execution, or hold it in the backlog.
    fn dispatch(&self, job: JobDefinition, execution: JobExecution) -> SubmitOutcome {
        let shared = &self.shared;

        let Some(guard) = shared.running.try_claim(job.id, execution.id) else {
            debug!(job = %job.name, execution_id = %execution.id, "Job running, holding execution");
            self.hold(execution.id);
            return SubmitOutcome::Queued(execution.id);
        };

        let granted = match shared.admission.reserve(execution.id, &job.resources) {
            Ok(granted) => granted,
            Err(e) => {
                warn!(job = %job.name, execution_id = %execution.id, error = %e, "Admission check failed");
                false
            }
        };
        if !granted {
            drop(guard);
            return match shared.on_deny {
                OverflowPolicy::Queue => {
                    info!(job = %job.name, execution_id = %execution.id, "Resources unavailable, holding execution");
                    self.hold(execution.id);
                    SubmitOutcome::Queued(execution.id)
                }
                OverflowPolicy::Reject => {
                    warn!(job = %job.name, execution_id = %execution.id, "Resources unavailable, rejecting execution");
                    let id = execution.id;
                    self.spawn_completion(
                        job,
                        execution,
                        ExecutionResult::failed("admission denied: requested resources unavailable"),
                    );
                    SubmitOutcome::Rejected(id)
                }
            };
        }

        let id = execution.id;
        self.spawn_execution(job, execution, guard);
        SubmitOutcome::Dispatched(id)
    }

    fn hold(&self, execution_id: ExecutionId) {
        let mut backlog = lock(&self.shared.backlog);
        if !backlog.contains(&execution_id) {
            backlog.push_back(execution_id);
        }
    }

    fn take_from_backlog(&self, execution_id: ExecutionId) -> bool {
        let mut backlog = lock(&self.shared.backlog);
        let before = backlog.len();
        backlog.retain(|id| *id != execution_id);
        backlog.len() != before
    }

    pub fn backlog_len(&self) -> usize {
        lock(&self.shared.backlog).len()
    }

    fn spawn_execution(&self, job: JobDefinition, execution: JobExecution, guard: RunningGuard) {
        let shared = &self.shared;
        // Tracked before the task starts so a queued execution can be cancelled.
        shared.engine.track(execution.id);
        self.watch_completion(execution.id);

        info!(
            job = %job.name,
            execution_id = %execution.id,
            trigger = %execution.trigger_type,
            retry_count = execution.retry_count,
            "Dispatching execution"
        );
        self.emit(ExecutionEvent::Dispatched {
            job: job.name.clone(),
            execution_id: execution.id,
        });

        let this = self.clone();
        tokio::spawn(async move {
            let mut execution = execution;
            let result = this.shared.engine.execute(&job, &mut execution).await;
            this.complete(job, execution, result, Some(guard)).await;
        });
    }

    fn spawn_completion(&self, job: JobDefinition, execution: JobExecution, result: ExecutionResult) {
        self.watch_completion(execution.id);
        let this = self.clone();
        tokio::spawn(async move {
            this.complete(job, execution, result, None).await;
        });
    }

    fn watch_completion(&self, execution_id: ExecutionId) {
        let (done, _) = watch::channel(None);
        lock(&self.shared.completions).insert(execution_id, done);
    }

    /// Offer every held execution for dispatch again, oldest first.
    pub async fn drain_backlog(&self) -> usize {
        let held: Vec<ExecutionId> = lock(&self.shared.backlog).drain(..).collect();
        let mut dispatched = 0;

        for id in held {
            match self.redispatch(id).await {
                Ok(SubmitOutcome::Dispatched(_)) => dispatched += 1,
                Ok(_) => {}
                Err(e) => warn!(execution_id = %id, error = %e, "Failed to dispatch held execution"),
            }
        }
        dispatched
    }

    async fn redispatch(&self, id: ExecutionId) -> Result<SubmitOutcome> {
        let execution = self.shared.store.get_execution(id).await?;
        if execution.status != ExecutionStatus::Queued {
            return Ok(SubmitOutcome::Skipped);
        }
        let job = self.shared.store.get_job(execution.job_id).await?;
        Ok(self.dispatch(job, execution))
    }

    /// Dispatch waiting executions of the current window whose dependencies are now met.
    pub async fn reconsider_waiting(&self) -> usize {
        let filter = ExecutionFilter {
            status: Some(ExecutionStatus::WaitingDependency),
            since: Some(self.shared.resolver.window_start()),
            ..Default::default()
        };
        let mut waiting = match self.shared.store.query_executions(&filter).await {
            Ok(waiting) => waiting,
            Err(e) => {
                warn!(error = %e, "Failed to load waiting executions");
                return 0;
            }
        };
        waiting.reverse();

        let mut promoted = 0;
        for execution in waiting {
            let id = execution.id;
            match self.promote_waiting(execution).await {
                Ok(true) => promoted += 1,
                Ok(false) => {}
                Err(e) => warn!(execution_id = %id, error = %e, "Failed to reconsider waiting execution"),
            }
        }
        promoted
    }

    async fn promote_waiting(&self, mut execution: JobExecution) -> Result<bool> {
        let shared = &self.shared;
        if shared.running.contains(execution.job_id) {
            return Ok(false);
        }
        let job = shared.store.get_job(execution.job_id).await?;
        if !job.active || !shared.resolver.check_dependencies(job.id).await? {
            return Ok(false);
        }

        info!(job = %job.name, execution_id = %execution.id, "Dependencies met, releasing waiting execution");
        // Counts as the dependency run of this window
        execution.trigger_type = TriggerType::Dependency;
        self.queue(&job, &mut execution).await?;
        self.dispatch(job, execution);
        Ok(true)
    }

    /// Time out `RUNNING` executions that nothing in this process drives any more.
    ///
    /// Such records are left behind by a restart or by a grid cancel that never
    /// resolved. One is stale once it is neither tracked by the engine nor holding its
    /// job's running slot, and its timeout plus `grace` has passed since it started.
    pub async fn reconcile_stale(&self, grace: Duration) -> usize {
        let shared = &self.shared;
        let filter = ExecutionFilter {
            status: Some(ExecutionStatus::Running),
            ..Default::default()
        };
        let running = match shared.store.query_executions(&filter).await {
            Ok(running) => running,
            Err(e) => {
                warn!(error = %e, "Failed to load running executions");
                return 0;
            }
        };

        let now = shared.clock.now();
        let mut reconciled = 0;
        for execution in running {
            if shared.engine.is_tracked(execution.id)
                || shared.running.execution_of(execution.job_id) == Some(execution.id)
            {
                continue;
            }
            let id = execution.id;
            match self.time_out_stale(execution, grace, now).await {
                Ok(true) => reconciled += 1,
                Ok(false) => {}
                Err(e) => warn!(execution_id = %id, error = %e, "Failed to reconcile stale execution"),
            }
        }
        reconciled
    }

    async fn time_out_stale(
        &self,
        mut execution: JobExecution,
        grace: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let shared = &self.shared;
        let job = shared.store.get_job(execution.job_id).await?;
        let limit = job.timeout(shared.engine.default_timeout()) + grace;
        let started = execution.started_at.unwrap_or(execution.created_at);
        let elapsed = (now - started).to_std().unwrap_or_default();
        if elapsed <= limit {
            return Ok(false);
        }

        warn!(
            job = %job.name,
            execution_id = %execution.id,
            started_at = %started,
            "Untracked execution exceeded its timeout, marking timed out"
        );
        if execution.grid_job_id.is_some() {
            match shared.engine.cancel_execution(execution.id).await {
                Ok(true) => {}
                Ok(false) => warn!(execution_id = %execution.id, "Grid did not confirm cancel of stale execution"),
                Err(e) => warn!(execution_id = %execution.id, error = %e, "Failed to cancel stale grid execution"),
            }
        }

        execution.transition(ExecutionStatus::Timeout)?;
        execution.error_message = Some(format!(
            "execution was not resolved within {}s of its timeout",
            grace.as_secs()
        ));
        execution.finish_at(now);
        self.persist(&execution).await;
        shared
            .metrics
            .record_finished(execution.status, execution.duration_ms);
        self.alert(&job, &mut execution).await;

        if let Some(done) = lock(&shared.completions).remove(&execution.id) {
            done.send_replace(Some(execution.status));
        }
        self.emit(ExecutionEvent::Finished {
            job: job.name.clone(),
            execution_id: execution.id,
            status: execution.status,
            duration_ms: execution.duration_ms,
        });
        Ok(true)
    }

    // Completion

    async fn complete(
        &self,
        job: JobDefinition,
        mut execution: JobExecution,
        result: ExecutionResult,
        guard: Option<RunningGuard>,
    ) -> ExecutionStatus {
        let shared = &self.shared;
        let status = result.final_status();
        let finished_at = result.finished_at.unwrap_or_else(|| shared.clock.now());
        apply_result(&mut execution, result);

        if let Err(e) = execution.transition(status) {
            error!(execution_id = %execution.id, error = %e, "Invalid completion transition");
            if execution.transition(ExecutionStatus::Failed).is_err() {
                execution.transition(ExecutionStatus::Cancelled).ok();
            }
        }
        let cancel_actor = lock(&shared.cancel_requests).remove(&execution.id);
        if execution.status == ExecutionStatus::Cancelled {
            let actor = cancel_actor.unwrap_or_else(|| SYSTEM_ACTOR.to_string());
            execution.cancelled_by = Some(actor);
            execution.cancelled_at = Some(shared.clock.now());
        }
        execution.finish_at(finished_at);
        self.persist(&execution).await;

        shared.admission.release(execution.id);
        drop(guard);
        shared
            .metrics
            .record_finished(execution.status, execution.duration_ms);

        match execution.status {
            ExecutionStatus::Success => info!(
                job = %job.name,
                execution_id = %execution.id,
                duration_ms = ?execution.duration_ms,
                "Execution succeeded"
            ),
            status => warn!(
                job = %job.name,
                execution_id = %execution.id,
                status = %status,
                error = execution.error_message.as_deref().unwrap_or(""),
                "Execution did not succeed"
            ),
        }

        self.alert(&job, &mut execution).await;

        match execution.status {
            ExecutionStatus::Success => self.trigger_dependents(&job).await,
            ExecutionStatus::Failed | ExecutionStatus::Timeout => {
                self.schedule_auto_retry(&job, &execution)
            }
            _ => {}
        }
        self.drain_backlog().await;

        if let Some(done) = lock(&shared.completions).remove(&execution.id) {
            done.send_replace(Some(execution.status));
        }
        self.emit(ExecutionEvent::Finished {
            job: job.name.clone(),
            execution_id: execution.id,
            status: execution.status,
            duration_ms: execution.duration_ms,
        });
        execution.status
    }

    async fn alert(&self, job: &JobDefinition, execution: &mut JobExecution) {
        let alert_type = match execution.status {
            ExecutionStatus::Success if job.alert_on_success => AlertType::Success,
            ExecutionStatus::Failed if job.alert_on_failure => AlertType::Failure,
            ExecutionStatus::Timeout if job.alert_on_failure => AlertType::Timeout,
            ExecutionStatus::Cancelled => AlertType::Cancelled,
            _ => return,
        };

        match self.shared.alerts.send_alert(job, execution, alert_type).await {
            Ok(()) => {
                execution.alerted = true;
                self.persist(execution).await;
            }
            Err(e) => {
                warn!(job = %job.name, execution_id = %execution.id, error = %e, "Failed to send alert")
            }
        }
    }

    async fn trigger_dependents(&self, upstream: &JobDefinition) {
        let dependents = match self.shared.store.find_dependents(upstream.id).await {
            Ok(dependents) => dependents,
            Err(e) => {
                warn!(job = %upstream.name, error = %e, "Failed to load dependents");
                return;
            }
        };

        for dependent in dependents {
            if let Err(e) = self.trigger_dependent(dependent, upstream).await {
                warn!(job_id = %dependent, upstream = %upstream.name, error = %e, "Failed to trigger dependent");
            }
        }
    }

    async fn trigger_dependent(&self, job_id: JobId, upstream: &JobDefinition) -> Result<()> {
        let shared = &self.shared;
        let job = shared.store.get_job(job_id).await?;
        if !job.active || shared.running.contains(job.id) {
            debug!(job = %job.name, "Dependent inactive or running, not triggering");
            return Ok(());
        }

        let since = shared.resolver.window_start();
        let recent = shared.store.find_recent_executions(job.id, since).await?;
        if recent
            .iter()
            .any(|e| e.trigger_type == TriggerType::Dependency)
        {
            debug!(job = %job.name, "Dependent already triggered in this window");
            return Ok(());
        }
        if !shared.resolver.check_dependencies(job.id).await? {
            return Ok(());
        }

        let waiting = recent
            .into_iter()
            .find(|e| e.status == ExecutionStatus::WaitingDependency);
        let overrides = waiting
            .as_ref()
            .map(|w| w.parameters.clone())
            .unwrap_or_default();

        let mut execution = JobExecution::new(
            &job,
            TriggerType::Dependency,
            format!("dependency:{}", upstream.name),
            job.merged_parameters(&overrides),
            shared.clock.now(),
        );
        self.queue(&job, &mut execution).await?;

        if let Some(mut waiting) = waiting {
            waiting.transition(ExecutionStatus::Cancelled)?;
            waiting.cancelled_by = Some(SYSTEM_ACTOR.to_string());
            waiting.cancelled_at = Some(shared.clock.now());
            waiting.warning_message = Some(format!("superseded by execution {}", execution.id));
            waiting.finish_at(shared.clock.now());
            self.persist(&waiting).await;
        }

        info!(
            job = %job.name,
            upstream = %upstream.name,
            execution_id = %execution.id,
            "Triggering dependent job"
        );
        self.dispatch(job, execution);
        Ok(())
    }

    fn schedule_auto_retry(&self, job: &JobDefinition, execution: &JobExecution) {
        if !job.active {
            return;
        }
        if execution.retry_count >= job.max_retries {
            info!(
                job = %job.name,
                execution_id = %execution.id,
                retry_count = execution.retry_count,
                "Retries exhausted"
            );
            return;
        }

        let delay = job.retry_interval();
        let original = execution.id;
        let this = self.clone();
        self.shared
            .retries
            .schedule(job.id, original, delay, async move {
                match this.retry(original, AUTO_RETRY_ACTOR).await {
                    Ok(outcome) => debug!(execution_id = %original, ?outcome, "Automatic retry submitted"),
                    Err(e) => warn!(execution_id = %original, error = %e, "Automatic retry failed"),
                }
            });

        info!(
            job = %job.name,
            execution_id = %execution.id,
            delay_secs = delay.as_secs(),
            next_retry = execution.retry_count + 1,
            "Retry scheduled"
        );
        self.emit(ExecutionEvent::RetryScheduled {
            job: job.name.clone(),
            execution_id: execution.id,
            delay_secs: delay.as_secs(),
        });
    }

    // Operator actions

    /// Cancel a queued or running execution.
    ///
    /// Returns `false` without side effects when the execution is not cancellable or the
    /// cancellation could not be confirmed.
    pub async fn cancel(&self, execution_id: ExecutionId, actor: &str) -> Result<bool> {
        let shared = &self.shared;
        let execution = shared.store.get_execution(execution_id).await?;
        if !execution.status.is_cancellable() {
            debug!(execution_id = %execution_id, status = %execution.status, "Execution not cancellable");
            return Ok(false);
        }

        lock(&shared.cancel_requests).insert(execution_id, actor.to_string());

        if self.take_from_backlog(execution_id) {
            let job = shared.store.get_job(execution.job_id).await?;
            info!(job = %job.name, execution_id = %execution_id, actor, "Cancelling held execution");
            let result = ExecutionResult {
                cancelled: true,
                error: Some("execution cancelled".to_string()),
                ..Default::default()
            };
            self.complete(job, execution, result, None).await;
            return Ok(true);
        }

        let done = lock(&shared.completions)
            .get(&execution_id)
            .map(|tx| tx.subscribe());

        let confirmed = match shared.engine.cancel_execution(execution_id).await {
            Ok(confirmed) => confirmed,
            Err(e) => {
                warn!(execution_id = %execution_id, error = %e, "Cancel request failed");
                false
            }
        };
        if !confirmed {
            lock(&shared.cancel_requests).remove(&execution_id);
            return Ok(false);
        }

        info!(execution_id = %execution_id, actor, "Execution cancelled");
        if let Some(mut done) = done {
            let timed_out =
                tokio::time::timeout(shared.cancel_wait, done.wait_for(|status| status.is_some()))
                    .await
                    .is_err();
            if timed_out {
                warn!(execution_id = %execution_id, "Cancelled execution still finishing");
            }
        }
        Ok(true)
    }

    /// Retry a failed or timed-out execution as a new execution.
    pub async fn retry(&self, execution_id: ExecutionId, actor: &str) -> Result<SubmitOutcome> {
        let shared = &self.shared;
        let original = shared.store.get_execution(execution_id).await?;
        if !original.status.is_retryable() {
            return Err(Error::InvalidState(format!(
                "execution {} is {} and cannot be retried",
                execution_id, original.status
            )));
        }

        let job = shared.store.get_job(original.job_id).await?;
        if !job.active {
            return Err(Error::Inactive(job.name));
        }
        if original.retry_count >= job.max_retries {
            return Err(Error::MaxRetryExceeded(format!(
                "{} has used {} of {} retries",
                job.name, original.retry_count, job.max_retries
            )));
        }

        let filter = ExecutionFilter {
            retry_of: Some(execution_id),
            limit: Some(1),
            ..Default::default()
        };
        if !shared.store.query_executions(&filter).await?.is_empty() {
            return Err(Error::InvalidState(format!(
                "execution {} has already been retried",
                execution_id
            )));
        }
        shared.retries.cancel(execution_id);

        let mut retry = JobExecution::retry_of(&original, actor, shared.clock.now());
        shared.store.save_execution(&retry).await?;
        info!(
            job = %job.name,
            execution_id = %retry.id,
            retry_of = %execution_id,
            retry_count = retry.retry_count,
            actor,
            "Retrying execution"
        );

        self.queue(&job, &mut retry).await?;
        Ok(self.dispatch(job, retry))
    }

    /// Deactivate a job, its schedules and its pending retries.
    pub async fn pause(&self, job_id: JobId) -> Result<()> {
        let shared = &self.shared;
        let mut job = shared.store.get_job(job_id).await?;
        job.active = false;
        job.updated_at = shared.clock.now();
        shared.store.save_job(&job).await?;

        let schedules = shared.store.set_schedules_active(job_id, false).await?;
        let retries = shared.retries.cancel_job(job_id);
        info!(job = %job.name, schedules, retries, "Job paused");
        Ok(())
    }

    /// Reactivate a job and its schedules, recomputing their next run times.
    pub async fn resume(&self, job_id: JobId) -> Result<()> {
        let shared = &self.shared;
        let mut job = shared.store.get_job(job_id).await?;
        let now = shared.clock.now();
        job.active = true;
        job.updated_at = now;
        shared.store.save_job(&job).await?;

        for schedule in shared.store.schedules_for_job(job_id).await? {
            let next = match &schedule.spec {
                ScheduleSpec::OneTime { at } => schedule.last_run_time.is_none().then_some(*at),
                spec => spec.next_after(now)?,
            };
            shared
                .store
                .update_schedule(schedule.id, next, None, next.is_some())
                .await?;
        }
        info!(job = %job.name, "Job resumed");
        Ok(())
    }

    pub async fn add_dependency(&self, job_id: JobId, depends_on: JobId) -> Result<()> {
        self.shared.resolver.add_dependency(job_id, depends_on).await
    }

    pub async fn remove_dependency(&self, job_id: JobId, depends_on: JobId) -> Result<bool> {
        self.shared.resolver.remove_dependency(job_id, depends_on).await
    }

    // Queries

    /// Executions currently holding a job in the running set.
    pub async fn running_jobs(&self) -> Result<Vec<RunningJob>> {
        let now = self.shared.clock.now();
        let mut running = Vec::new();
        for (job_id, execution_id) in self.shared.running.snapshot() {
            let execution = match self.shared.store.get_execution(execution_id).await {
                Ok(execution) => execution,
                Err(e) => {
                    debug!(execution_id = %execution_id, error = %e, "Running execution not found");
                    continue;
                }
            };
            running.push(RunningJob {
                execution_id,
                job_id,
                job_name: execution.job_name,
                status: execution.status,
                trigger_type: execution.trigger_type,
                triggered_by: execution.triggered_by,
                started_at: execution.started_at,
                running_seconds: execution
                    .started_at
                    .map(|started| (now - started).num_seconds().max(0))
                    .unwrap_or(0),
                host: execution.host,
            });
        }
        Ok(running)
    }

    pub async fn execution_history(&self, filter: &ExecutionFilter) -> Result<Vec<JobExecution>> {
        Ok(self.shared.store.query_executions(filter).await?)
    }

    /// Wait until a dispatched execution terminates and return its status.
    ///
    /// Executions that are not in flight return their stored status right away.
    pub async fn wait_for(&self, execution_id: ExecutionId) -> Result<ExecutionStatus> {
        let done = lock(&self.shared.completions)
            .get(&execution_id)
            .map(|tx| tx.subscribe());
        let finished = match done {
            Some(mut done) => done
                .wait_for(|status| status.is_some())
                .await
                .ok()
                .and_then(|status| *status),
            None => None,
        };
        match finished {
            Some(status) => Ok(status),
            None => Ok(self.shared.store.get_execution(execution_id).await?.status),
        }
    }

    pub fn is_running(&self, job_id: JobId) -> bool {
        self.shared.running.contains(job_id)
    }

    pub fn pending_retries(&self, job_id: JobId) -> usize {
        self.shared.retries.pending_for(job_id)
    }

    /// Nothing running, held, or waiting to be retried.
    pub fn is_idle(&self) -> bool {
        self.shared.running.is_empty()
            && self.backlog_len() == 0
            && self.shared.retries.pending() == 0
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.shared.events.subscribe()
    }

    /// Abort pending retries. In-flight executions are left to finish.
    pub fn shutdown(&self) {
        self.shared.retries.shutdown();
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("running", &self.shared.running.len())
            .field("backlog", &self.backlog_len())
            .field("pending_retries", &self.shared.retries.pending())
            .finish()
    }
}

fn apply_result(execution: &mut JobExecution, result: ExecutionResult) {
    if result.started_at.is_some() {
        execution.started_at = result.started_at;
    }
    if result.host.is_some() {
        execution.host = result.host;
    }
    if result.process_id.is_some() {
        execution.process_id = result.process_id;
    }
    if result.grid_job_id.is_some() {
        execution.grid_job_id = result.grid_job_id;
    }
    if !result.steps.is_empty() {
        execution.steps = result.steps;
    }
    execution.output = result.output;
    execution.error_message = result.error;
    execution.warning_message = result.warning;
    execution.exit_code = result.exit_code;
    execution.log_ref = result.log_ref;
    execution.output_parameters = result.output_parameters;
    execution.metrics.extend(result.metrics);
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cadence_config::{ExecutorSettings, OverflowPolicy};
    use cadence_core::clock::ManualClock;
    use cadence_core::executor::{ExecutionContext, JobExecutor, TaskOutput};
    use cadence_core::job::{JobType, ResourceRequirements};
    use cadence_executor::ExecutorRegistry;
    use cadence_store::MemoryJobStore;
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap()
    }

    /// Fails every run without touching the operating system.
    struct FailingExecutor {
        runs: AtomicU32,
    }

    #[async_trait]
    impl JobExecutor for FailingExecutor {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn execute(&self, _ctx: &ExecutionContext) -> Result<TaskOutput> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(TaskOutput {
                success: false,
                exit_code: Some(1),
                stderr: "boom".into(),
                ..Default::default()
            })
        }
    }

    /// Records every alert it is asked to send.
    #[derive(Default)]
    struct RecordingAlerts {
        sent: Mutex<Vec<(String, AlertType)>>,
    }

    #[async_trait]
    impl AlertSink for RecordingAlerts {
        async fn send_alert(
            &self,
            job: &JobDefinition,
            _execution: &JobExecution,
            alert_type: AlertType,
        ) -> Result<()> {
            lock(&self.sent).push((job.name.clone(), alert_type));
            Ok(())
        }
    }

    struct Harness {
        store: Arc<MemoryJobStore>,
        orchestrator: Orchestrator,
        alerts: Arc<RecordingAlerts>,
        failing: Arc<FailingExecutor>,
    }

    fn harness_with(
        settings: ExecutorSettings,
        admission: Option<Arc<dyn Admission>>,
        on_deny: OverflowPolicy,
    ) -> Harness {
        let store = Arc::new(MemoryJobStore::new());
        let failing = Arc::new(FailingExecutor {
            runs: AtomicU32::new(0),
        });
        let mut registry = ExecutorRegistry::with_defaults(Duration::from_millis(200));
        registry.register(JobType::Other("failing".into()), failing.clone());

        let engine = Arc::new(ExecutionEngine::new(store.clone(), registry, settings));
        let alerts = Arc::new(RecordingAlerts::default());
        let mut config = OrchestratorConfig::default();
        config.admission.on_deny = on_deny;
        config.cancel_wait = Duration::from_secs(5);

        let mut builder = Orchestrator::builder(store.clone(), engine)
            .config(&config)
            .clock(Arc::new(ManualClock::new(noon())))
            .alerts(alerts.clone());
        if let Some(admission) = admission {
            builder = builder.admission(admission);
        }

        Harness {
            store,
            orchestrator: builder.build(),
            alerts,
            failing,
        }
    }

    fn harness() -> Harness {
        harness_with(ExecutorSettings::default(), None, OverflowPolicy::Queue)
    }

    async fn add_job(store: &MemoryJobStore, job: JobDefinition) -> JobDefinition {
        store.save_job(&job).await.unwrap();
        job
    }

    /// Collect `Finished` events until `count` have arrived.
    async fn finished(
        events: &mut broadcast::Receiver<ExecutionEvent>,
        count: usize,
    ) -> Vec<(String, ExecutionStatus)> {
        let mut seen = Vec::new();
        tokio::time::timeout(Duration::from_secs(60), async {
            while seen.len() < count {
                if let Ok(ExecutionEvent::Finished { job, status, .. }) = events.recv().await {
                    seen.push((job, status));
                }
            }
        })
        .await
        .expect("executions did not finish in time");
        seen
    }

    #[tokio::test]
    async fn test_manual_run_templates_parameters() {
        let h = harness();
        let job = add_job(&h.store, JobDefinition::new("j1", JobType::Shell, "echo ${name}")).await;

        let outcome = h
            .orchestrator
            .submit(SubmitRequest::manual(job.id, "ops").with_parameter("name", "world"))
            .await
            .unwrap();
        let SubmitOutcome::Dispatched(id) = outcome else {
            panic!("expected dispatch, got {outcome:?}");
        };

        assert_eq!(h.orchestrator.wait_for(id).await.unwrap(), ExecutionStatus::Success);
        let execution = h.store.get_execution(id).await.unwrap();
        assert_eq!(execution.exit_code, Some(0));
        assert_eq!(execution.output.as_deref(), Some("world\n"));
        assert_eq!(execution.trigger_type, TriggerType::Manual);
        assert!(execution.process_id.is_some());
        assert!(execution.duration_ms.is_some());
        assert_eq!(execution.steps.len(), 3);
        assert!(!h.orchestrator.is_running(job.id));

        let metrics = h.orchestrator.metrics();
        assert_eq!(metrics.submitted, 1);
        assert_eq!(metrics.completed, 1);
    }

    #[tokio::test]
    async fn test_inactive_job_rejected() {
        let h = harness();
        let mut job = JobDefinition::new("off", JobType::Shell, "true");
        job.active = false;
        let job = add_job(&h.store, job).await;

        let err = h
            .orchestrator
            .submit(SubmitRequest::manual(job.id, "ops"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Inactive(_)));
    }

    #[tokio::test]
    async fn test_waiting_dependency_then_triggered() {
        let h = harness();
        let mut events = h.orchestrator.subscribe();
        let j2 = add_job(&h.store, JobDefinition::new("j2", JobType::Shell, "echo upstream")).await;
        let mut j3 = JobDefinition::new("j3", JobType::Shell, "echo ${day}");
        j3.dependencies.insert(j2.id);
        let j3 = add_job(&h.store, j3).await;

        let outcome = h
            .orchestrator
            .submit(SubmitRequest::manual(j3.id, "ops").with_parameter("day", "friday"))
            .await
            .unwrap();
        let SubmitOutcome::WaitingDependency(waiting_id) = outcome else {
            panic!("expected waiting, got {outcome:?}");
        };
        assert!(!h.orchestrator.is_running(j3.id));
        let waiting = h.store.get_execution(waiting_id).await.unwrap();
        assert_eq!(waiting.status, ExecutionStatus::WaitingDependency);

        // A second submission in the same window reuses the waiting execution
        let again = h
            .orchestrator
            .submit(SubmitRequest::manual(j3.id, "ops"))
            .await
            .unwrap();
        assert_eq!(again, SubmitOutcome::WaitingDependency(waiting_id));

        h.orchestrator
            .submit(SubmitRequest::manual(j2.id, "ops"))
            .await
            .unwrap();
        let seen = finished(&mut events, 2).await;
        assert!(seen.contains(&("j2".to_string(), ExecutionStatus::Success)));
        assert!(seen.contains(&("j3".to_string(), ExecutionStatus::Success)));

        let triggered = h
            .orchestrator
            .execution_history(&ExecutionFilter::for_job(j3.id).with_status(ExecutionStatus::Success))
            .await
            .unwrap();
        assert_eq!(triggered.len(), 1);
        assert_eq!(triggered[0].trigger_type, TriggerType::Dependency);
        assert_eq!(triggered[0].output.as_deref(), Some("friday\n"));

        let superseded = h.store.get_execution(waiting_id).await.unwrap();
        assert_eq!(superseded.status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_dependents_triggered_once_per_window() {
        let h = harness();
        let mut events = h.orchestrator.subscribe();
        let up = add_job(&h.store, JobDefinition::new("up", JobType::Shell, "true")).await;
        let mut down = JobDefinition::new("down", JobType::Shell, "true");
        down.dependencies.insert(up.id);
        let down = add_job(&h.store, down).await;

        h.orchestrator.submit(SubmitRequest::manual(up.id, "ops")).await.unwrap();
        finished(&mut events, 2).await;
        h.orchestrator.submit(SubmitRequest::manual(up.id, "ops")).await.unwrap();
        finished(&mut events, 1).await;

        let runs = h
            .orchestrator
            .execution_history(&ExecutionFilter::for_job(down.id))
            .await
            .unwrap();
        assert_eq!(runs.len(), 1);
    }

    #[tokio::test]
    async fn test_released_waiting_execution_counts_as_dependency_run() {
        let h = harness();
        let up = add_job(&h.store, JobDefinition::new("up", JobType::Shell, "true")).await;
        let mut down = JobDefinition::new("down", JobType::Shell, "true");
        down.dependencies.insert(up.id);
        let down = add_job(&h.store, down).await;

        let waiting_id = h
            .orchestrator
            .submit(SubmitRequest::manual(down.id, "ops"))
            .await
            .unwrap()
            .execution_id()
            .unwrap();

        // Upstream success recorded outside this orchestrator
        let mut upstream = JobExecution::new(&up, TriggerType::Manual, "ops", Parameters::new(), noon());
        upstream.transition(ExecutionStatus::Queued).unwrap();
        upstream.transition(ExecutionStatus::Running).unwrap();
        upstream.transition(ExecutionStatus::Success).unwrap();
        upstream.finish_at(noon());
        h.store.save_execution(&upstream).await.unwrap();

        assert_eq!(h.orchestrator.reconsider_waiting().await, 1);
        assert_eq!(
            h.orchestrator.wait_for(waiting_id).await.unwrap(),
            ExecutionStatus::Success
        );

        // A later upstream success in the same window does not start the dependent again
        let up_run = h
            .orchestrator
            .submit(SubmitRequest::manual(up.id, "ops"))
            .await
            .unwrap()
            .execution_id()
            .unwrap();
        assert_eq!(
            h.orchestrator.wait_for(up_run).await.unwrap(),
            ExecutionStatus::Success
        );

        let runs = h
            .orchestrator
            .execution_history(&ExecutionFilter::for_job(down.id))
            .await
            .unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, waiting_id);
        assert_eq!(runs[0].trigger_type, TriggerType::Dependency);
        assert_eq!(runs[0].triggered_by, "ops");
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_retry_until_exhausted() {
        let h = harness();
        let mut events = h.orchestrator.subscribe();
        let mut job = JobDefinition::new("j4", JobType::Other("failing".into()), "run");
        job.max_retries = 2;
        job.retry_interval_seconds = 5;
        job.alert_on_failure = true;
        let job = add_job(&h.store, job).await;

        let started = tokio::time::Instant::now();
        let first = h
            .orchestrator
            .submit(SubmitRequest::manual(job.id, "ops").with_parameter("batch", "42"))
            .await
            .unwrap()
            .execution_id()
            .unwrap();

        let seen = finished(&mut events, 3).await;
        assert!(seen.iter().all(|(_, status)| *status == ExecutionStatus::Failed));
        assert!(started.elapsed() >= Duration::from_secs(10));

        // No fourth attempt
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.failing.runs.load(Ordering::SeqCst), 3);
        assert_eq!(h.orchestrator.pending_retries(job.id), 0);

        let history = h
            .orchestrator
            .execution_history(&ExecutionFilter::for_job(job.id))
            .await
            .unwrap();
        assert_eq!(history.len(), 3);
        let mut counts: Vec<u32> = history.iter().map(|e| e.retry_count).collect();
        counts.sort();
        assert_eq!(counts, vec![0, 1, 2]);
        for execution in &history {
            assert_eq!(execution.parameters.get("batch").map(String::as_str), Some("42"));
        }

        let last = history.iter().find(|e| e.retry_count == 2).unwrap();
        let err = h.orchestrator.retry(last.id, "ops").await.unwrap_err();
        assert!(matches!(err, Error::MaxRetryExceeded(_)));
        assert!(err.is_invalid_state());
        let after = h
            .orchestrator
            .execution_history(&ExecutionFilter::for_job(job.id))
            .await
            .unwrap();
        assert_eq!(after.len(), 3);

        let err = h.orchestrator.retry(first, "ops").await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));

        assert_eq!(lock(&h.alerts.sent).len(), 3);
        assert_eq!(h.orchestrator.metrics().failed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_retry_carries_parameters() {
        let h = harness();
        let mut job = JobDefinition::new("manual-retry", JobType::Other("failing".into()), "run");
        job.max_retries = 0;
        let job = add_job(&h.store, job).await;

        let first = h
            .orchestrator
            .submit(SubmitRequest::manual(job.id, "ops").with_parameter("region", "eu"))
            .await
            .unwrap()
            .execution_id()
            .unwrap();
        assert_eq!(h.orchestrator.wait_for(first).await.unwrap(), ExecutionStatus::Failed);
        assert_eq!(h.orchestrator.pending_retries(job.id), 0);

        let err = h.orchestrator.retry(first, "ops").await.unwrap_err();
        assert!(matches!(err, Error::MaxRetryExceeded(_)));

        let mut job = h.store.get_job(job.id).await.unwrap();
        job.max_retries = 1;
        h.store.save_job(&job).await.unwrap();

        let retry = h
            .orchestrator
            .retry(first, "ops")
            .await
            .unwrap()
            .execution_id()
            .unwrap();
        h.orchestrator.wait_for(retry).await.unwrap();
        let retry = h.store.get_execution(retry).await.unwrap();
        assert_eq!(retry.retry_of, Some(first));
        assert_eq!(retry.retry_count, 1);
        assert_eq!(retry.trigger_type, TriggerType::Retry);
        assert_eq!(retry.parameters.get("region").map(String::as_str), Some("eu"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_cancels_pending_retry() {
        let h = harness();
        let mut job = JobDefinition::new("paused", JobType::Other("failing".into()), "run");
        job.max_retries = 3;
        job.retry_interval_seconds = 60;
        let job = add_job(&h.store, job).await;

        let first = h
            .orchestrator
            .submit(SubmitRequest::manual(job.id, "ops"))
            .await
            .unwrap()
            .execution_id()
            .unwrap();
        h.orchestrator.wait_for(first).await.unwrap();
        assert_eq!(h.orchestrator.pending_retries(job.id), 1);

        h.orchestrator.pause(job.id).await.unwrap();
        assert_eq!(h.orchestrator.pending_retries(job.id), 0);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.failing.runs.load(Ordering::SeqCst), 1);

        let err = h
            .orchestrator
            .submit(SubmitRequest::manual(job.id, "ops"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Inactive(_)));

        h.orchestrator.resume(job.id).await.unwrap();
        assert!(h.store.get_job(job.id).await.unwrap().active);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_one_running_execution_per_job() {
        let h = harness();
        let mut events = h.orchestrator.subscribe();
        let job = add_job(&h.store, JobDefinition::new("serial", JobType::Shell, "sleep 0.5")).await;
        let job_id = job.id;

        let monitor = {
            let store = h.store.clone();
            tokio::spawn(async move {
                let mut max_running = 0;
                for _ in 0..200 {
                    let running = store
                        .query_executions(&ExecutionFilter::for_job(job_id).with_status(ExecutionStatus::Running))
                        .await
                        .unwrap()
                        .len();
                    max_running = max_running.max(running);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                max_running
            })
        };

        let submits: Vec<_> = (0..4)
            .map(|_| {
                let orchestrator = h.orchestrator.clone();
                tokio::spawn(async move {
                    orchestrator
                        .submit(SubmitRequest::manual(job_id, "ops"))
                        .await
                        .unwrap()
                })
            })
            .collect();
        let mut outcomes = Vec::new();
        for submit in submits {
            outcomes.push(submit.await.unwrap());
        }
        let dispatched = outcomes
            .iter()
            .filter(|o| matches!(o, SubmitOutcome::Dispatched(_)))
            .count();
        let queued = outcomes
            .iter()
            .filter(|o| matches!(o, SubmitOutcome::Queued(_)))
            .count();
        assert_eq!(dispatched, 1);
        assert_eq!(queued, 3);

        // A scheduled run while the job is busy is a no-op
        let skipped = h
            .orchestrator
            .submit(SubmitRequest::scheduled(job.id, ScheduleId::new()))
            .await
            .unwrap();
        assert_eq!(skipped, SubmitOutcome::Skipped);

        let seen = finished(&mut events, 4).await;
        assert!(seen.iter().all(|(_, status)| *status == ExecutionStatus::Success));
        assert!(monitor.await.unwrap() <= 1);
        assert!(h.orchestrator.is_idle());
    }

    #[tokio::test]
    async fn test_cancel_running_execution() {
        let h = harness();
        let job = add_job(&h.store, JobDefinition::new("long", JobType::Shell, "sleep 30")).await;

        let id = h
            .orchestrator
            .submit(SubmitRequest::manual(job.id, "ops"))
            .await
            .unwrap()
            .execution_id()
            .unwrap();
        while h.store.get_execution(id).await.unwrap().status != ExecutionStatus::Running {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let running = h.orchestrator.running_jobs().await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].triggered_by, "ops");

        assert!(h.orchestrator.cancel(id, "alice").await.unwrap());
        let execution = h.store.get_execution(id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        assert_eq!(execution.cancelled_by.as_deref(), Some("alice"));
        assert!(execution.cancelled_at.is_some());
        assert!(!h.orchestrator.is_running(job.id));
        assert_eq!(lock(&h.alerts.sent)[0].1, AlertType::Cancelled);

        // Terminal executions cannot be cancelled again
        assert!(!h.orchestrator.cancel(id, "alice").await.unwrap());
        assert_eq!(h.orchestrator.metrics().cancelled, 1);
    }

    #[tokio::test]
    async fn test_cancel_held_execution() {
        let h = harness();
        let job = add_job(&h.store, JobDefinition::new("busy", JobType::Shell, "sleep 30")).await;

        let first = h
            .orchestrator
            .submit(SubmitRequest::manual(job.id, "ops"))
            .await
            .unwrap()
            .execution_id()
            .unwrap();
        let held = h
            .orchestrator
            .submit(SubmitRequest::manual(job.id, "ops"))
            .await
            .unwrap();
        let SubmitOutcome::Queued(held) = held else {
            panic!("expected held execution, got {held:?}");
        };

        assert!(h.orchestrator.cancel(held, "ops").await.unwrap());
        assert_eq!(
            h.store.get_execution(held).await.unwrap().status,
            ExecutionStatus::Cancelled
        );
        assert_eq!(h.orchestrator.backlog_len(), 0);

        assert!(h.orchestrator.cancel(first, "ops").await.unwrap());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timeout_terminates_process() {
        let h = harness_with(
            ExecutorSettings {
                default_timeout: Duration::from_millis(500),
                drain_grace: Duration::from_millis(200),
                ..Default::default()
            },
            None,
            OverflowPolicy::Queue,
        );
        let dir = std::env::temp_dir();
        let mut job = JobDefinition::new(
            "hang",
            JobType::Shell,
            format!(
                "sleep 30 & echo $! > {}/cadence-${{execution.id}}.pid; wait",
                dir.display()
            ),
        );
        job.max_retries = 0;
        let job = add_job(&h.store, job).await;

        let id = h
            .orchestrator
            .submit(SubmitRequest::manual(job.id, "ops"))
            .await
            .unwrap()
            .execution_id()
            .unwrap();
        assert_eq!(h.orchestrator.wait_for(id).await.unwrap(), ExecutionStatus::Timeout);

        let pid_file = dir.join(format!("cadence-{}.pid", id));
        let pid = std::fs::read_to_string(&pid_file).unwrap();
        std::fs::remove_file(&pid_file).ok();
        // Zombies awaiting reaping by init count as gone
        let stat = format!("/proc/{}/stat", pid.trim());
        let mut alive = true;
        for _ in 0..50 {
            alive = std::fs::read_to_string(&stat)
                .ok()
                .and_then(|s| s.rsplit_once(')').map(|(_, rest)| !rest.trim_start().starts_with('Z')))
                .unwrap_or(false);
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!alive, "background child {} survived the timeout", pid.trim());
        assert_eq!(h.orchestrator.metrics().timed_out, 1);
    }

    #[tokio::test]
    async fn test_admission_holds_until_release() {
        let mut capacity = BTreeMap::new();
        capacity.insert("cpu".to_string(), 2);
        let admission = Arc::new(CapacityAdmission::new(capacity));
        let h = harness_with(
            ExecutorSettings::default(),
            Some(admission.clone() as Arc<dyn Admission>),
            OverflowPolicy::Queue,
        );
        let mut events = h.orchestrator.subscribe();

        let mut heavy = JobDefinition::new("heavy", JobType::Shell, "sleep 0.2");
        heavy.resources = ResourceRequirements::new().with("cpu", 2);
        let heavy = add_job(&h.store, heavy).await;
        let mut other = JobDefinition::new("other", JobType::Shell, "true");
        other.resources = ResourceRequirements::new().with("cpu", 1);
        let other = add_job(&h.store, other).await;

        let first = h.orchestrator.submit(SubmitRequest::manual(heavy.id, "ops")).await.unwrap();
        assert!(matches!(first, SubmitOutcome::Dispatched(_)));
        let second = h.orchestrator.submit(SubmitRequest::manual(other.id, "ops")).await.unwrap();
        assert!(matches!(second, SubmitOutcome::Queued(_)));

        let seen = finished(&mut events, 2).await;
        assert!(seen.contains(&("heavy".to_string(), ExecutionStatus::Success)));
        assert!(seen.contains(&("other".to_string(), ExecutionStatus::Success)));
        assert_eq!(admission.in_use("cpu"), 0);
    }

    #[tokio::test]
    async fn test_admission_reject_policy_fails_execution() {
        let mut capacity = BTreeMap::new();
        capacity.insert("cpu".to_string(), 1);
        let admission: Arc<dyn Admission> = Arc::new(CapacityAdmission::new(capacity));
        let h = harness_with(ExecutorSettings::default(), Some(admission), OverflowPolicy::Reject);

        let mut job = JobDefinition::new("greedy", JobType::Shell, "true");
        job.resources = ResourceRequirements::new().with("cpu", 4);
        job.max_retries = 0;
        let job = add_job(&h.store, job).await;

        let outcome = h.orchestrator.submit(SubmitRequest::manual(job.id, "ops")).await.unwrap();
        let SubmitOutcome::Rejected(id) = outcome else {
            panic!("expected rejection, got {outcome:?}");
        };
        assert_eq!(h.orchestrator.wait_for(id).await.unwrap(), ExecutionStatus::Failed);
    }
}
