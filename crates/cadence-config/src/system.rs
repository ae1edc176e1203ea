//! System configuration parsing.
//!
//! ```kdl
//! scheduler poll-interval=30 batch-size=100 stale-grace=300
//! executor pool-size=10 overflow="queue" default-timeout=120 drain-grace=5
//! grid enabled=#true poll-interval=10 breaker-threshold=5 breaker-cooldown=60 {
//!     heavy-types "java" "python"
//! }
//! dependencies window="trailing" hours=24
//! admission on-deny="queue" {
//!     capacity "cpu" 8
//! }
//! cancel-wait seconds=30
//! ```
//!
//! Durations are whole seconds except `default-timeout` (minutes) and `retry-backoff`
//! (milliseconds). Every setting has a default.

use cadence_core::clock::start_of_day;
use chrono::{DateTime, Utc};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::kdl_util::{
    get_all_string_args, get_bool_prop, get_first_string_arg, get_integer_arg, get_string_prop,
    get_u32_prop, get_u64_prop,
};
use crate::{ConfigError, ConfigResult};

/// What to do with work that cannot start right away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Hold the work until capacity frees up.
    #[default]
    Queue,
    /// Fail the work immediately.
    Reject,
}

impl std::str::FromStr for OverflowPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s {
            "queue" => Ok(OverflowPolicy::Queue),
            "reject" | "fail" => Ok(OverflowPolicy::Reject),
            other => Err(ConfigError::invalid(
                "overflow policy",
                format!("unknown policy: {}", other),
            )),
        }
    }
}

/// Window in which a dependency's SUCCESS counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionWindow {
    /// Since midnight UTC of the current day.
    #[default]
    StartOfDay,
    /// The trailing period ending now.
    Trailing(Duration),
}

impl ResolutionWindow {
    /// Start of the window that contains `now`.
    pub fn since(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            ResolutionWindow::StartOfDay => start_of_day(now),
            ResolutionWindow::Trailing(period) => match chrono::Duration::from_std(*period) {
                Ok(period) => now - period,
                Err(_) => DateTime::<Utc>::MIN_UTC,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    pub poll_interval: Duration,
    /// Maximum due schedules handled per tick.
    pub batch_size: usize,
    /// How long past its timeout an untracked `RUNNING` execution may stay unresolved.
    pub stale_grace: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            batch_size: 100,
            stale_grace: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSettings {
    /// Concurrent local executions.
    pub pool_size: usize,
    pub overflow: OverflowPolicy,
    /// Used when a job declares no timeout.
    pub default_timeout: Duration,
    /// How long to keep draining output after the process is gone.
    pub drain_grace: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            pool_size: 10,
            overflow: OverflowPolicy::Queue,
            default_timeout: Duration::from_secs(120 * 60),
            drain_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridSettings {
    pub enabled: bool,
    /// Job types always sent to the grid.
    pub heavy_types: Vec<String>,
    pub poll_interval: Duration,
    /// Consecutive failures before the breaker opens.
    pub breaker_threshold: u32,
    pub breaker_cooldown: Duration,
    /// Attempts per grid call, including the first.
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
}

impl Default for GridSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            heavy_types: vec!["java".to_string(), "python".to_string()],
            poll_interval: Duration::from_secs(10),
            breaker_threshold: 5,
            breaker_cooldown: Duration::from_secs(60),
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

impl GridSettings {
    pub fn is_heavy(&self, job_type: &str) -> bool {
        self.heavy_types.iter().any(|t| t.eq_ignore_ascii_case(job_type))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependencySettings {
    pub window: ResolutionWindow,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdmissionSettings {
    /// Applied when admission denies a job.
    pub on_deny: OverflowPolicy,
    /// Capacity per resource pool. Empty means everything is admitted.
    pub capacity: BTreeMap<String, u32>,
}

/// System-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub scheduler: SchedulerSettings,
    pub executor: ExecutorSettings,
    pub grid: GridSettings,
    pub dependencies: DependencySettings,
    pub admission: AdmissionSettings,
    /// How long `cancel` waits for a cancelled execution to finish its cleanup.
    pub cancel_wait: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerSettings::default(),
            executor: ExecutorSettings::default(),
            grid: GridSettings::default(),
            dependencies: DependencySettings::default(),
            admission: AdmissionSettings::default(),
            cancel_wait: Duration::from_secs(30),
        }
    }
}

impl OrchestratorConfig {
    /// Load from a file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        match std::fs::read_to_string(path.as_ref()) {
            Ok(text) => parse_system_config(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Parse system configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<OrchestratorConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = OrchestratorConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "scheduler" => parse_scheduler(node, &mut config.scheduler)?,
            "executor" => parse_executor(node, &mut config.executor)?,
            "grid" => parse_grid(node, &mut config.grid)?,
            "dependencies" => parse_dependencies(node, &mut config.dependencies)?,
            "admission" => parse_admission(node, &mut config.admission)?,
            "cancel-wait" => {
                if let Some(secs) = get_u64_prop(node, "seconds")? {
                    config.cancel_wait = Duration::from_secs(secs);
                }
            }
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(config)
}

fn positive(field: &str, value: u64) -> ConfigResult<u64> {
    if value == 0 {
        return Err(ConfigError::invalid(field, "must be positive"));
    }
    Ok(value)
}

fn parse_scheduler(node: &KdlNode, settings: &mut SchedulerSettings) -> ConfigResult<()> {
    if let Some(secs) = get_u64_prop(node, "poll-interval")? {
        settings.poll_interval = Duration::from_secs(positive("poll-interval", secs)?);
    }
    if let Some(size) = get_u64_prop(node, "batch-size")? {
        settings.batch_size = positive("batch-size", size)? as usize;
    }
    if let Some(secs) = get_u64_prop(node, "stale-grace")? {
        settings.stale_grace = Duration::from_secs(secs);
    }
    Ok(())
}

fn parse_executor(node: &KdlNode, settings: &mut ExecutorSettings) -> ConfigResult<()> {
    if let Some(size) = get_u64_prop(node, "pool-size")? {
        settings.pool_size = positive("pool-size", size)? as usize;
    }
    if let Some(policy) = get_string_prop(node, "overflow") {
        settings.overflow = policy.parse()?;
    }
    if let Some(minutes) = get_u64_prop(node, "default-timeout")? {
        settings.default_timeout = Duration::from_secs(positive("default-timeout", minutes)? * 60);
    }
    if let Some(secs) = get_u64_prop(node, "drain-grace")? {
        settings.drain_grace = Duration::from_secs(secs);
    }
    Ok(())
}

fn parse_grid(node: &KdlNode, settings: &mut GridSettings) -> ConfigResult<()> {
    if let Some(enabled) = get_bool_prop(node, "enabled") {
        settings.enabled = enabled;
    }
    if let Some(secs) = get_u64_prop(node, "poll-interval")? {
        settings.poll_interval = Duration::from_secs(positive("poll-interval", secs)?);
    }
    if let Some(threshold) = get_u32_prop(node, "breaker-threshold")? {
        settings.breaker_threshold = positive("breaker-threshold", u64::from(threshold))? as u32;
    }
    if let Some(secs) = get_u64_prop(node, "breaker-cooldown")? {
        settings.breaker_cooldown = Duration::from_secs(secs);
    }
    if let Some(attempts) = get_u32_prop(node, "retry-attempts")? {
        settings.retry_attempts = positive("retry-attempts", u64::from(attempts))? as u32;
    }
    if let Some(ms) = get_u64_prop(node, "retry-backoff")? {
        settings.retry_backoff = Duration::from_millis(ms);
    }
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == "heavy-types" {
                settings.heavy_types = get_all_string_args(child);
            }
        }
    }
    Ok(())
}

fn parse_dependencies(node: &KdlNode, settings: &mut DependencySettings) -> ConfigResult<()> {
    match get_string_prop(node, "window").as_deref() {
        None | Some("start-of-day") => settings.window = ResolutionWindow::StartOfDay,
        Some("trailing") => {
            let hours = get_u64_prop(node, "hours")?
                .ok_or_else(|| ConfigError::MissingField("dependencies hours".to_string()))?;
            settings.window =
                ResolutionWindow::Trailing(Duration::from_secs(positive("hours", hours)? * 3600));
        }
        Some(other) => {
            return Err(ConfigError::invalid(
                "dependencies window",
                format!("unknown window: {}", other),
            ));
        }
    }
    Ok(())
}

fn parse_admission(node: &KdlNode, settings: &mut AdmissionSettings) -> ConfigResult<()> {
    if let Some(policy) = get_string_prop(node, "on-deny") {
        settings.on_deny = policy.parse()?;
    }
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() != "capacity" {
                continue;
            }
            let pool = get_first_string_arg(child)
                .ok_or_else(|| ConfigError::MissingField("capacity pool name".to_string()))?;
            let amount = get_integer_arg(child, 1)
                .ok_or_else(|| ConfigError::MissingField(format!("capacity for '{}'", pool)))?;
            let amount = u32::try_from(amount).map_err(|_| {
                ConfigError::invalid(format!("capacity {}", pool), format!("out of range: {}", amount))
            })?;
            if settings.capacity.insert(pool.clone(), amount).is_some() {
                return Err(ConfigError::Duplicate(format!("capacity '{}'", pool)));
            }
        }
    }
    Ok(())
}
