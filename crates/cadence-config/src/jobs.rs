//! Job catalog parsing.
//!
//! ```kdl
//! job "extract" type="shell" priority=7 retries=2 retry-interval=5 timeout=10 {
//!     description "Pull the day's trades"
//!     command "extract --day ${date} --region ${region}"
//!     param "region" "emea"
//!     schedule cron="0 2 * * *"
//! }
//!
//! job "load" needs="extract" alert-on-success=#true {
//!     command "load --day ${date}"
//!     resources cpu=2 memory_mb=1024
//! }
//! ```

use cadence_core::JobId;
use cadence_core::job::{JobDefinition, JobType};
use cadence_core::schedule::ScheduleSpec;
use chrono::{DateTime, Utc};
use kdl::{KdlDocument, KdlNode};
use std::collections::HashMap;
use std::path::Path;

use crate::kdl_util::{
    get_arg_as_string, get_bool_prop, get_first_string_arg, get_i32_prop, get_string_list_prop,
    get_string_prop, get_u32_prop, get_u64_prop,
};
use crate::{ConfigError, ConfigResult};

/// A parsed job catalog. Dependency names are already resolved to job ids.
#[derive(Debug, Clone, Default)]
pub struct JobCatalog {
    /// Jobs in declaration order.
    pub jobs: Vec<JobDefinition>,
    pub schedules: Vec<(JobId, ScheduleSpec)>,
}

impl JobCatalog {
    pub fn job(&self, name: &str) -> Option<&JobDefinition> {
        self.jobs.iter().find(|j| j.name == name)
    }

    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path)?;
        parse_job_catalog(&text)
    }
}

struct ParsedJob {
    definition: JobDefinition,
    needs: Vec<String>,
    schedules: Vec<ScheduleSpec>,
}

/// Parse a job catalog from KDL text.
pub fn parse_job_catalog(kdl: &str) -> ConfigResult<JobCatalog> {
    let doc: KdlDocument = kdl.parse()?;

    let mut parsed = Vec::new();
    for node in doc.nodes() {
        if node.name().value() == "job" {
            parsed.push(parse_job(node)?);
        }
    }

    let mut ids: HashMap<String, JobId> = HashMap::new();
    for job in &parsed {
        if ids
            .insert(job.definition.name.clone(), job.definition.id)
            .is_some()
        {
            return Err(ConfigError::Duplicate(format!(
                "job '{}'",
                job.definition.name
            )));
        }
    }

    // Validate references
    for job in &parsed {
        for dep in &job.needs {
            if !ids.contains_key(dep) {
                return Err(ConfigError::InvalidReference(format!(
                    "job '{}' depends on unknown job '{}'",
                    job.definition.name, dep
                )));
            }
        }
    }

    if let Err(cycle) = detect_cycle(&parsed) {
        return Err(ConfigError::CycleDetected(cycle));
    }

    let mut catalog = JobCatalog::default();
    for job in parsed {
        let mut definition = job.definition;
        definition.dependencies = job.needs.iter().filter_map(|n| ids.get(n).copied()).collect();
        for spec in job.schedules {
            catalog.schedules.push((definition.id, spec));
        }
        catalog.jobs.push(definition);
    }
    Ok(catalog)
}

fn parse_job(node: &KdlNode) -> ConfigResult<ParsedJob> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("job name".to_string()))?;

    let job_type: JobType = get_string_prop(node, "type")
        .unwrap_or_else(|| "shell".to_string())
        .parse()
        .unwrap_or(JobType::Shell);

    let mut definition = JobDefinition::new(name.clone(), job_type, String::new());
    if let Some(priority) = get_i32_prop(node, "priority")? {
        definition.priority = priority;
    }
    if let Some(retries) = get_u32_prop(node, "retries")? {
        definition.max_retries = retries;
    }
    if let Some(interval) = get_u64_prop(node, "retry-interval")? {
        definition.retry_interval_seconds = interval;
    }
    if let Some(minutes) = get_u32_prop(node, "timeout")? {
        definition.timeout_minutes = Some(minutes);
    }
    if let Some(active) = get_bool_prop(node, "active") {
        definition.active = active;
    }
    if let Some(critical) = get_bool_prop(node, "critical") {
        definition.critical = critical;
    }
    if let Some(flag) = get_bool_prop(node, "alert-on-success") {
        definition.alert_on_success = flag;
    }
    if let Some(flag) = get_bool_prop(node, "alert-on-failure") {
        definition.alert_on_failure = flag;
    }

    let needs = get_string_list_prop(node, "needs");
    let mut schedules = Vec::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "command" => {
                    definition.command = get_first_string_arg(child).unwrap_or_default();
                }
                "description" => {
                    definition.description = get_first_string_arg(child);
                }
                "param" => {
                    let key = get_first_string_arg(child).ok_or_else(|| {
                        ConfigError::MissingField(format!("param name in job '{}'", name))
                    })?;
                    let value = get_arg_as_string(child, 1).ok_or_else(|| {
                        ConfigError::MissingField(format!("value of param '{}'", key))
                    })?;
                    definition.parameters.insert(key, value);
                }
                "resources" => {
                    for entry in child.entries() {
                        let Some(pool) = entry.name() else { continue };
                        let amount = entry
                            .value()
                            .as_integer()
                            .and_then(|v| u32::try_from(v).ok())
                            .ok_or_else(|| {
                                ConfigError::invalid(
                                    format!("resource {}", pool.value()),
                                    "expected a non-negative integer",
                                )
                            })?;
                        definition.resources.insert(pool.value(), amount);
                    }
                }
                "schedule" => schedules.push(parse_schedule(child, &name)?),
                _ => {}
            }
        }
    }

    if definition.command.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "command for job '{}'",
            name
        )));
    }

    Ok(ParsedJob {
        definition,
        needs,
        schedules,
    })
}

fn parse_schedule(node: &KdlNode, job: &str) -> ConfigResult<ScheduleSpec> {
    let spec = if let Some(expression) = get_string_prop(node, "cron") {
        ScheduleSpec::Cron { expression }
    } else if let Some(seconds) = get_u64_prop(node, "every")? {
        ScheduleSpec::Interval { seconds }
    } else if let Some(at) = get_string_prop(node, "at") {
        let at = DateTime::parse_from_rfc3339(&at)
            .map_err(|e| ConfigError::invalid(format!("schedule at in job '{}'", job), e.to_string()))?
            .with_timezone(&Utc);
        ScheduleSpec::OneTime { at }
    } else {
        return Err(ConfigError::MissingField(format!(
            "schedule cron, every or at in job '{}'",
            job
        )));
    };

    spec.validate().map_err(|e| ConfigError::invalid(format!("schedule in job '{}'", job), e.to_string()))?;
    Ok(spec)
}

/// Detect cycles in the job dependency graph using DFS.
fn detect_cycle(jobs: &[ParsedJob]) -> Result<(), String> {
    let mut visited = HashMap::new();
    let mut rec_stack = HashMap::new();

    let job_map: HashMap<&str, &ParsedJob> = jobs
        .iter()
        .map(|j| (j.definition.name.as_str(), j))
        .collect();

    for job in jobs {
        if !visited.contains_key(job.definition.name.as_str()) {
            if let Some(cycle) =
                dfs_detect_cycle(&job.definition.name, &job_map, &mut visited, &mut rec_stack)
            {
                return Err(cycle);
            }
        }
    }
    Ok(())
}

fn dfs_detect_cycle<'a>(
    node: &'a str,
    job_map: &'a HashMap<&'a str, &'a ParsedJob>,
    visited: &mut HashMap<&'a str, bool>,
    rec_stack: &mut HashMap<&'a str, bool>,
) -> Option<String> {
    visited.insert(node, true);
    rec_stack.insert(node, true);

    if let Some(job) = job_map.get(node) {
        for dep in &job.needs {
            let dep_str: &'a str = dep.as_str();
            if !visited.contains_key(dep_str) {
                if let Some(cycle) = dfs_detect_cycle(dep_str, job_map, visited, rec_stack) {
                    return Some(cycle);
                }
            } else if rec_stack.get(dep_str).copied().unwrap_or(false) {
                return Some(format!("{} -> {}", node, dep));
            }
        }
    }

    rec_stack.insert(node, false);
    None
}
