//! Job schedules and next-run computation.
//!
//! Cron expressions are evaluated by the `cron` crate in UTC. Both the classic five-field
//! form (`min hour dom month dow`) and the six/seven-field form with seconds are accepted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::{Error, JobId, Result, ScheduleId};

/// Recurring or one-time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Recurring,
    OneTime,
}

/// When a schedule fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ScheduleSpec {
    Cron { expression: String },
    Interval { seconds: u64 },
    OneTime { at: DateTime<Utc> },
}

impl ScheduleSpec {
    pub fn kind(&self) -> ScheduleKind {
        match self {
            ScheduleSpec::OneTime { .. } => ScheduleKind::OneTime,
            _ => ScheduleKind::Recurring,
        }
    }

    /// Check that the spec can produce run times.
    pub fn validate(&self) -> Result<()> {
        match self {
            ScheduleSpec::Cron { expression } => parse_cron(expression).map(|_| ()),
            ScheduleSpec::Interval { seconds: 0 } => Err(Error::InvalidInput(
                "schedule interval must be positive".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// The first fire time strictly after `after`, if any.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        match self {
            ScheduleSpec::Cron { expression } => Ok(parse_cron(expression)?.after(&after).next()),
            ScheduleSpec::Interval { seconds } => {
                if *seconds == 0 {
                    return Err(Error::InvalidInput(
                        "schedule interval must be positive".to_string(),
                    ));
                }
                let step = chrono::Duration::seconds(i64::try_from(*seconds).map_err(|_| {
                    Error::InvalidInput(format!("schedule interval too large: {}", seconds))
                })?);
                Ok(Some(after + step))
            }
            ScheduleSpec::OneTime { at } => Ok((*at > after).then_some(*at)),
        }
    }
}

impl std::fmt::Display for ScheduleSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScheduleSpec::Cron { expression } => write!(f, "cron({})", expression),
            ScheduleSpec::Interval { seconds } => write!(f, "every {}s", seconds),
            ScheduleSpec::OneTime { at } => write!(f, "once at {}", at.to_rfc3339()),
        }
    }
}

fn parse_cron(expression: &str) -> Result<cron::Schedule> {
    let normalized = if expression.split_whitespace().count() == 5 {
        format!("0 {}", expression.trim())
    } else {
        expression.trim().to_string()
    };
    cron::Schedule::from_str(&normalized).map_err(|e| {
        Error::InvalidInput(format!("invalid cron expression '{}': {}", expression, e))
    })
}

/// A schedule owned by a job definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSchedule {
    pub id: ScheduleId,
    pub job_id: JobId,
    pub spec: ScheduleSpec,
    pub next_run_time: Option<DateTime<Utc>>,
    pub last_run_time: Option<DateTime<Utc>>,
    pub active: bool,
}

impl JobSchedule {
    /// Create an active schedule whose first run is the first fire time after `now`.
    pub fn new(job_id: JobId, spec: ScheduleSpec, now: DateTime<Utc>) -> Result<Self> {
        spec.validate()?;
        let next_run_time = match &spec {
            ScheduleSpec::OneTime { at } => Some(*at),
            _ => spec.next_after(now)?,
        };
        Ok(Self {
            id: ScheduleId::new(),
            job_id,
            spec,
            next_run_time,
            last_run_time: None,
            active: true,
        })
    }

    pub fn kind(&self) -> ScheduleKind {
        self.spec.kind()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.active && self.next_run_time.is_some_and(|next| next <= now)
    }

    /// Next run after a fire at `fired_at`. One-time schedules never fire again.
    pub fn following_run(&self, fired_at: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        match self.spec.kind() {
            ScheduleKind::OneTime => Ok(None),
            ScheduleKind::Recurring => self.spec.next_after(fired_at),
        }
    }
}
