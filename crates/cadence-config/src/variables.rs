//! Command templating.
//!
//! `${name}` placeholders in a job command are replaced with values from the execution's
//! parameter map. When the map has no such key, these built-ins are consulted:
//! - `${job.name}` - Job name
//! - `${job.id}` - Job ID
//! - `${execution.id}` - Execution ID
//! - `${execution.retry_count}` - Retry count of the execution
//! - `${date}` - UTC date (YYYY-MM-DD)
//!
//! Substitution is a single pass: substituted values are never scanned again, and
//! unresolved placeholders are left untouched.

use cadence_core::execution::Parameters;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::LazyLock;

// Regex for matching ${...} variables
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_\-]*(?:\.[a-zA-Z_][a-zA-Z0-9_\-]*)*)\}").unwrap()
});

/// Variables available to a command template.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    pub parameters: Parameters,
    pub job_id: Option<String>,
    pub job_name: Option<String>,
    pub execution_id: Option<String>,
    pub retry_count: Option<u32>,
    pub date: Option<DateTime<Utc>>,
}

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        if let Some(value) = self.parameters.get(var_name) {
            return Some(value.clone());
        }

        match var_name {
            "job.id" => self.job_id.clone(),
            "job.name" => self.job_name.clone(),
            "execution.id" => self.execution_id.clone(),
            "execution.retry_count" => self.retry_count.map(|c| c.to_string()),
            "date" => self.date.map(|d| d.format("%Y-%m-%d").to_string()),
            _ => None,
        }
    }

    /// Interpolate all variables in a string.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    /// Names of placeholders in `input` that this context cannot resolve.
    pub fn unresolved(&self, input: &str) -> Vec<String> {
        VAR_REGEX
            .captures_iter(input)
            .map(|caps| caps[1].to_string())
            .filter(|name| self.resolve(name).is_none())
            .collect()
    }
}

/// Builder for creating VariableContext.
#[derive(Debug, Default)]
pub struct VariableContextBuilder {
    ctx: VariableContext,
}

impl VariableContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.ctx.parameters = parameters;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_job(mut self, id: impl ToString, name: impl Into<String>) -> Self {
        self.ctx.job_id = Some(id.to_string());
        self.ctx.job_name = Some(name.into());
        self
    }

    pub fn with_execution(mut self, id: impl ToString, retry_count: u32) -> Self {
        self.ctx.execution_id = Some(id.to_string());
        self.ctx.retry_count = Some(retry_count);
        self
    }

    pub fn with_date(mut self, now: DateTime<Utc>) -> Self {
        self.ctx.date = Some(now);
        self
    }

    pub fn build(self) -> VariableContext {
        self.ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_basic_interpolation() {
        let ctx = VariableContextBuilder::new()
            .with_parameter("name", "world")
            .build();

        assert_eq!(ctx.interpolate("echo ${name}"), "echo world");
    }

    #[test]
    fn test_unknown_variable_preserved() {
        let ctx = VariableContext::new();
        assert_eq!(ctx.interpolate("run ${missing} now"), "run ${missing} now");
        assert_eq!(ctx.unresolved("run ${missing} ${date}"), vec!["missing", "date"]);
    }

    #[test]
    fn test_substitution_is_single_pass() {
        let ctx = VariableContextBuilder::new()
            .with_parameter("a", "${b}")
            .with_parameter("b", "oops")
            .build();

        assert_eq!(ctx.interpolate("${a}"), "${b}");
    }

    #[test]
    fn test_builtins() {
        let ctx = VariableContextBuilder::new()
            .with_job("job-1", "ledger-close")
            .with_execution("exec-9", 2)
            .with_date(Utc.with_ymd_and_hms(2026, 3, 14, 23, 0, 0).unwrap())
            .build();

        let result =
            ctx.interpolate("${job.name}/${job.id}/${execution.id}/${execution.retry_count}/${date}");
        assert_eq!(result, "ledger-close/job-1/exec-9/2/2026-03-14");
    }

    #[test]
    fn test_parameters_shadow_builtins() {
        let ctx = VariableContextBuilder::new()
            .with_parameter("date", "2026-01-01")
            .with_date(Utc.with_ymd_and_hms(2026, 3, 14, 0, 0, 0).unwrap())
            .build();

        assert_eq!(ctx.interpolate("--day ${date}"), "--day 2026-01-01");
    }

    #[test]
    fn test_nested_braces() {
        let ctx = VariableContextBuilder::new()
            .with_parameter("sha", "abc123")
            .build();

        let result = ctx.interpolate(r#"{"sha": "${sha}"}"#);
        assert_eq!(result, r#"{"sha": "abc123"}"#);
    }

    #[test]
    fn test_dashed_parameter_names() {
        let ctx = VariableContextBuilder::new()
            .with_parameter("run-date", "2026-03-14")
            .build();

        assert_eq!(ctx.interpolate("--day=${run-date}"), "--day=2026-03-14");
    }
}
