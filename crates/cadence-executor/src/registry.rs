//! Executor registry keyed by job type.

use cadence_core::executor::JobExecutor;
use cadence_core::job::JobType;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::shell::ShellExecutor;

#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<JobType, Arc<dyn JobExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shell jobs through `sh -c`, python jobs through `python3`.
    pub fn with_defaults(drain_grace: Duration) -> Self {
        let mut registry = Self::new();
        registry.register(
            JobType::Shell,
            Arc::new(ShellExecutor::new().with_drain_grace(drain_grace)),
        );
        registry.register(
            JobType::Python,
            Arc::new(ShellExecutor::with_interpreter("python3").with_drain_grace(drain_grace)),
        );
        registry
    }

    /// Register an executor, replacing any previous one for the type.
    pub fn register(&mut self, job_type: JobType, executor: Arc<dyn JobExecutor>) {
        self.executors.insert(job_type, executor);
    }

    pub fn get(&self, job_type: &JobType) -> Option<Arc<dyn JobExecutor>> {
        self.executors.get(job_type).cloned()
    }

    pub fn supports(&self, job_type: &JobType) -> bool {
        self.executors.contains_key(job_type)
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<String> = self.executors.keys().map(|t| t.to_string()).collect();
        types.sort();
        f.debug_struct("ExecutorRegistry")
            .field("job_types", &types)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_shell_and_python() {
        let registry = ExecutorRegistry::with_defaults(Duration::from_secs(1));
        assert_eq!(registry.get(&JobType::Shell).unwrap().name(), "shell");
        assert_eq!(registry.get(&JobType::Python).unwrap().name(), "interpreter");
        assert!(!registry.supports(&JobType::Java));
    }

    #[test]
    fn test_register_custom_type() {
        let mut registry = ExecutorRegistry::new();
        let etl = JobType::Other("etl".into());
        registry.register(etl.clone(), Arc::new(ShellExecutor::new()));
        assert!(registry.supports(&etl));
    }
}
