//! Dependency resolution between jobs.
//!
//! A job may run once every job it depends on has at least one `SUCCESS` execution inside
//! the resolution window. Edges are stored on the dependent job and checked for cycles
//! before they are persisted.

use cadence_config::ResolutionWindow;
use cadence_core::clock::Clock;
use cadence_core::execution::ExecutionStatus;
use cadence_core::job::JobDefinition;
use cadence_core::{Error, JobId, Result};
use cadence_store::JobStore;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Adjacency structure: each job maps to the jobs it depends on.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    edges: BTreeMap<JobId, BTreeSet<JobId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_jobs<'a>(jobs: impl IntoIterator<Item = &'a JobDefinition>) -> Self {
        let mut graph = Self::new();
        for job in jobs {
            graph.add_node(job.id);
            for dep in &job.dependencies {
                graph.add_edge(job.id, *dep);
            }
        }
        graph
    }

    pub fn add_node(&mut self, job: JobId) {
        self.edges.entry(job).or_default();
    }

    pub fn add_edge(&mut self, job: JobId, depends_on: JobId) {
        self.add_node(depends_on);
        self.edges.entry(job).or_default().insert(depends_on);
    }

    pub fn remove_edge(&mut self, job: JobId, depends_on: JobId) -> bool {
        self.edges
            .get_mut(&job)
            .is_some_and(|deps| deps.remove(&depends_on))
    }

    pub fn contains(&self, job: JobId) -> bool {
        self.edges.contains_key(&job)
    }

    pub fn dependencies_of(&self, job: JobId) -> impl Iterator<Item = JobId> + '_ {
        self.edges.get(&job).into_iter().flatten().copied()
    }

    /// Whether adding `job -> depends_on` would close a cycle. Self-edges are cycles.
    pub fn would_create_cycle(&self, job: JobId, depends_on: JobId) -> bool {
        if job == depends_on {
            return true;
        }
        // The new edge closes a cycle iff `job` is already reachable from `depends_on`.
        let mut stack = vec![depends_on];
        let mut seen = BTreeSet::new();
        while let Some(current) = stack.pop() {
            if current == job {
                return true;
            }
            if seen.insert(current) {
                stack.extend(self.dependencies_of(current));
            }
        }
        false
    }

    /// Find a cycle using DFS with in-progress marking.
    pub fn find_cycle(&self) -> Option<Vec<JobId>> {
        let mut visited = BTreeSet::new();
        let mut in_progress = Vec::new();
        for &job in self.edges.keys() {
            if !visited.contains(&job) {
                if let Some(cycle) = self.visit_for_cycle(job, &mut visited, &mut in_progress) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn visit_for_cycle(
        &self,
        job: JobId,
        visited: &mut BTreeSet<JobId>,
        in_progress: &mut Vec<JobId>,
    ) -> Option<Vec<JobId>> {
        visited.insert(job);
        in_progress.push(job);

        for dep in self.dependencies_of(job) {
            if let Some(pos) = in_progress.iter().position(|j| *j == dep) {
                let mut cycle = in_progress[pos..].to_vec();
                cycle.push(dep);
                return Some(cycle);
            }
            if !visited.contains(&dep) {
                if let Some(cycle) = self.visit_for_cycle(dep, visited, in_progress) {
                    return Some(cycle);
                }
            }
        }

        in_progress.pop();
        None
    }

    /// Jobs ordered so that every job comes after everything it depends on.
    pub fn topological_order(&self) -> Result<Vec<JobId>> {
        if let Some(cycle) = self.find_cycle() {
            let path: Vec<String> = cycle.iter().map(|id| id.to_string()).collect();
            return Err(Error::CircularDependency(path.join(" -> ")));
        }

        let mut order = Vec::with_capacity(self.edges.len());
        let mut visited = BTreeSet::new();
        for &job in self.edges.keys() {
            self.topo_visit(job, &mut visited, &mut order);
        }
        Ok(order)
    }

    fn topo_visit(&self, job: JobId, visited: &mut BTreeSet<JobId>, order: &mut Vec<JobId>) {
        if !visited.insert(job) {
            return;
        }
        for dep in self.dependencies_of(job) {
            self.topo_visit(dep, visited, order);
        }
        order.push(job);
    }
}

/// Checks dependency satisfaction and maintains dependency edges.
pub struct DependencyResolver {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    window: ResolutionWindow,
}

impl DependencyResolver {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>, window: ResolutionWindow) -> Self {
        Self {
            store,
            clock,
            window,
        }
    }

    /// Start of the current resolution window.
    pub fn window_start(&self) -> DateTime<Utc> {
        self.window.since(self.clock.now())
    }

    /// Whether every dependency of `job_id` succeeded within the window.
    pub async fn check_dependencies(&self, job_id: JobId) -> Result<bool> {
        Ok(self.unmet_dependencies(job_id).await?.is_empty())
    }

    /// Dependencies of `job_id` without a `SUCCESS` execution in the window.
    pub async fn unmet_dependencies(&self, job_id: JobId) -> Result<Vec<JobId>> {
        let dependencies = self.store.find_dependencies(job_id).await?;
        if dependencies.is_empty() {
            return Ok(Vec::new());
        }

        let since = self.window_start();
        let mut unmet = Vec::new();
        for dep in dependencies {
            if !self.succeeded_since(dep, since).await? {
                unmet.push(dep);
            }
        }
        if !unmet.is_empty() {
            debug!(job_id = %job_id, unmet = unmet.len(), since = %since, "Dependencies not met");
        }
        Ok(unmet)
    }

    async fn succeeded_since(&self, job_id: JobId, since: DateTime<Utc>) -> Result<bool> {
        let executions = self.store.find_recent_executions(job_id, since).await?;
        Ok(executions
            .iter()
            .any(|e| e.status == ExecutionStatus::Success))
    }

    /// Add the edge `job_id -> depends_on`, rejecting it if it would close a cycle.
    pub async fn add_dependency(&self, job_id: JobId, depends_on: JobId) -> Result<()> {
        let job = self.store.get_job(job_id).await?;
        let dependency = self.store.get_job(depends_on).await?;

        let graph = DependencyGraph::from_jobs(&self.store.list_jobs().await?);
        if graph.would_create_cycle(job_id, depends_on) {
            return Err(Error::CircularDependency(format!(
                "{} -> {} would create a cycle",
                job.name, dependency.name
            )));
        }

        self.store.add_dependency(job_id, depends_on).await?;
        info!(job = %job.name, depends_on = %dependency.name, "Dependency added");
        Ok(())
    }

    /// Remove the edge `job_id -> depends_on`. Returns whether it existed.
    pub async fn remove_dependency(&self, job_id: JobId, depends_on: JobId) -> Result<bool> {
        self.store.get_job(depends_on).await?;
        let removed = self.store.remove_dependency(job_id, depends_on).await?;
        if removed {
            info!(job_id = %job_id, depends_on = %depends_on, "Dependency removed");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::clock::ManualClock;
    use cadence_core::execution::{JobExecution, Parameters, TriggerType};
    use cadence_core::job::JobType;
    use cadence_store::MemoryJobStore;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap()
    }

    fn job(name: &str) -> JobDefinition {
        JobDefinition::new(name, JobType::Shell, "true")
    }

    async fn record(
        store: &MemoryJobStore,
        job: &JobDefinition,
        status: ExecutionStatus,
        at: DateTime<Utc>,
    ) {
        let mut execution = JobExecution::new(job, TriggerType::Manual, "test", Parameters::new(), at);
        execution.status = status;
        store.save_execution(&execution).await.unwrap();
    }

    fn resolver(store: Arc<MemoryJobStore>) -> DependencyResolver {
        DependencyResolver::new(
            store,
            Arc::new(ManualClock::new(noon())),
            ResolutionWindow::StartOfDay,
        )
    }

    #[test]
    fn test_topological_order() {
        let extract = job("extract");
        let mut transform = job("transform");
        transform.dependencies.insert(extract.id);
        let mut load = job("load");
        load.dependencies.insert(transform.id);

        let graph = DependencyGraph::from_jobs([&load, &extract, &transform]);
        let order = graph.topological_order().unwrap();
        let pos = |id: JobId| order.iter().position(|j| *j == id).unwrap();

        assert_eq!(order.len(), 3);
        assert!(pos(extract.id) < pos(transform.id));
        assert!(pos(transform.id) < pos(load.id));
    }

    #[test]
    fn test_cycle_detection() {
        let (a, b, c) = (JobId::new(), JobId::new(), JobId::new());
        let mut graph = DependencyGraph::new();
        graph.add_edge(a, b);
        graph.add_edge(b, c);

        assert!(graph.would_create_cycle(c, a));
        assert!(graph.would_create_cycle(a, a));
        assert!(!graph.would_create_cycle(a, c));

        graph.add_edge(c, a);
        let cycle = graph.find_cycle().unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert!(matches!(
            graph.topological_order(),
            Err(Error::CircularDependency(_))
        ));
    }

    #[tokio::test]
    async fn test_no_dependencies_is_satisfied() {
        let store = Arc::new(MemoryJobStore::new());
        let lonely = job("lonely");
        store.save_job(&lonely).await.unwrap();
        assert!(resolver(store).check_dependencies(lonely.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_requires_success_in_window() {
        let store = Arc::new(MemoryJobStore::new());
        let upstream = job("upstream");
        let mut downstream = job("downstream");
        downstream.dependencies.insert(upstream.id);
        store.save_job(&upstream).await.unwrap();
        store.save_job(&downstream).await.unwrap();
        let resolver = resolver(store.clone());

        // Yesterday's success does not count
        record(&store, &upstream, ExecutionStatus::Success, noon() - chrono::Duration::days(1)).await;
        record(&store, &upstream, ExecutionStatus::Failed, noon()).await;
        assert!(!resolver.check_dependencies(downstream.id).await.unwrap());

        record(&store, &upstream, ExecutionStatus::Success, noon()).await;
        assert!(resolver.check_dependencies(downstream.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_add_dependency_rejects_cycles() {
        let store = Arc::new(MemoryJobStore::new());
        let a = job("a");
        let b = job("b");
        store.save_job(&a).await.unwrap();
        store.save_job(&b).await.unwrap();
        let resolver = resolver(store.clone());

        resolver.add_dependency(b.id, a.id).await.unwrap();
        let err = resolver.add_dependency(a.id, b.id).await.unwrap_err();
        assert!(matches!(err, Error::CircularDependency(_)));
        assert!(err.is_invalid_state());

        let err = resolver.add_dependency(a.id, a.id).await.unwrap_err();
        assert!(matches!(err, Error::CircularDependency(_)));

        let err = resolver.add_dependency(a.id, JobId::new()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        assert!(resolver.remove_dependency(b.id, a.id).await.unwrap());
        assert!(!resolver.remove_dependency(b.id, a.id).await.unwrap());
        resolver.add_dependency(a.id, b.id).await.unwrap();
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// A job is satisfied iff each of its dependencies succeeded today.
        #[test]
        fn test_satisfied_iff_every_dependency_succeeded(
            edges in prop::collection::vec((0usize..6, 0usize..6), 0..12),
            outcomes in prop::collection::vec(0u8..3, 6),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            runtime.block_on(async {
                let store = Arc::new(MemoryJobStore::new());
                let mut jobs: Vec<JobDefinition> = (0..6).map(|i| job(&format!("job-{i}"))).collect();
                // Only edges from higher to lower index, so the graph stays acyclic
                for (a, b) in &edges {
                    if a > b {
                        let dep = jobs[*b].id;
                        jobs[*a].dependencies.insert(dep);
                    }
                }
                for job in &jobs {
                    store.save_job(job).await.unwrap();
                }

                // 0: no execution, 1: failed today, 2: succeeded today
                for (job, outcome) in jobs.iter().zip(&outcomes) {
                    match outcome {
                        1 => record(&store, job, ExecutionStatus::Failed, noon()).await,
                        2 => record(&store, job, ExecutionStatus::Success, noon()).await,
                        _ => {}
                    }
                }

                let resolver = resolver(store.clone());
                for job in &jobs {
                    let expected = job.dependencies.iter().all(|dep| {
                        let idx = jobs.iter().position(|j| j.id == *dep).unwrap();
                        outcomes[idx] == 2
                    });
                    let actual = resolver.check_dependencies(job.id).await.unwrap();
                    assert_eq!(actual, expected, "job {}", job.name);
                }

                let graph = DependencyGraph::from_jobs(&jobs);
                let order = graph.topological_order().unwrap();
                for job in &jobs {
                    let pos = order.iter().position(|j| *j == job.id).unwrap();
                    for dep in &job.dependencies {
                        assert!(order.iter().position(|j| j == dep).unwrap() < pos);
                    }
                }
            });
        }
    }
}
