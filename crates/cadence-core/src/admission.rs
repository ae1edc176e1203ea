//! Admission control for resource-declaring jobs.
//!
//! Before dispatch the orchestrator reserves a job's declared resources. A denied job is
//! either held back or failed, depending on configuration.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::job::ResourceRequirements;
use crate::{ExecutionId, Result};

pub trait Admission: Send + Sync {
    /// Try to reserve `resources` for `execution`. All-or-nothing.
    fn reserve(&self, execution: ExecutionId, resources: &ResourceRequirements) -> Result<bool>;

    /// Release whatever `execution` holds. Unknown executions are ignored.
    fn release(&self, execution: ExecutionId);
}

/// Admits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAdmit;

impl Admission for AlwaysAdmit {
    fn reserve(&self, _execution: ExecutionId, _resources: &ResourceRequirements) -> Result<bool> {
        Ok(true)
    }

    fn release(&self, _execution: ExecutionId) {}
}

#[derive(Debug, Default)]
struct Ledger {
    in_use: BTreeMap<String, u32>,
    held: BTreeMap<ExecutionId, BTreeMap<String, u32>>,
}

/// Fixed per-pool capacities. Pools without a configured capacity are unlimited.
#[derive(Debug, Default)]
pub struct CapacityAdmission {
    capacity: BTreeMap<String, u32>,
    ledger: Mutex<Ledger>,
}

impl CapacityAdmission {
    pub fn new(capacity: BTreeMap<String, u32>) -> Self {
        Self {
            capacity,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    /// Amount currently reserved from `pool`.
    pub fn in_use(&self, pool: &str) -> u32 {
        let ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
        ledger.in_use.get(pool).copied().unwrap_or(0)
    }
}

impl Admission for CapacityAdmission {
    fn reserve(&self, execution: ExecutionId, resources: &ResourceRequirements) -> Result<bool> {
        if resources.is_empty() {
            return Ok(true);
        }
        let mut ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
        if ledger.held.contains_key(&execution) {
            return Ok(true);
        }

        for (pool, amount) in resources.iter() {
            if let Some(capacity) = self.capacity.get(pool) {
                let used = ledger.in_use.get(pool).copied().unwrap_or(0);
                if used.saturating_add(amount) > *capacity {
                    return Ok(false);
                }
            }
        }

        let mut held = BTreeMap::new();
        for (pool, amount) in resources.iter() {
            *ledger.in_use.entry(pool.to_string()).or_insert(0) += amount;
            held.insert(pool.to_string(), amount);
        }
        ledger.held.insert(execution, held);
        Ok(true)
    }

    fn release(&self, execution: ExecutionId) {
        let mut ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(held) = ledger.held.remove(&execution) {
            for (pool, amount) in held {
                if let Some(used) = ledger.in_use.get_mut(&pool) {
                    *used = used.saturating_sub(amount);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admission() -> CapacityAdmission {
        let mut capacity = BTreeMap::new();
        capacity.insert("cpu".to_string(), 4);
        CapacityAdmission::new(capacity)
    }

    #[test]
    fn test_reserve_until_full() {
        let admission = admission();
        let need = ResourceRequirements::new().with("cpu", 3);
        let first = ExecutionId::new();
        assert!(admission.reserve(first, &need).unwrap());
        assert!(!admission.reserve(ExecutionId::new(), &need).unwrap());

        admission.release(first);
        assert_eq!(admission.in_use("cpu"), 0);
        assert!(admission.reserve(ExecutionId::new(), &need).unwrap());
    }

    #[test]
    fn test_all_or_nothing() {
        let admission = admission();
        let need = ResourceRequirements::new().with("cpu", 5).with("gpu", 1);
        assert!(!admission.reserve(ExecutionId::new(), &need).unwrap());
        assert_eq!(admission.in_use("gpu"), 0);
    }

    #[test]
    fn test_unconfigured_pools_and_empty_requests_admitted() {
        let admission = admission();
        assert!(
            admission
                .reserve(ExecutionId::new(), &ResourceRequirements::new())
                .unwrap()
        );
        let need = ResourceRequirements::new().with("licenses", 100);
        assert!(admission.reserve(ExecutionId::new(), &need).unwrap());
    }

    #[test]
    fn test_reserve_is_idempotent_per_execution() {
        let admission = admission();
        let need = ResourceRequirements::new().with("cpu", 2);
        let id = ExecutionId::new();
        assert!(admission.reserve(id, &need).unwrap());
        assert!(admission.reserve(id, &need).unwrap());
        assert_eq!(admission.in_use("cpu"), 2);
    }
}
