//! Execution counters and duration distribution.

use cadence_core::execution::ExecutionStatus;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Upper bounds of the duration buckets, in milliseconds.
pub const DURATION_BUCKETS_MS: [u64; 8] = [
    1_000, 5_000, 30_000, 60_000, 300_000, 900_000, 1_800_000, 3_600_000,
];

#[derive(Debug, Default)]
pub struct ExecutionMetrics {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    duration_sum_ms: AtomicU64,
    duration_count: AtomicU64,
    /// One counter per bucket plus the overflow bucket.
    buckets: [AtomicU64; DURATION_BUCKETS_MS.len() + 1],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub duration_sum_ms: u64,
    pub duration_count: u64,
    /// `(upper bound in ms, count)`; the last bound is `None` for the overflow bucket.
    pub duration_buckets: Vec<(Option<u64>, u64)>,
}

impl MetricsSnapshot {
    pub fn mean_duration_ms(&self) -> Option<u64> {
        (self.duration_count > 0).then(|| self.duration_sum_ms / self.duration_count)
    }
}

impl ExecutionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a terminal outcome and, when known, its duration.
    pub fn record_finished(&self, status: ExecutionStatus, duration_ms: Option<u64>) {
        let counter = match status {
            ExecutionStatus::Success => &self.completed,
            ExecutionStatus::Failed => &self.failed,
            ExecutionStatus::Timeout => &self.timed_out,
            ExecutionStatus::Cancelled => &self.cancelled,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if let Some(ms) = duration_ms {
            self.duration_sum_ms.fetch_add(ms, Ordering::Relaxed);
            self.duration_count.fetch_add(1, Ordering::Relaxed);
            let bucket = DURATION_BUCKETS_MS
                .iter()
                .position(|bound| ms <= *bound)
                .unwrap_or(DURATION_BUCKETS_MS.len());
            self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let duration_buckets = self
            .buckets
            .iter()
            .enumerate()
            .map(|(i, count)| {
                (
                    DURATION_BUCKETS_MS.get(i).copied(),
                    count.load(Ordering::Relaxed),
                )
            })
            .collect();

        MetricsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            duration_sum_ms: self.duration_sum_ms.load(Ordering::Relaxed),
            duration_count: self.duration_count.load(Ordering::Relaxed),
            duration_buckets,
        }
    }
}
