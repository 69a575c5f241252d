//! Thread-safe pipeline counters
//!
//! Shared by every in-flight item; `snapshot` turns them into throughput.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::models::PipelineStep;

#[derive(Debug)]
pub struct ProcessingMetrics {
    attempted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    deduplicated: AtomicU64,
    bytes_ingested: AtomicU64,
    /// Sum of per-item processing time, in microseconds.
    busy_micros: AtomicU64,
    failures_by_step: DashMap<PipelineStep, u64>,
    started: Instant,
}

/// Point-in-time copy of [`ProcessingMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub deduplicated: u64,
    pub bytes_ingested: u64,
    pub cumulative_time: Duration,
    pub uptime: Duration,
    pub items_per_second: f64,
    pub failures_by_step: Vec<(PipelineStep, u64)>,
}

impl ProcessingMetrics {
    pub fn new() -> Self {
        Self {
            attempted: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            deduplicated: AtomicU64::new(0),
            bytes_ingested: AtomicU64::new(0),
            busy_micros: AtomicU64::new(0),
            failures_by_step: DashMap::new(),
            started: Instant::now(),
        }
    }

    pub fn record_attempt(&self) {
        self.attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self, bytes: u64, deduplicated: bool, elapsed: Duration) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        self.bytes_ingested.fetch_add(bytes, Ordering::Relaxed);
        if deduplicated {
            self.deduplicated.fetch_add(1, Ordering::Relaxed);
        }
        self.add_time(elapsed);
    }

    pub fn record_failure(&self, step: PipelineStep, elapsed: Duration) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        *self.failures_by_step.entry(step).or_insert(0) += 1;
        self.add_time(elapsed);
    }

    fn add_time(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.busy_micros.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let uptime = self.started.elapsed();
        let attempted = self.attempted.load(Ordering::Relaxed);
        let seconds = uptime.as_secs_f64();

        let mut failures_by_step: Vec<_> = self
            .failures_by_step
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        failures_by_step.sort_by_key(|(step, _)| step.name());

        MetricsSnapshot {
            attempted,
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            bytes_ingested: self.bytes_ingested.load(Ordering::Relaxed),
            cumulative_time: Duration::from_micros(self.busy_micros.load(Ordering::Relaxed)),
            uptime,
            items_per_second: if seconds > 0.0 {
                attempted as f64 / seconds
            } else {
                0.0
            },
            failures_by_step,
        }
    }
}

impl Default for ProcessingMetrics {
    fn default() -> Self {
        Self::new()
    }
}
