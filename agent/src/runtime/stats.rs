//! Worker execution counters.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters for executions on this worker
#[derive(Debug)]
pub struct WorkerStats {
    /// Executions that produced outputs
    pub completed: AtomicU64,

    /// Executions that reached the executor and failed
    pub failed: AtomicU64,

    /// Requests turned away before execution (credential, schema, capacity)
    pub rejected: AtomicU64,

    /// Retries answered from the dedup cache
    pub dedup_hits: AtomicU64,

    pub total_execution_ms: AtomicU64,

    /// Start time for uptime tracking
    pub start_time: Instant,
}

impl Default for WorkerStats {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerStats {
    pub fn new() -> Self {
        Self {
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            dedup_hits: AtomicU64::new(0),
            total_execution_ms: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_success(&self, execution_ms: u64) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.total_execution_ms
            .fetch_add(execution_ms, Ordering::Relaxed);
    }

    pub fn record_failure(&self, execution_ms: u64) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.total_execution_ms
            .fetch_add(execution_ms, Ordering::Relaxed);
    }

    pub fn record_rejection(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dedup_hit(&self) {
        self.dedup_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Executions that reached the executor
    pub fn total_executions(&self) -> u64 {
        self.completed.load(Ordering::Relaxed) + self.failed.load(Ordering::Relaxed)
    }

    /// Success rate (0.0 - 1.0); 1.0 before any execution
    pub fn success_rate(&self) -> f64 {
        let total = self.total_executions();
        if total == 0 {
            return 1.0;
        }
        self.completed.load(Ordering::Relaxed) as f64 / total as f64
    }

    pub fn avg_execution_ms(&self) -> f64 {
        let total = self.total_executions();
        if total == 0 {
            return 0.0;
        }
        self.total_execution_ms.load(Ordering::Relaxed) as f64 / total as f64
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dedup_hits: self.dedup_hits.load(Ordering::Relaxed),
            avg_execution_ms: self.avg_execution_ms(),
            success_rate: self.success_rate(),
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub completed: u64,
    pub failed: u64,
    pub rejected: u64,
    pub dedup_hits: u64,
    pub avg_execution_ms: f64,
    pub success_rate: f64,
    pub uptime_secs: u64,
}
