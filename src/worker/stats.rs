//! Running scheduler statistics.

use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;

/// Point-in-time statistics.
///
/// `total_processed == success_count + error_count` holds in every snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerStats {
    pub total_processed: u64,
    pub success_count: u64,
    pub error_count: u64,
    /// Queued tasks across both lanes at sample time.
    pub queue_size: usize,
    /// Workers executing a task at sample time.
    pub active_workers: usize,
    pub total_workers: usize,
    /// Mean execution time of completed tasks (0 when nothing ran yet).
    pub average_duration_ms: f64,
    pub uptime_secs: u64,
}

#[derive(Debug, Default)]
struct Counters {
    total_processed: u64,
    success_count: u64,
    error_count: u64,
    total_duration_ms: u64,
}

/// Aggregates task outcomes. Safe to share between workers.
#[derive(Debug)]
pub struct StatsCollector {
    counters: Mutex<Counters>,
    started: Instant,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
            started: Instant::now(),
        }
    }

    /// Record one finished task. Called exactly once per task.
    pub fn record_outcome(&self, success: bool, duration_ms: u64) {
        let mut c = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        c.total_processed += 1;
        if success {
            c.success_count += 1;
        } else {
            c.error_count += 1;
        }
        c.total_duration_ms = c.total_duration_ms.saturating_add(duration_ms);
    }

    /// Consistent read of the counters plus the caller-sampled live values.
    pub fn snapshot(
        &self,
        queue_size: usize,
        active_workers: usize,
        total_workers: usize,
    ) -> SchedulerStats {
        let c = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let average_duration_ms = if c.total_processed == 0 {
            0.0
        } else {
            c.total_duration_ms as f64 / c.total_processed as f64
        };

        SchedulerStats {
            total_processed: c.total_processed,
            success_count: c.success_count,
            error_count: c.error_count,
            queue_size,
            active_workers,
            total_workers,
            average_duration_ms,
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}
