#[cfg(feature = "metrics")]
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(feature = "metrics")]
use std::time::Instant;

/// Optional performance metrics for a thread pool.
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct Metrics {
    /// Jobs submitted from outside the pool.
    pub jobs_submitted: AtomicU64,
    /// Jobs that ran to completion on a worker.
    pub jobs_completed: AtomicU64,
    /// Jobs that ended in a fork.
    pub forks: AtomicU64,
    /// Jobs that ended in a join.
    pub joins: AtomicU64,
    /// Child jobs handed to the scheduler by forks.
    pub children_spawned: AtomicU64,
    /// Time when metrics collection started.
    pub start_time: Instant,
}

#[cfg(feature = "metrics")]
impl Metrics {
    /// Creates a new metrics instance.
    pub fn new() -> Self {
        Self {
            jobs_submitted: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
            forks: AtomicU64::new(0),
            joins: AtomicU64::new(0),
            children_spawned: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Returns a snapshot of current metrics values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            forks: self.forks.load(Ordering::Relaxed),
            joins: self.joins.load(Ordering::Relaxed),
            children_spawned: self.children_spawned.load(Ordering::Relaxed),
            elapsed_seconds: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

#[cfg(feature = "metrics")]
impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[cfg(feature = "metrics")]
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub jobs_submitted: u64,
    pub jobs_completed: u64,
    pub forks: u64,
    pub joins: u64,
    pub children_spawned: u64,
    pub elapsed_seconds: f64,
}

#[cfg(feature = "metrics")]
impl MetricsSnapshot {
    /// Calculates jobs per second throughput.
    pub fn jobs_per_second(&self) -> f64 {
        if self.elapsed_seconds > 0.0 {
            self.jobs_completed as f64 / self.elapsed_seconds
        } else {
            0.0
        }
    }

    /// Average children per fork.
    pub fn average_fanout(&self) -> f64 {
        if self.forks > 0 {
            self.children_spawned as f64 / self.forks as f64
        } else {
            0.0
        }
    }
}
