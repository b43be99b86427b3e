//! The thread pool front end.
//!
//! A [`ThreadPool`] owns a fixed set of worker threads and the scheduler
//! that feeds them. Callers submit root jobs with [`ThreadPool::run`], wait
//! for quiescence with [`ThreadPool::sync_all`] and stop the workers with
//! [`ThreadPool::shutdown`]. Everything in between — forked children,
//! continuations, space accounting — flows through the scheduler without
//! the pool ever looking inside a queue.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::job::{Job, JobHandle};
use crate::scheduler::central::CentralScheduler;
use crate::scheduler::Scheduler;
use crate::worker::{Shared, Worker};
use crate::PinningStrategy;

/// Configuration for a [`ThreadPool`].
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// How worker threads are pinned to CPU cores.
    pub pinning: PinningStrategy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            pinning: PinningStrategy::None,
        }
    }
}

/// The pool failed to shut down cleanly.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("{count} worker thread(s) panicked")]
    WorkersPanicked { count: usize },
}

/// A pool of worker threads driven by one scheduling policy.
pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Vec<Worker>,
}

impl ThreadPool {
    /// Creates a pool with one worker per scheduler slot and no pinning.
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self::with_config(scheduler, PoolConfig::default())
    }

    /// Creates a pool with an explicit worker pinning strategy.
    pub fn with_pinning(scheduler: Arc<dyn Scheduler>, pinning: PinningStrategy) -> Self {
        Self::with_config(scheduler, PoolConfig { pinning })
    }

    /// Creates a pool from a full configuration.
    pub fn with_config(scheduler: Arc<dyn Scheduler>, config: PoolConfig) -> Self {
        let num_workers = scheduler.num_workers();
        let shared = Shared::new(scheduler);

        let mut workers = Vec::with_capacity(num_workers);
        for id in 0..num_workers {
            workers.push(Worker::new(id, Arc::clone(&shared), config.pinning.clone()));
        }

        tracing::info!(
            workers = num_workers,
            pinning = ?config.pinning,
            "thread pool started"
        );
        ThreadPool { shared, workers }
    }

    /// Creates a pool over a single shared queue, sized to the machine.
    pub fn with_default_workers() -> Self {
        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let scheduler =
            CentralScheduler::new(workers).expect("available parallelism is at least one");
        Self::new(Arc::new(scheduler))
    }

    /// Returns the number of worker threads in the pool.
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Submits `job` from outside the pool.
    ///
    /// The returned handle completes when the job itself has run, which for
    /// a forking job is before its children do; use [`ThreadPool::sync_all`]
    /// to wait for a whole computation.
    pub fn run(&self, mut job: Job) -> JobHandle {
        let handle = job.handle();
        #[cfg(feature = "metrics")]
        self.shared
            .metrics
            .jobs_submitted
            .fetch_add(1, Ordering::Relaxed);
        self.shared.scheduler.add(job, self.workers.len());
        handle
    }

    /// Submits a batch of jobs from outside the pool.
    pub fn run_all(&self, jobs: Vec<Job>) {
        #[cfg(feature = "metrics")]
        self.shared
            .metrics
            .jobs_submitted
            .fetch_add(jobs.len() as u64, Ordering::Relaxed);
        self.shared.scheduler.add_multiple(jobs, self.workers.len());
    }

    /// Blocks until the scheduler is drained and every worker is idle.
    pub fn sync_all(&self) {
        let mut backoff_us = 1;
        const MAX_BACKOFF_US: u64 = 1000;
        loop {
            let drained = !self.shared.scheduler.more(None)
                && self.shared.idle.load(Ordering::SeqCst) == self.workers.len();
            if drained {
                return;
            }
            thread::sleep(Duration::from_micros(backoff_us));
            backoff_us = (backoff_us * 2).min(MAX_BACKOFF_US);
        }
    }

    /// Returns a snapshot of pool metrics.
    #[cfg(feature = "metrics")]
    pub fn metrics(&self) -> crate::metrics::MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Waits for outstanding work, then stops the workers.
    ///
    /// Returns Ok if all workers shut down successfully, or an error
    /// carrying the number of workers that panicked.
    pub fn shutdown(self) -> Result<(), PoolError> {
        self.sync_all();

        self.shared.shutdown.store(true, Ordering::Relaxed);

        let mut panicked = 0;
        for worker in self.workers {
            let worker_id = worker.id();
            if worker.join().is_err() {
                panicked += 1;
                tracing::error!(worker = worker_id, "worker panicked during execution");
            }
        }

        if panicked > 0 {
            Err(PoolError::WorkersPanicked { count: panicked })
        } else {
            Ok(())
        }
    }
}
