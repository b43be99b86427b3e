//! Scheduling policies for the thread pool.
//!
//! Every policy implements the [`Scheduler`] trait: workers pull jobs with
//! `get`, report finished strands with `done`, and push forked children back
//! with `add`. The pool never inspects queues directly, so policies are free
//! to organize work however they like, from a single shared queue to a
//! cache-hierarchy tree with per-cluster occupancy accounting.
//!
//! Thread ids passed to a scheduler are worker indices in
//! `0..num_workers()`. The value `num_workers()` itself is reserved for
//! external submitters (threads outside the pool, e.g. the caller of
//! [`ThreadPool::run`](crate::ThreadPool::run)) and is only valid for `add`.

use crate::job::Job;

pub mod central;
pub mod hr1;
pub mod hr2;
pub mod hr3;
pub mod hr4;
pub mod local;
pub(crate) mod queues;
pub mod steal;
pub mod tree;

pub use queues::BucketKind;

/// Fraction of a cluster's capacity that a single task may occupy before it
/// must be pinned to a proper ancestor instead.
pub(crate) const SIGMA: f64 = 0.5;

/// Fraction of a cluster's capacity reserved for strands of jobs pinned
/// above it. Dispatch below a cluster stops once its occupancy exceeds
/// `(1 - MU)` of capacity.
pub(crate) const MU: f64 = 0.2;

/// A work-distribution policy driving a fixed set of pool workers.
///
/// Implementations are shared across worker threads behind an `Arc`, so all
/// methods take `&self` and synchronize internally.
pub trait Scheduler: Send + Sync {
    /// Number of pool workers this scheduler was built for.
    fn num_workers(&self) -> usize;

    /// Makes `job` available for execution. `thread_id` is the submitting
    /// worker, or `num_workers()` for submissions from outside the pool.
    fn add(&self, job: Job, thread_id: usize);

    /// Adds a batch of jobs from one submitter. Policies with per-cluster
    /// admission can override this to amortize bookkeeping.
    fn add_multiple(&self, jobs: Vec<Job>, thread_id: usize) {
        for job in jobs {
            self.add(job, thread_id);
        }
    }

    /// Asks for a job on behalf of worker `thread_id`. `None` means nothing
    /// runnable right now; the worker backs off and retries while
    /// `more(None)` holds.
    fn get(&self, thread_id: usize) -> Option<Job>;

    /// Reports that worker `thread_id` finished running `job`.
    ///
    /// `deactivate` is true when the job joined (its strand is over) and
    /// false when it forked (the strand continues in its children). Policies
    /// that charge space per strand release it here.
    fn done(&self, job: &Job, thread_id: usize, deactivate: bool);

    /// Whether queued work exists for worker `thread_id`, or anywhere when
    /// `None`. A `true` result is advisory: a concurrent `get` may still
    /// come back empty.
    fn more(&self, thread_id: Option<usize>) -> bool;
}

/// Rejects out-of-range thread ids before they corrupt per-worker state.
/// `allow_external` additionally admits the reserved submitter id.
pub(crate) fn check_worker_id(thread_id: usize, num_workers: usize, allow_external: bool) {
    let end = if allow_external {
        num_workers + 1
    } else {
        num_workers
    };
    assert!(
        thread_id < end,
        "thread id {thread_id} out of range for {num_workers} workers"
    );
}

/// A scheduler or topology was configured inconsistently.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no workers requested")]
    ZeroWorkers,
    #[error("fan_outs, capacities and block_sizes must have equal length (got {fan_outs}, {capacities}, {block_sizes})")]
    LevelMismatch {
        fan_outs: usize,
        capacities: usize,
        block_sizes: usize,
    },
    #[error("topology needs at least one level")]
    NoLevels,
    #[error("fan-out at level {level} is zero")]
    ZeroFanOut { level: usize },
    #[error("block size at level {level} is zero")]
    ZeroBlockSize { level: usize },
    #[error("capacity at level {level} is zero")]
    ZeroCapacity { level: usize },
    #[error("capacity at level {level} exceeds the level above it")]
    CapacityOrder { level: usize },
    #[error("topology has {leaves} leaves but the pool has {workers} workers")]
    WorkerCountMismatch { leaves: usize, workers: usize },
    #[error("{workers} workers do not divide into {fan_out} equal clusters")]
    UnevenClusters { workers: usize, fan_out: usize },
    #[error("steal ratio {ratio} must be positive")]
    BadStealRatio { ratio: f64 },
}
