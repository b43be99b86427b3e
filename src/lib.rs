//! # Spacebound - Space-Bounded Fork-Join Scheduling
//!
//! A fork-join task execution engine whose schedulers know the machine's
//! cache hierarchy. Jobs carry byte footprints, the hierarchy is described
//! as a tree of clusters with capacities and block sizes, and the
//! hierarchical policies admit work into a cluster only while the live
//! footprint below it fits. Classic centralized, per-worker and
//! work-stealing policies are included for comparison.
//!
//! ## Architecture
//!
//! - **Jobs**: move-by-value work units; each run ends in exactly one fork
//!   or join
//! - **Forks**: park a continuation until the last child strand joins
//! - **Schedulers**: pluggable policies behind one trait, from a single
//!   shared queue to space-bounded cluster trees
//! - **Workers**: OS threads, one per scheduler slot, optionally pinned to
//!   cores
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use spacebound::{CentralScheduler, Context, Job, Task, ThreadPool};
//!
//! struct Hello;
//!
//! impl Task for Hello {
//!     fn run(&mut self, ctx: &mut Context<'_>) {
//!         println!("hello from a worker");
//!         ctx.join();
//!     }
//! }
//!
//! let pool = ThreadPool::new(Arc::new(CentralScheduler::new(4).unwrap()));
//! let handle = pool.run(Job::new(Hello));
//! handle.wait();
//! pool.shutdown().unwrap();
//! ```

pub mod context;
mod fork;
pub mod job;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod pool;
pub mod scheduler;
mod worker;

use serde::{Deserialize, Serialize};

/// Strategy for pinning worker threads to CPU cores.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PinningStrategy {
    /// No pinning (standard OS scheduling).
    #[default]
    None,
    /// Linear pinning (worker i -> logical processor i).
    Linear,
    /// Pin to physical cores only (even-numbered logical processors),
    /// avoiding SMT contention.
    AvoidSMT,
    /// Explicit affinity map: worker i -> logical processor `map[i]`.
    /// Workers past the end of the map are left unpinned.
    Custom(Vec<usize>),
}

pub use context::Context;
pub use job::{round_up, HierarchicalTask, Job, JobHandle, SizedTask, Task};
pub use pool::{PoolConfig, PoolError, ThreadPool};
pub use scheduler::central::CentralScheduler;
pub use scheduler::hr1::ActiveSetScheduler;
pub use scheduler::hr2::BucketScheduler;
pub use scheduler::hr3::ReserveScheduler;
pub use scheduler::hr4::ShardedBucketScheduler;
pub use scheduler::local::LocalScheduler;
pub use scheduler::steal::{LocalityStealScheduler, StealScheduler};
pub use scheduler::tree::{ClusterId, ClusterUsage, Topology, UNBOUNDED};
pub use scheduler::{BucketKind, ConfigError, Scheduler};

#[cfg(test)]
mod tests;
