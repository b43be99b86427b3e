//! [`BucketScheduler`] with every bucket queue sharded per child.
//!
//! Placement, pinning and occupancy accounting are identical to the plain
//! bucket policy; only the queues differ. Sharding keeps siblings under a
//! wide cluster off each other's bucket locks, at the cost of a little
//! shuffling when a shard runs dry and has to steal from its neighbours.

use crate::job::Job;
use crate::scheduler::hr2::BucketScheduler;
use crate::scheduler::queues::BucketKind;
use crate::scheduler::tree::{ClusterUsage, Topology};
use crate::scheduler::{ConfigError, Scheduler};

pub struct ShardedBucketScheduler {
    inner: BucketScheduler,
}

impl ShardedBucketScheduler {
    pub fn new(num_workers: usize, topology: &Topology) -> Result<Self, ConfigError> {
        Ok(ShardedBucketScheduler {
            inner: BucketScheduler::new(num_workers, topology, BucketKind::Sharded)?,
        })
    }

    pub fn occupancies(&self) -> Vec<ClusterUsage> {
        self.inner.occupancies()
    }
}

impl Scheduler for ShardedBucketScheduler {
    fn num_workers(&self) -> usize {
        self.inner.num_workers()
    }

    fn add(&self, job: Job, thread_id: usize) {
        self.inner.add(job, thread_id);
    }

    fn get(&self, thread_id: usize) -> Option<Job> {
        self.inner.get(thread_id)
    }

    fn done(&self, job: &Job, thread_id: usize, deactivate: bool) {
        self.inner.done(job, thread_id, deactivate);
    }

    fn more(&self, thread_id: Option<usize>) -> bool {
        self.inner.more(thread_id)
    }
}
