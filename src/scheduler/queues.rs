//! Queue primitives shared by the scheduling policies.
//!
//! [`SyncQueue`] is a mutex-protected deque with a lock-free emptiness
//! probe. [`ShardedQueue`] spreads one logical queue over per-child shards
//! so siblings under a busy cluster do not serialize on a single lock.
//! [`Buckets`] classifies sized jobs into per-cluster queues by how far down
//! the hierarchy their footprint can fit.

use crossbeam::utils::CachePadded;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::job::Job;
use crate::scheduler::tree::UNBOUNDED;

pub(crate) struct SyncQueue<T> {
    items: Mutex<VecDeque<T>>,
    len: AtomicUsize,
}

impl<T> SyncQueue<T> {
    pub fn new() -> Self {
        SyncQueue {
            items: Mutex::new(VecDeque::new()),
            len: AtomicUsize::new(0),
        }
    }

    fn locked(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().expect("queue mutex poisoned")
    }

    pub fn push_front(&self, item: T) {
        let mut items = self.locked();
        items.push_front(item);
        self.len.store(items.len(), Ordering::Release);
    }

    pub fn push_back(&self, item: T) {
        let mut items = self.locked();
        items.push_back(item);
        self.len.store(items.len(), Ordering::Release);
    }

    /// Pops the front without locking when the queue looks empty. The probe
    /// can go stale either way; callers treat `None` as "try again later".
    pub fn pop_front(&self) -> Option<T> {
        if self.len.load(Ordering::Acquire) == 0 {
            return None;
        }
        let mut items = self.locked();
        let item = items.pop_front();
        self.len.store(items.len(), Ordering::Release);
        item
    }

    pub fn pop_back(&self) -> Option<T> {
        if self.len.load(Ordering::Acquire) == 0 {
            return None;
        }
        let mut items = self.locked();
        let item = items.pop_back();
        self.len.store(items.len(), Ordering::Release);
        item
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One queue split into per-child shards. A child pushes and pops LIFO at
/// the front of its own shard; when that runs dry it makes a bounded number
/// of random FIFO steals from the backs of the others.
pub(crate) struct ShardedQueue<T> {
    shards: Vec<CachePadded<SyncQueue<T>>>,
}

impl<T> ShardedQueue<T> {
    pub fn new(num_shards: usize) -> Self {
        assert!(num_shards > 0, "sharded queue needs at least one shard");
        ShardedQueue {
            shards: (0..num_shards)
                .map(|_| CachePadded::new(SyncQueue::new()))
                .collect(),
        }
    }

    pub fn push(&self, shard: usize, item: T) {
        self.shards[shard].push_front(item);
    }

    pub fn pop(&self, shard: usize) -> Option<T> {
        if let Some(item) = self.shards[shard].pop_front() {
            return Some(item);
        }
        let mut rng = rand::rng();
        for _ in 0..2 * self.shards.len() {
            let victim = rng.random_range(0..self.shards.len());
            if let Some(item) = self.shards[victim].pop_back() {
                return Some(item);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }
}

/// How a cluster's buckets store their queues.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BucketKind {
    /// One plain queue per bucket.
    Plain,
    /// The widest bucket (level 0) is sharded per child, the rest plain.
    /// Level 0 sees the most traffic: every job pinned at this cluster
    /// lands there.
    TopSharded,
    /// Every bucket is sharded per child.
    Sharded,
}

enum Shelf {
    Plain(SyncQueue<Job>),
    Sharded(ShardedQueue<Job>),
}

/// Size-classified queues for one cluster.
///
/// Bucket `i` holds jobs whose task size exceeds `sigma` times the capacity
/// `i + 1` levels further down, i.e. jobs that must be pinned no deeper than
/// `i` levels below this cluster. Bucket 0 catches jobs pinned here.
pub(crate) struct Buckets {
    thresholds: Vec<u64>,
    levels: Vec<Shelf>,
    block_size: u64,
    sigma: f64,
}

impl Buckets {
    /// `capacities` are the configured capacities from this cluster's level
    /// downward; the first entry is replaced by [`UNBOUNDED`] so bucket 0
    /// has no upper bound.
    pub fn new(
        kind: BucketKind,
        num_levels: usize,
        num_children: usize,
        block_size: u64,
        capacities: &[u64],
        sigma: f64,
    ) -> Self {
        let mut thresholds = vec![0u64; num_levels + 1];
        thresholds[..num_levels].copy_from_slice(&capacities[..num_levels]);
        thresholds[0] = UNBOUNDED;
        let levels = (0..num_levels)
            .map(|level| {
                let sharded = num_children > 1
                    && match kind {
                        BucketKind::Plain => false,
                        BucketKind::TopSharded => level == 0,
                        BucketKind::Sharded => true,
                    };
                if sharded {
                    Shelf::Sharded(ShardedQueue::new(num_children))
                } else {
                    Shelf::Plain(SyncQueue::new())
                }
            })
            .collect();
        Buckets {
            thresholds,
            levels,
            block_size,
            sigma,
        }
    }

    fn task_size(&self, job: &Job) -> u64 {
        job.size(self.block_size)
            .expect("bucket policies require jobs with a task size")
    }

    fn push(&self, level: usize, job: Job, child: usize) {
        match &self.levels[level] {
            Shelf::Plain(q) => q.push_front(job),
            Shelf::Sharded(q) => q.push(child, job),
        }
    }

    fn pop(&self, level: usize, child: usize) -> Option<Job> {
        match &self.levels[level] {
            Shelf::Plain(q) => q.pop_front(),
            Shelf::Sharded(q) => q.pop(child),
        }
    }

    /// Files `job` into the widest bucket whose band admits its task size
    /// and returns the bucket level. `child` is the subtree the submitter
    /// came from, used only by sharded shelves.
    pub fn add(&self, job: Job, child: usize) -> usize {
        let task = self.task_size(&job) as f64;
        for level in 0..self.levels.len() {
            if task > self.sigma * self.thresholds[level + 1] as f64 {
                self.push(level, job, child);
                return level;
            }
        }
        panic!("job reports a zero-byte task; sized tasks occupy at least one block");
    }

    /// Takes the first job found scanning buckets `min_level` and up, along
    /// with the level it came from.
    pub fn get(&self, min_level: usize, child: usize) -> Option<(Job, usize)> {
        for level in min_level..self.levels.len() {
            if let Some(job) = self.pop(level, child) {
                return Some((job, level));
            }
        }
        None
    }

    /// Puts back a job that was popped but could not be placed.
    pub fn put_back(&self, job: Job, level: usize, child: usize) {
        let task = self.task_size(&job) as f64;
        debug_assert!(
            self.sigma * self.thresholds[level] as f64 >= task
                && task > self.sigma * self.thresholds[level + 1] as f64,
            "job does not band at bucket level {level}"
        );
        self.push(level, job, child);
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn len(&self) -> usize {
        self.levels
            .iter()
            .map(|shelf| match shelf {
                Shelf::Plain(q) => q.len(),
                Shelf::Sharded(q) => q.len(),
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{round_up, SizedTask, Task};
    use crate::Context;

    struct Chunk {
        bytes: u64,
    }

    impl Task for Chunk {
        fn run(&mut self, ctx: &mut Context<'_>) {
            ctx.join();
        }
    }

    impl SizedTask for Chunk {
        fn size(&self, block_size: u64) -> u64 {
            round_up(self.bytes, block_size)
        }
    }

    fn sized(bytes: u64) -> Job {
        Job::sized(Chunk { bytes })
    }

    #[test]
    fn sync_queue_ends() {
        let q = SyncQueue::new();
        q.push_back(1);
        q.push_back(2);
        q.push_front(0);
        assert_eq!(q.len(), 3);
        assert_eq!(q.pop_front(), Some(0));
        assert_eq!(q.pop_back(), Some(2));
        assert_eq!(q.pop_front(), Some(1));
        assert_eq!(q.pop_front(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn sharded_queue_steals_across_shards() {
        let q = ShardedQueue::new(2);
        q.push(0, 7u32);
        let mut stolen = None;
        for _ in 0..64 {
            stolen = q.pop(1);
            if stolen.is_some() {
                break;
            }
        }
        assert_eq!(stolen, Some(7));
        assert_eq!(q.pop(0), None);
    }

    #[test]
    fn sharded_queue_prefers_own_shard() {
        let q = ShardedQueue::new(4);
        q.push(2, 1u32);
        q.push(2, 2u32);
        // Own pops come LIFO off the front.
        assert_eq!(q.pop(2), Some(2));
        assert_eq!(q.pop(2), Some(1));
    }

    #[test]
    fn buckets_band_by_task_size() {
        // Thresholds become [UNBOUNDED, 1 MiB, 64 KiB, 0] with sigma 0.5.
        let buckets = Buckets::new(BucketKind::Plain, 3, 2, 64, &[0, 1 << 20, 1 << 16], 0.5);
        assert_eq!(buckets.add(sized(2 << 20), 0), 0);
        assert_eq!(buckets.add(sized(300 << 10), 0), 1);
        assert_eq!(buckets.add(sized(10 << 10), 0), 2);
        assert_eq!(buckets.len(), 3);

        let (job, level) = buckets.get(1, 0).unwrap();
        assert_eq!(level, 1);
        assert_eq!(job.size(64), Some(round_up(300 << 10, 64)));
        buckets.put_back(job, 1, 0);
        let (_, level) = buckets.get(0, 0).unwrap();
        assert_eq!(level, 0);
    }

    #[test]
    fn buckets_pop_newest_first() {
        let buckets = Buckets::new(BucketKind::Plain, 2, 1, 64, &[0, 1 << 16], 0.5);
        let first = sized(1 << 20);
        let second = sized(1 << 20);
        let (old_id, new_id) = (first.id(), second.id());
        buckets.add(first, 0);
        buckets.add(second, 0);
        assert_eq!(buckets.get(0, 0).unwrap().0.id(), new_id);
        assert_eq!(buckets.get(0, 0).unwrap().0.id(), old_id);
    }

    #[test]
    fn top_sharded_buckets_scan_all_levels() {
        let buckets =
            Buckets::new(BucketKind::TopSharded, 2, 2, 64, &[0, 1 << 16], 0.5);
        buckets.add(sized(1 << 20), 1);
        buckets.add(sized(4 << 10), 1);
        let mut levels = Vec::new();
        for _ in 0..128 {
            if let Some((_, level)) = buckets.get(0, 0) {
                levels.push(level);
            }
            if levels.len() == 2 {
                break;
            }
        }
        levels.sort_unstable();
        assert_eq!(levels, vec![0, 1]);
    }
}
