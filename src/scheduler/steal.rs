//! Randomized work stealing, with and without locality awareness.
//!
//! Both policies keep one deque per worker: owners push and pop LIFO at the
//! back, thieves take FIFO from the front so they walk off with the oldest
//! (usually largest) subtree. A worker whose own deque is empty makes a
//! single steal attempt per `get` call and otherwise reports no work; the
//! pool retries while jobs remain.
//!
//! [`StealScheduler`] picks victims uniformly at random.
//! [`LocalityStealScheduler`] partitions workers into equal clusters and
//! skews the victim distribution so a worker steals from its own cluster
//! `steal_ratio` times more often than from a remote one.

use crossbeam::utils::CachePadded;
use rand::Rng;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::job::Job;
use crate::scheduler::queues::SyncQueue;
use crate::scheduler::{check_worker_id, ConfigError, Scheduler};

/// Per-worker deques plus the steal protocol shared by both policies.
struct StealCore {
    queues: Vec<CachePadded<SyncQueue<Job>>>,
    /// Serializes thieves per victim so at most one rummages at a time.
    steal_locks: Vec<CachePadded<Mutex<()>>>,
    /// Successful steals per thief.
    steals: Vec<CachePadded<AtomicU64>>,
    pending: AtomicUsize,
    num_workers: usize,
}

impl StealCore {
    fn new(num_workers: usize) -> Result<Self, ConfigError> {
        if num_workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        Ok(StealCore {
            queues: (0..num_workers)
                .map(|_| CachePadded::new(SyncQueue::new()))
                .collect(),
            steal_locks: (0..num_workers)
                .map(|_| CachePadded::new(Mutex::new(())))
                .collect(),
            steals: (0..num_workers)
                .map(|_| CachePadded::new(AtomicU64::new(0)))
                .collect(),
            pending: AtomicUsize::new(0),
            num_workers,
        })
    }

    fn add(&self, job: Job, thread_id: usize) {
        check_worker_id(thread_id, self.num_workers, true);
        let target = if thread_id == self.num_workers {
            0
        } else {
            thread_id
        };
        self.queues[target].push_back(job);
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    fn pop_own(&self, thread_id: usize) -> Option<Job> {
        let job = self.queues[thread_id].pop_back()?;
        self.pending.fetch_sub(1, Ordering::SeqCst);
        Some(job)
    }

    fn steal_from(&self, victim: usize, thief: usize) -> Option<Job> {
        let _turn = self.steal_locks[victim]
            .lock()
            .expect("steal lock poisoned");
        let job = self.queues[victim].pop_front()?;
        self.pending.fetch_sub(1, Ordering::SeqCst);
        if victim != thief {
            self.steals[thief].fetch_add(1, Ordering::Relaxed);
        }
        Some(job)
    }

    fn more(&self) -> bool {
        self.pending.load(Ordering::SeqCst) > 0
    }

    fn steal_counts(&self) -> Vec<u64> {
        self.steals
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect()
    }
}

pub struct StealScheduler {
    core: StealCore,
}

impl StealScheduler {
    pub fn new(num_workers: usize) -> Result<Self, ConfigError> {
        Ok(StealScheduler {
            core: StealCore::new(num_workers)?,
        })
    }

    /// Successful steals per worker since construction.
    pub fn steal_counts(&self) -> Vec<u64> {
        self.core.steal_counts()
    }

    pub fn total_steals(&self) -> u64 {
        self.steal_counts().iter().sum()
    }
}

impl Scheduler for StealScheduler {
    fn num_workers(&self) -> usize {
        self.core.num_workers
    }

    fn add(&self, job: Job, thread_id: usize) {
        self.core.add(job, thread_id);
    }

    fn get(&self, thread_id: usize) -> Option<Job> {
        check_worker_id(thread_id, self.core.num_workers, false);
        if let Some(job) = self.core.pop_own(thread_id) {
            return Some(job);
        }
        // One attempt per call; the victim may be this worker itself.
        let victim = rand::rng().random_range(0..self.core.num_workers);
        self.core.steal_from(victim, thread_id)
    }

    fn done(&self, _job: &Job, thread_id: usize, _deactivate: bool) {
        check_worker_id(thread_id, self.core.num_workers, false);
    }

    fn more(&self, _thread_id: Option<usize>) -> bool {
        self.core.more()
    }
}

/// Work stealing with the victim distribution skewed toward the thief's own
/// cluster of `cluster_size` adjacent workers.
pub struct LocalityStealScheduler {
    core: StealCore,
    cluster_size: usize,
    /// Probability mass on each worker inside the thief's cluster.
    large: f64,
    /// Probability mass on each worker outside it.
    small: f64,
}

impl LocalityStealScheduler {
    /// `fan_out` is the number of clusters; it must divide `num_workers`.
    /// `steal_ratio` is how much likelier an in-cluster victim is than a
    /// remote one.
    pub fn new(num_workers: usize, fan_out: usize, steal_ratio: f64) -> Result<Self, ConfigError> {
        let core = StealCore::new(num_workers)?;
        if fan_out == 0 || num_workers % fan_out != 0 {
            return Err(ConfigError::UnevenClusters {
                workers: num_workers,
                fan_out,
            });
        }
        if steal_ratio <= 0.0 {
            return Err(ConfigError::BadStealRatio { ratio: steal_ratio });
        }
        let cluster_size = num_workers / fan_out;
        let c = cluster_size as f64;
        let n = num_workers as f64;
        let large = steal_ratio / (steal_ratio * c + (n - c));
        let small = 1.0 / (steal_ratio * c + (n - c));
        Ok(LocalityStealScheduler {
            core,
            cluster_size,
            large,
            small,
        })
    }

    /// Maps a uniform draw in `[0, 1)` to a victim: workers before the
    /// thief's cluster carry `small` mass each, cluster mates `large`,
    /// workers after the cluster `small` again.
    fn victim_for(&self, thread_id: usize, fraction: f64) -> usize {
        let c = self.cluster_size;
        let cluster_id = thread_id / c;
        let before_own = self.small * (cluster_id * c) as f64;
        let through_own = before_own + self.large * c as f64;
        let choice = if fraction < before_own {
            (fraction / self.small) as usize
        } else if fraction < through_own {
            cluster_id * c + ((fraction - before_own) / self.large) as usize
        } else {
            (cluster_id + 1) * c + ((fraction - through_own) / self.small) as usize
        };
        // Guard against the draw landing exactly on a segment seam after
        // floating-point rounding.
        choice.min(self.core.num_workers - 1)
    }

    pub fn steal_counts(&self) -> Vec<u64> {
        self.core.steal_counts()
    }

    pub fn total_steals(&self) -> u64 {
        self.steal_counts().iter().sum()
    }
}

impl Scheduler for LocalityStealScheduler {
    fn num_workers(&self) -> usize {
        self.core.num_workers
    }

    fn add(&self, job: Job, thread_id: usize) {
        self.core.add(job, thread_id);
    }

    fn get(&self, thread_id: usize) -> Option<Job> {
        check_worker_id(thread_id, self.core.num_workers, false);
        if let Some(job) = self.core.pop_own(thread_id) {
            return Some(job);
        }
        let victim = self.victim_for(thread_id, rand::rng().random_range(0.0..1.0));
        self.core.steal_from(victim, thread_id)
    }

    fn done(&self, _job: &Job, thread_id: usize, _deactivate: bool) {
        check_worker_id(thread_id, self.core.num_workers, false);
    }

    fn more(&self, _thread_id: Option<usize>) -> bool {
        self.core.more()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Task;
    use crate::Context;

    struct Noop;

    impl Task for Noop {
        fn run(&mut self, ctx: &mut Context<'_>) {
            ctx.join();
        }
    }

    #[test]
    fn own_queue_is_lifo() {
        let sched = StealScheduler::new(2).unwrap();
        let (a, b) = (Job::new(Noop), Job::new(Noop));
        let (id_a, id_b) = (a.id(), b.id());
        sched.add(a, 0);
        sched.add(b, 0);
        assert_eq!(sched.get(0).unwrap().id(), id_b);
        assert_eq!(sched.get(0).unwrap().id(), id_a);
        assert!(!sched.more(None));
    }

    #[test]
    fn thieves_take_the_oldest_job() {
        let sched = StealScheduler::new(2).unwrap();
        let (a, b) = (Job::new(Noop), Job::new(Noop));
        let id_a = a.id();
        sched.add(a, 0);
        sched.add(b, 0);
        let stolen = sched.core.steal_from(0, 1).unwrap();
        assert_eq!(stolen.id(), id_a);
        assert_eq!(sched.total_steals(), 1);
    }

    #[test]
    fn retries_drain_remote_queues() {
        let sched = StealScheduler::new(4).unwrap();
        for _ in 0..8 {
            sched.add(Job::new(Noop), 2);
        }
        let mut taken = 0;
        while sched.more(None) {
            if sched.get(0).is_some() {
                taken += 1;
            }
        }
        assert_eq!(taken, 8);
    }

    #[test]
    fn external_jobs_land_on_worker_zero() {
        let sched = StealScheduler::new(2).unwrap();
        sched.add(Job::new(Noop), 2);
        assert_eq!(sched.core.queues[0].len(), 1);
    }

    #[test]
    fn locality_segments_cover_all_workers() {
        // 8 workers in 2 clusters, in-cluster steals 4x likelier.
        let sched = LocalityStealScheduler::new(8, 2, 4.0).unwrap();
        // Worker 5 lives in the second cluster.
        assert_eq!(sched.victim_for(5, 0.0), 0);
        let before_own = sched.small * 4.0;
        assert_eq!(sched.victim_for(5, before_own - f64::EPSILON), 3);
        assert_eq!(sched.victim_for(5, before_own), 4);
        let through_own = before_own + sched.large * 4.0;
        assert!(through_own > 0.9); // own cluster soaks up most of the mass
        assert_eq!(sched.victim_for(5, through_own - 0.001), 7);
        assert_eq!(sched.victim_for(5, 0.999_999), 7);
    }

    #[test]
    fn locality_mass_sums_to_one() {
        let sched = LocalityStealScheduler::new(6, 3, 2.0).unwrap();
        let total = sched.large * 2.0 + sched.small * 4.0;
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn uneven_clusters_rejected() {
        assert!(matches!(
            LocalityStealScheduler::new(8, 3, 2.0),
            Err(ConfigError::UnevenClusters { .. })
        ));
    }
}
