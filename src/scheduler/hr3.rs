//! Space-bounded scheduling with lock-free occupancy reservations.
//!
//! Same placement rules as [`BucketScheduler`](super::hr2::BucketScheduler),
//! but admission never takes a cluster mutex: each cluster's occupancy is a
//! single atomic, charged with compare-and-swap loops. A dispatch first
//! claims the capped strand share of every cluster between the worker's
//! leaf and the target, then claims the task footprint at the target
//! itself; if any claim fails the ones already made are rolled back and the
//! job goes back to its bucket. Two workers can therefore race for the last
//! bytes of a cluster and both lose nothing worse than a retry.
//!
//! The top bucket of each cluster is sharded per child; lower buckets see
//! little contention and stay plain.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::job::Job;
use crate::scheduler::queues::{BucketKind, Buckets};
use crate::scheduler::tree::{ClusterId, ClusterTree, ClusterUsage, NodeSpec, Topology};
use crate::scheduler::{check_worker_id, ConfigError, Scheduler, MU, SIGMA};

struct ReserveCell {
    occupied: AtomicU64,
    /// `(1 - MU)` of capacity; occupancy beyond this blocks dispatch below.
    maxocc: u64,
    buckets: Option<Buckets>,
}

pub struct ReserveScheduler {
    tree: ClusterTree<ReserveCell>,
    pending: AtomicUsize,
}

impl ReserveScheduler {
    pub fn new(num_workers: usize, topology: &Topology) -> Result<Self, ConfigError> {
        if num_workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        let levels = topology.num_levels();
        let tree = ClusterTree::build(topology, num_workers, |spec: &NodeSpec| ReserveCell {
            occupied: AtomicU64::new(0),
            maxocc: ((1.0 - MU) * spec.capacity as f64) as u64,
            buckets: (!spec.is_leaf).then(|| {
                Buckets::new(
                    BucketKind::TopSharded,
                    levels - spec.level,
                    spec.num_children,
                    spec.block_size,
                    &topology.capacities[spec.level..],
                    SIGMA,
                )
            }),
        })?;
        tracing::debug!(workers = num_workers, levels, "reserve scheduler ready");
        Ok(ReserveScheduler {
            tree,
            pending: AtomicUsize::new(0),
        })
    }

    /// Occupancy snapshot of every cluster, root first.
    pub fn occupancies(&self) -> Vec<ClusterUsage> {
        self.tree
            .iter()
            .map(|(cluster, node)| ClusterUsage {
                cluster,
                level: node.level,
                capacity: node.capacity,
                occupied: node.payload.occupied.load(Ordering::Acquire),
            })
            .collect()
    }

    fn cell(&self, id: ClusterId) -> &ReserveCell {
        &self.tree.node(id).payload
    }

    fn occupied(&self, id: ClusterId) -> u64 {
        self.cell(id).occupied.load(Ordering::Acquire)
    }

    fn saturated(&self, id: ClusterId) -> bool {
        self.occupied(id) > self.cell(id).maxocc
    }

    fn task_size(&self, job: &Job, at: ClusterId) -> u64 {
        job.size(self.tree.node(at).block_size)
            .expect("space-bounded policies require jobs with a task size")
    }

    fn strand_charge(&self, job: &Job, at: ClusterId) -> u64 {
        let node = self.tree.node(at);
        let cap = (MU * node.capacity as f64) as u64;
        job.strand_size(node.block_size)
            .expect("space-bounded policies require jobs with a strand size")
            .min(cap)
    }

    fn reserve_always(&self, id: ClusterId, bytes: u64) {
        self.cell(id).occupied.fetch_add(bytes, Ordering::AcqRel);
    }

    fn release(&self, id: ClusterId, bytes: u64) {
        self.cell(id).occupied.fetch_sub(bytes, Ordering::AcqRel);
    }

    /// Claims a strand share at a pass-through cluster unless it is already
    /// past its dispatch threshold.
    fn try_charge_strand(&self, id: ClusterId, bytes: u64) -> bool {
        let cell = self.cell(id);
        let mut occ = cell.occupied.load(Ordering::Acquire);
        loop {
            if occ > cell.maxocc {
                return false;
            }
            match cell.occupied.compare_exchange_weak(
                occ,
                occ + bytes,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(cur) => occ = cur,
            }
        }
    }

    /// Claims a task footprint at its pin target if the remaining capacity
    /// admits it.
    fn try_charge_task(&self, id: ClusterId, bytes: u64) -> bool {
        let cell = self.cell(id);
        let capacity = self.tree.node(id).capacity;
        let mut occ = cell.occupied.load(Ordering::Acquire);
        loop {
            if bytes > capacity.saturating_sub(occ) {
                return false;
            }
            match cell.occupied.compare_exchange_weak(
                occ,
                occ + bytes,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(cur) => occ = cur,
            }
        }
    }

    /// Rolls back strand claims from `leaf` up to but not including `upto`.
    fn release_strands(&self, job: &Job, leaf: ClusterId, upto: ClusterId) {
        let mut cur = leaf;
        while cur != upto {
            self.release(cur, self.strand_charge(job, cur));
            cur = self.tree.parent(cur).expect("rollback walked past the root");
        }
    }

    fn pin_to(&self, job: &mut Job, at: ClusterId) {
        debug_assert!(self.occupied(at) <= self.tree.node(at).capacity);
        job.set_pin(Some(at));
    }

    fn fit(&self, job: &mut Job, thread_id: usize, height: usize, bucket_level: usize) -> bool {
        let leaf = self.tree.leaf_for(thread_id);

        // Dry run: cheap saturation probe before touching any counter.
        let mut cur = leaf;
        for _ in 0..height - bucket_level {
            if self.saturated(cur) {
                return false;
            }
            cur = self.tree.parent(cur).expect("fit walked past the root");
        }
        let target = cur;
        let task = self.task_size(job, target);
        debug_assert!(
            task as f64 <= SIGMA * self.tree.node(target).capacity as f64
                || target == self.tree.root(),
            "task banded below the cluster that can hold it"
        );

        if bucket_level > 0 {
            let mut cur = leaf;
            while cur != target {
                if !self.try_charge_strand(cur, self.strand_charge(job, cur)) {
                    self.release_strands(job, leaf, cur);
                    return false;
                }
                cur = self.tree.parent(cur).expect("fit walked past the root");
            }
            if !self.try_charge_task(target, task) {
                self.release_strands(job, leaf, target);
                return false;
            }
            self.pin_to(job, target);
            debug_assert!(job.is_maximal());
            tracing::trace!(job = job.id(), cluster = ?target, task, "pinned task");
        } else {
            debug_assert_eq!(job.pin(), Some(target));
            // The task space was claimed when the job was pinned; only the
            // strand rides along now.
            let mut cur = leaf;
            while cur != target {
                self.reserve_always(cur, self.strand_charge(job, cur));
                cur = self.tree.parent(cur).expect("fit walked past the root");
            }
        }
        true
    }
}

impl Scheduler for ReserveScheduler {
    fn num_workers(&self) -> usize {
        self.tree.num_leaves()
    }

    fn add(&self, mut job: Job, thread_id: usize) {
        let workers = self.num_workers();
        check_worker_id(thread_id, workers, true);
        self.pending.fetch_add(1, Ordering::SeqCst);

        let root = self.tree.root();
        if thread_id == workers {
            self.pin_to(&mut job, root);
            self.reserve_always(root, self.task_size(&job, root));
            self.cell(root)
                .buckets
                .as_ref()
                .expect("root always has buckets")
                .add(job, 0);
            return;
        }

        if job.pin().is_none() {
            self.pin_to(&mut job, root);
            self.reserve_always(root, self.task_size(&job, root));
        }

        let mut child = 0;
        let mut cur = self.tree.leaf_for(thread_id);
        loop {
            if job.pin() == Some(cur) {
                self.cell(cur)
                    .buckets
                    .as_ref()
                    .expect("jobs never pin to a leaf")
                    .add(job, child);
                return;
            }
            child = self.tree.node(cur).sibling_index;
            cur = self
                .tree
                .parent(cur)
                .expect("job pinned off the submitting worker's path");
        }
    }

    fn get(&self, thread_id: usize) -> Option<Job> {
        check_worker_id(thread_id, self.num_workers(), false);
        let leaf = self.tree.leaf_for(thread_id);
        let mut child = self.tree.node(leaf).sibling_index;
        let mut height = 1;
        let mut next = self.tree.parent(leaf);
        while let Some(cur) = next {
            let buckets = self
                .cell(cur)
                .buckets
                .as_ref()
                .expect("internal cluster without buckets");
            let mut min_level = 0;
            while let Some((mut job, level)) = buckets.get(min_level, child) {
                if self.fit(&mut job, thread_id, height, level) {
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                    return Some(job);
                }
                buckets.put_back(job, level, child);
                min_level = level + 1;
            }
            if self.saturated(cur) {
                return None;
            }
            child = self.tree.node(cur).sibling_index;
            height += 1;
            next = self.tree.parent(cur);
        }
        None
    }

    fn done(&self, job: &Job, thread_id: usize, deactivate: bool) {
        check_worker_id(thread_id, self.num_workers(), false);
        let pin = job.pin().expect("finished job was never pinned");
        let mut cur = self.tree.leaf_for(thread_id);
        while cur != pin {
            self.release(cur, self.strand_charge(job, cur));
            cur = self
                .tree
                .parent(cur)
                .expect("pinned cluster not above the finishing worker");
        }
        if deactivate && job.is_maximal() {
            self.release(pin, self.task_size(job, pin));
            tracing::trace!(job = job.id(), cluster = ?pin, "released task");
        }
        if job.parent_fork().is_none() && deactivate {
            tracing::debug!(worker = thread_id, job = job.id(), "root task finished");
        }
    }

    fn more(&self, _thread_id: Option<usize>) -> bool {
        self.pending.load(Ordering::SeqCst) > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{round_up, HierarchicalTask, SizedTask, Task};
    use crate::Context;

    struct Footprint {
        task: u64,
        strand: u64,
    }

    impl Task for Footprint {
        fn run(&mut self, ctx: &mut Context<'_>) {
            ctx.join();
        }
    }

    impl SizedTask for Footprint {
        fn size(&self, block_size: u64) -> u64 {
            round_up(self.task, block_size)
        }
    }

    impl HierarchicalTask for Footprint {
        fn strand_size(&self, block_size: u64) -> u64 {
            round_up(self.strand, block_size)
        }
    }

    fn job(task: u64, strand: u64) -> Job {
        Job::hierarchical(Footprint { task, strand })
    }

    fn sched(workers: usize, capacity: u64) -> ReserveScheduler {
        let topo = Topology::two_level(workers, capacity, 1);
        ReserveScheduler::new(workers, &topo).unwrap()
    }

    fn mid_of(s: &ReserveScheduler, worker: usize) -> ClusterId {
        s.tree.parent(s.tree.leaf_for(worker)).unwrap()
    }

    #[test]
    fn reservation_claims_and_releases() {
        let s = sched(2, 1000);
        s.add(job(400, 4), 2);
        let got = s.get(0).expect("task fits an empty cluster");
        let mid = mid_of(&s, 0);
        assert_eq!(got.pin(), Some(mid));
        assert_eq!(s.occupied(mid), 400);
        s.done(&got, 0, true);
        assert_eq!(s.occupied(mid), 0);
    }

    #[test]
    fn failed_fit_rolls_back_every_charge() {
        let s = sched(2, 1000);
        s.add(job(450, 8), 2);
        s.add(job(450, 8), 2);
        s.add(job(450, 8), 2);
        let _a = s.get(0).unwrap();
        let _b = s.get(0).unwrap();
        let mid = mid_of(&s, 0);
        assert_eq!(s.occupied(mid), 900);
        // Third task: strand claims succeed below the target, the task
        // claim fails, and everything is rolled back.
        assert!(s.get(0).is_none());
        assert_eq!(s.occupied(mid), 900);
        assert!(s.more(None));
    }

    #[test]
    fn saturated_cluster_blocks_only_its_own_workers() {
        let s = sched(2, 1000);
        s.add(job(450, 1), 2);
        s.add(job(450, 1), 2);
        let (a, b) = (s.get(0).unwrap(), s.get(0).unwrap());
        assert_eq!(s.occupied(mid_of(&s, 0)), 900);
        s.add(job(100, 1), 2);
        // Worker 0's cluster is past (1 - MU) * capacity: its climb stops.
        assert!(s.get(0).is_none());
        // Worker 1's cluster is untouched, the queued job dispatches there.
        let c = s.get(1).expect("sibling cluster has room");
        assert_eq!(c.pin(), Some(mid_of(&s, 1)));
        s.done(&a, 0, true);
        s.done(&b, 0, true);
        s.done(&c, 1, true);
        assert_eq!(s.occupied(mid_of(&s, 0)), 0);
        assert_eq!(s.occupied(mid_of(&s, 1)), 0);
    }

    #[test]
    fn dispatch_never_exceeds_the_space_bound() {
        let s = sched(2, 1000);
        for _ in 0..10 {
            s.add(job(200, 10), 2);
        }
        let mut running = Vec::new();
        loop {
            let before = running.len();
            for worker in 0..2 {
                if let Some(j) = s.get(worker) {
                    running.push((worker, j));
                }
            }
            if running.len() == before {
                break;
            }
        }
        for usage in s.occupancies() {
            assert!(usage.occupied <= usage.capacity);
        }
        for (worker, j) in &running {
            s.done(j, *worker, true);
        }
        for usage in s.occupancies() {
            if usage.level > 0 {
                assert_eq!(usage.occupied, 0);
            }
        }
    }
}
