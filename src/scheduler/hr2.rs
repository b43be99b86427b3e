//! Space-bounded scheduling with per-cluster buckets and cluster locks.
//!
//! Every cluster of the hierarchy carries size-classified queues
//! ([`Buckets`]) and an occupancy counter. A job's task is *pinned* to the
//! smallest cluster whose remaining capacity admits its footprint; from then
//! on the job and everything it forks stay below that cluster. Workers climb
//! from their leaf toward the root looking for queued jobs, and dispatch is
//! blocked below any cluster already holding more than `1 - MU` of its
//! capacity, which is what bounds the space a subtree can touch.
//!
//! Placement decisions take the affected clusters' mutexes leaf-to-root;
//! occupancy is adjusted through atomics so finished strands release space
//! without locking.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::job::Job;
use crate::scheduler::queues::{BucketKind, Buckets};
use crate::scheduler::tree::{ClusterId, ClusterTree, ClusterUsage, LockLedger, NodeSpec, Topology};
use crate::scheduler::{check_worker_id, ConfigError, Scheduler, MU, SIGMA};

struct BucketCell {
    gate: Mutex<()>,
    occupied: AtomicU64,
    /// `None` at leaves, which hold no queued work.
    buckets: Option<Buckets>,
}

pub struct BucketScheduler {
    tree: ClusterTree<BucketCell>,
    pending: AtomicUsize,
}

impl BucketScheduler {
    pub fn new(
        num_workers: usize,
        topology: &Topology,
        kind: BucketKind,
    ) -> Result<Self, ConfigError> {
        if num_workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        let levels = topology.num_levels();
        let tree = ClusterTree::build(topology, num_workers, |spec: &NodeSpec| BucketCell {
            gate: Mutex::new(()),
            occupied: AtomicU64::new(0),
            buckets: (!spec.is_leaf).then(|| {
                Buckets::new(
                    kind,
                    levels - spec.level,
                    spec.num_children,
                    spec.block_size,
                    &topology.capacities[spec.level..],
                    SIGMA,
                )
            }),
        })?;
        tracing::debug!(
            workers = num_workers,
            levels,
            ?kind,
            "bucket scheduler ready"
        );
        Ok(BucketScheduler { tree, pending: AtomicUsize::new(0) })
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

    fn occupied(&self, id: ClusterId) -> u64 {
        self.tree.node(id).payload.occupied.load(Ordering::Acquire)
    }

    /// Dispatch below `id` stops once occupancy passes `(1 - MU)` of
    /// capacity; the slack left over absorbs the strands of jobs pinned
    /// higher up.
    fn saturated(&self, id: ClusterId) -> bool {
        self.occupied(id) as f64 > (1.0 - MU) * self.tree.node(id).capacity as f64
    }

    /// Locks `id` into the ledger. Clusters with fewer than two children
    /// have no siblings to race and are not locked at all.
    fn lock<'t>(&'t self, ledger: &mut LockLedger<'t, ()>, id: ClusterId) {
        let node = self.tree.node(id);
        if node.children.len() > 1 {
            ledger.acquire(
                &self.tree,
                id,
                node.payload.gate.lock().expect("cluster mutex poisoned"),
            );
        }
    }

    fn task_size(&self, job: &Job, at: ClusterId) -> u64 {
        job.size(self.tree.node(at).block_size)
            .expect("space-bounded policies require jobs with a task size")
    }

    fn strand_size(&self, job: &Job, at: ClusterId) -> u64 {
        job.strand_size(self.tree.node(at).block_size)
            .expect("space-bounded policies require jobs with a strand size")
    }

    /// Capped contribution of one running strand to `at`'s occupancy.
    fn strand_charge(&self, job: &Job, at: ClusterId) -> u64 {
        let cap = (MU * self.tree.node(at).capacity as f64) as u64;
        self.strand_size(job, at).min(cap)
    }

    fn pin_to(&self, job: &mut Job, at: ClusterId) {
        debug_assert!(self.occupied(at) <= self.tree.node(at).capacity);
        job.set_pin(Some(at));
    }

    /// Tries to place a job popped from bucket `bucket_level` of the
    /// cluster `height` levels above worker `thread_id`'s leaf. On success
    /// the job is pinned (if it was not already) and all occupancy charges
    /// are applied; on failure nothing is charged and the caller puts the
    /// job back.
    fn fit(&self, job: &mut Job, thread_id: usize, height: usize, bucket_level: usize) -> bool {
        let leaf = self.tree.leaf_for(thread_id);
        let mut ledger = LockLedger::new();
        let mut cur = leaf;
        for _ in 0..height - bucket_level {
            self.lock(&mut ledger, cur);
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
            self.lock(&mut ledger, target);
            let node = self.tree.node(target);
            if task > node.capacity.saturating_sub(self.occupied(target)) {
                return false;
            }
            self.pin_to(job, target);
            debug_assert!(job.is_maximal());
            node.payload.occupied.fetch_add(task, Ordering::AcqRel);
            tracing::trace!(job = job.id(), cluster = ?target, task, "pinned task");
        } else {
            debug_assert_eq!(job.pin(), Some(target));
        }

        for id in self.tree.path_up(leaf) {
            if id == target {
                break;
            }
            let node = self.tree.node(id);
            debug_assert!(node.children.len() <= 1 || ledger.holds(id));
            debug_assert!(!self.saturated(id));
            node.payload
                .occupied
                .fetch_add(self.strand_charge(job, id), Ordering::AcqRel);
        }
        true
    }
}

impl Scheduler for BucketScheduler {
    fn num_workers(&self) -> usize {
        self.tree.num_leaves()
    }

    fn add(&self, mut job: Job, thread_id: usize) {
        let workers = self.num_workers();
        check_worker_id(thread_id, workers, true);
        self.pending.fetch_add(1, Ordering::SeqCst);

        let root = self.tree.root();
        if thread_id == workers {
            // External submission: pin at the root under its gate.
            let node = self.tree.node(root);
            let _gate = node.payload.gate.lock().expect("cluster mutex poisoned");
            self.pin_to(&mut job, root);
            node.payload
                .occupied
                .fetch_add(self.task_size(&job, root), Ordering::AcqRel);
            node.payload
                .buckets
                .as_ref()
                .expect("root always has buckets")
                .add(job, 0);
            return;
        }

        if job.pin().is_none() {
            // First sighting of this task on a worker: claim root space
            // while holding the whole path below it.
            let mut ledger = LockLedger::new();
            let mut cur = self.tree.leaf_for(thread_id);
            while let Some(parent) = self.tree.parent(cur) {
                self.lock(&mut ledger, cur);
                cur = parent;
            }
            self.pin_to(&mut job, root);
            self.tree
                .node(root)
                .payload
                .occupied
                .fetch_add(self.task_size(&job, root), Ordering::AcqRel);
        }

        let mut child = 0;
        let mut cur = self.tree.leaf_for(thread_id);
        loop {
            if job.pin() == Some(cur) {
                self.tree
                    .node(cur)
                    .payload
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
                .tree
                .node(cur)
                .payload
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
            // A saturated cluster blocks this worker from everything above.
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
            let node = self.tree.node(cur);
            node.payload
                .occupied
                .fetch_sub(self.strand_charge(job, cur), Ordering::AcqRel);
            cur = self
                .tree
                .parent(cur)
                .expect("pinned cluster not above the finishing worker");
        }
        if deactivate && job.is_maximal() {
            let mut ledger = LockLedger::new();
            self.lock(&mut ledger, pin);
            let task = self.task_size(job, pin);
            self.tree
                .node(pin)
                .payload
                .occupied
                .fetch_sub(task, Ordering::AcqRel);
            tracing::trace!(job = job.id(), cluster = ?pin, task, "released task");
        }
        if job.parent_fork().is_none() && deactivate {
            tracing::debug!(worker = thread_id, job = job.id(), "root task finished");
        }
    }

    fn more(&self, _thread_id: Option<usize>) -> bool {
        self.pending.load(Ordering::SeqCst) > 0
    }
}
