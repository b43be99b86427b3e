//! Space-bounded scheduling through shared active task sets.
//!
//! Every pinned strand owns a [`TaskSet`]: a queue of the jobs it forked,
//! attached to the clusters currently serving it. A worker climbs from its
//! leaf to the lowest attached set, then walks up from the leaf again to
//! decide where the set's head job pins. The first cluster with room adopts
//! a fresh set for the job and advertises it to sibling clusters as
//! `spawned` until enough of them have picked it up, which is how one
//! strand's children spread over exactly the clusters its footprint paid
//! for. Tree surgery happens under cluster mutexes taken leaf to root; a
//! dispatched job charges its full footprint to every cluster between the
//! worker's leaf and the set it came from, and `done` walks the same path
//! backwards.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::job::Job;
use crate::scheduler::tree::{ClusterId, ClusterTree, ClusterUsage, LockLedger, Topology};
use crate::scheduler::{check_worker_id, ConfigError, Scheduler};

/// Queue of one strand's jobs, shared by every cluster serving the strand.
struct TaskSet {
    /// Pin id of the jobs this set holds.
    key: Option<u64>,
    /// How many more clusters may still attach themselves to this set.
    needed: AtomicIsize,
    state: Mutex<SetQueue>,
}

struct SetQueue {
    jobs: VecDeque<Job>,
    complete: bool,
}

impl TaskSet {
    fn new(key: Option<u64>, needed: usize) -> Arc<TaskSet> {
        Arc::new(TaskSet {
            key,
            needed: AtomicIsize::new(needed as isize),
            state: Mutex::new(SetQueue {
                jobs: VecDeque::new(),
                complete: false,
            }),
        })
    }

    fn queue(&self) -> MutexGuard<'_, SetQueue> {
        self.state.lock().expect("task set mutex poisoned")
    }
}

/// Per-cluster state, guarded by the cluster's mutex.
#[derive(Default)]
struct SetCell {
    /// Bytes charged by dispatched jobs running below this cluster.
    occupied: u64,
    /// Set this cluster currently serves.
    active: Option<Arc<TaskSet>>,
    /// Set pinned to one child, waiting for this cluster's other children
    /// to adopt it.
    spawned: Option<Arc<TaskSet>>,
}

/// Number of child clusters a set may spread to: enough `lower`-sized
/// clusters to hold `size` bytes, at most all of them. A zero `lower`
/// means leaves, which always spread to the whole fan-out.
fn allocate(size: u64, lower: u64, fan_out: usize) -> usize {
    if lower == 0 {
        fan_out
    } else {
        fan_out.min(size.div_ceil(lower) as usize)
    }
}

pub struct ActiveSetScheduler {
    tree: ClusterTree<Mutex<SetCell>>,
    pending: AtomicUsize,
}

impl ActiveSetScheduler {
    pub fn new(num_workers: usize, topology: &Topology) -> Result<Self, ConfigError> {
        if num_workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        let tree = ClusterTree::build(topology, num_workers, |_| Mutex::new(SetCell::default()))?;
        tracing::debug!(
            workers = num_workers,
            levels = topology.num_levels(),
            "active-set scheduler ready"
        );
        Ok(ActiveSetScheduler {
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
                occupied: node.payload.lock().expect("cluster mutex poisoned").occupied,
            })
            .collect()
    }

    /// Locks `id` into the ledger. Sets pin to leaves here, so every
    /// cluster on a path is lockable, leaves included.
    fn lock<'t>(&'t self, ledger: &mut LockLedger<'t, SetCell>, id: ClusterId) {
        ledger.acquire(
            &self.tree,
            id,
            self.tree.node(id).payload.lock().expect("cluster mutex poisoned"),
        );
    }

    fn task_size(&self, job: &Job, at: ClusterId) -> u64 {
        job.size(self.tree.node(at).block_size)
            .expect("space-bounded policies require jobs with a task size")
    }

    /// True when a strand pinned above `id` runs through it and its
    /// footprint exceeds what the cluster can hold.
    fn over_occupied(&self, ledger: &LockLedger<'_, SetCell>, id: ClusterId) -> bool {
        let cell = ledger.guard(id).expect("cluster not locked");
        cell.occupied > self.tree.node(id).capacity
    }

    /// Drops `id`'s reference to the set it serves. Caller holds `id`.
    fn detach(&self, ledger: &mut LockLedger<'_, SetCell>, id: ClusterId) {
        let cell = ledger.guard_mut(id).expect("detach without the cluster lock");
        cell.active = None;
    }

    /// Climbs from the worker's leaf, locking every cluster, until one
    /// serves the set the job's pin refers to. Panics if the path has none:
    /// a pinned job can only be resubmitted from under its own set.
    fn find_active_set<'t>(
        &'t self,
        ledger: &mut LockLedger<'t, SetCell>,
        thread_id: usize,
        pin_id: Option<u64>,
    ) -> Arc<TaskSet> {
        let mut cur = Some(self.tree.leaf_for(thread_id));
        while let Some(id) = cur {
            self.lock(ledger, id);
            if let Some(set) = ledger.guard(id).and_then(|cell| cell.active.as_ref()) {
                if set.key == pin_id {
                    return Arc::clone(set);
                }
            }
            cur = self.tree.parent(id);
        }
        panic!("no cluster on the worker's path serves pin {pin_id:?}");
    }

    /// Pops the head job of the set served at `holder`, marks it with the
    /// set's key, and charges its footprint to every cluster from the
    /// worker's leaf up to and including `holder`. The caller holds that
    /// whole path and the set's queue.
    fn dispatch<'t>(
        &'t self,
        ledger: &mut LockLedger<'t, SetCell>,
        thread_id: usize,
        holder: ClusterId,
        set: &TaskSet,
        queue: &mut SetQueue,
    ) -> Job {
        let mut job = queue
            .jobs
            .pop_front()
            .expect("dispatch from an empty task set");
        job.set_pin_id(set.key);
        for id in self.tree.path_up(self.tree.leaf_for(thread_id)) {
            let bytes = self.task_size(&job, id);
            ledger.guard_mut(id).expect("dispatch path not locked").occupied += bytes;
            if id == holder {
                break;
            }
        }
        self.pending.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!(job = job.id(), cluster = ?holder, "dispatched from active set");
        job
    }
}

impl Scheduler for ActiveSetScheduler {
    fn num_workers(&self) -> usize {
        self.tree.num_leaves()
    }

    fn add(&self, mut job: Job, thread_id: usize) {
        let workers = self.num_workers();
        check_worker_id(thread_id, workers, true);
        assert!(
            self.task_size(&job, self.tree.leaf_for(0)) > 0,
            "job reports a zero-byte task; sized tasks occupy at least one block"
        );
        self.pending.fetch_add(1, Ordering::SeqCst);

        let root = self.tree.root();
        if thread_id == workers {
            // External submission: the root adopts a fresh set for it.
            let set = TaskSet::new(job.strand_id(), self.tree.node(root).children.len());
            job.set_pin_id(Some(job.id()));
            set.queue().jobs.push_back(job);
            self.tree
                .node(root)
                .payload
                .lock()
                .expect("cluster mutex poisoned")
                .active = Some(set);
            return;
        }

        let root_empty = self
            .tree
            .node(root)
            .payload
            .lock()
            .expect("cluster mutex poisoned")
            .active
            .is_none();
        if root_empty {
            // Rebuild the root set under the whole path, so no sibling
            // installs a competing one between the check and the write.
            let mut ledger = LockLedger::new();
            for id in self.tree.path_up(self.tree.leaf_for(thread_id)) {
                self.lock(&mut ledger, id);
            }
            let cell = ledger.guard_mut(root).expect("path ends at the root");
            if cell.active.is_none() {
                cell.active = Some(TaskSet::new(
                    job.strand_id(),
                    self.tree.node(root).children.len(),
                ));
                job.set_pin_id(Some(job.id()));
            }
        }

        let mut ledger = LockLedger::new();
        let set = self.find_active_set(&mut ledger, thread_id, job.pin_id());
        set.queue().jobs.push_back(job);
    }

    fn get(&self, thread_id: usize) -> Option<Job> {
        check_worker_id(thread_id, self.num_workers(), false);
        let mut ledger = LockLedger::new();
        let leaf = self.tree.leaf_for(thread_id);
        self.lock(&mut ledger, leaf);

        // A set attached to the leaf is served before anything else.
        let leaf_set = ledger.guard(leaf).expect("leaf just locked").active.clone();
        if let Some(set) = leaf_set {
            let mut queue = set.queue();
            if queue.complete {
                drop(queue);
                self.detach(&mut ledger, leaf);
                return None;
            }
            if queue.jobs.is_empty() {
                return None;
            }
            let job = self.dispatch(&mut ledger, thread_id, leaf, &set, &mut queue);
            return Some(job);
        }

        // Climb to the lowest cluster serving a set.
        let mut prev = leaf;
        let mut above = self.tree.parent(leaf);
        while let Some(cur) = above {
            if self.over_occupied(&ledger, prev) {
                return None;
            }
            self.lock(&mut ledger, cur);
            if self.over_occupied(&ledger, cur) {
                return None;
            }

            let cur_set = ledger.guard(cur).expect("climb holds its locks").active.clone();
            if let Some(mut set) = cur_set {
                let mut holder = cur;
                {
                    let queue = set.queue();
                    if queue.complete {
                        drop(queue);
                        self.detach(&mut ledger, cur);
                        return None;
                    }
                }

                // Adopt a spawned set: this worker's child cluster joins
                // the clusters serving it.
                let spawned = ledger.guard(cur).expect("climb holds its locks").spawned.clone();
                if let Some(adopted) = spawned {
                    ledger.guard_mut(prev).expect("climb holds its locks").active =
                        Some(Arc::clone(&adopted));
                    if adopted.needed.fetch_sub(1, Ordering::SeqCst) == 1 {
                        ledger.guard_mut(cur).expect("climb holds its locks").spawned = None;
                    }
                    debug_assert_eq!(ledger.newest(), Some(cur));
                    ledger.release_newest();
                    set = adopted;
                    holder = prev;
                }

                let mut queue = set.queue();
                if queue.jobs.is_empty() {
                    return None;
                }
                if holder == leaf {
                    let job = self.dispatch(&mut ledger, thread_id, leaf, &set, &mut queue);
                    return Some(job);
                }

                // Walk up from the leaf to the first cluster whose free
                // capacity holds the head job; its child on this path
                // adopts a fresh set for the job.
                let mut d_prev = leaf;
                let mut d_cur = self.tree.parent(leaf);
                while d_prev != holder {
                    let target = d_cur.expect("set holder sits on the worker's path");
                    if ledger.guard(d_prev).expect("descent path not locked").occupied > 0 {
                        // Someone else's footprint lives here; pinning over
                        // it would break the space bound.
                        return None;
                    }
                    let bytes =
                        self.task_size(queue.jobs.front().expect("checked non-empty"), target);
                    let t_node = self.tree.node(target);
                    let free = t_node
                        .capacity
                        .saturating_sub(ledger.guard(target).expect("descent path not locked").occupied);
                    if bytes <= free {
                        assert!(
                            bytes > self.tree.node(d_prev).capacity,
                            "a task that fits a lower cluster would have pinned there"
                        );
                        let key = queue.jobs.front().expect("checked non-empty").strand_id();
                        let fresh = TaskSet::new(
                            key,
                            allocate(bytes, self.tree.node(d_prev).capacity, t_node.children.len()),
                        );
                        let moved = queue.jobs.pop_front().expect("checked non-empty");
                        drop(queue);
                        fresh.queue().jobs.push_back(moved);
                        ledger.guard_mut(target).expect("descent path not locked").occupied += bytes;
                        if fresh.needed.fetch_sub(1, Ordering::SeqCst) > 1 {
                            ledger.guard_mut(target).expect("descent path not locked").spawned =
                                Some(Arc::clone(&fresh));
                        }
                        ledger.guard_mut(d_prev).expect("descent path not locked").active =
                            Some(Arc::clone(&fresh));
                        let mut fresh_queue = fresh.queue();
                        let job =
                            self.dispatch(&mut ledger, thread_id, d_prev, &fresh, &mut fresh_queue);
                        drop(fresh_queue);
                        return Some(job);
                    }
                    d_prev = target;
                    d_cur = self.tree.parent(target);
                }

                // Nothing below holds it: dispatch at the set's own level.
                let job = self.dispatch(&mut ledger, thread_id, holder, &set, &mut queue);
                return Some(job);
            }
            prev = cur;
            above = self.tree.parent(cur);
        }
        None
    }

    fn done(&self, job: &Job, thread_id: usize, deactivate: bool) {
        check_worker_id(thread_id, self.num_workers(), false);
        let mut ledger = LockLedger::new();
        let leaf = self.tree.leaf_for(thread_id);
        self.lock(&mut ledger, leaf);

        // Release the footprint along the path, stopping at the cluster
        // whose set dispatched this job.
        let mut cur = leaf;
        while ledger.guard(cur).expect("walk holds its locks").active.is_none() {
            let parent = self
                .tree
                .parent(cur)
                .expect("a dispatched job's set is on the worker's path");
            self.lock(&mut ledger, parent);
            let bytes = self.task_size(job, cur);
            ledger.guard_mut(cur).expect("walk holds its locks").occupied -= bytes;
            cur = parent;
        }
        let bytes = self.task_size(job, cur);
        let cell = ledger.guard_mut(cur).expect("walk holds its locks");
        cell.occupied -= bytes;
        let set = cell.active.clone().expect("walk stopped at a set");

        // The strand that pinned this set has joined: complete the set and
        // give the space back to the cluster that was charged for it.
        if job.strand_id() == set.key && deactivate {
            let mut queue = set.queue();
            if let Some(parent) = self.tree.parent(cur) {
                self.lock(&mut ledger, parent);
                let parent_bytes = self.task_size(job, parent);
                let pcell = ledger.guard_mut(parent).expect("parent just locked");
                if pcell.spawned.as_ref().is_some_and(|s| Arc::ptr_eq(s, &set)) {
                    pcell.spawned = None;
                }
                pcell.occupied -= parent_bytes;
                debug_assert_eq!(ledger.newest(), Some(parent));
                ledger.release_newest();
            }
            queue.complete = true;
            drop(queue);
            self.detach(&mut ledger, cur);
        }

        // The computation's final join unpins whatever is left at the root.
        if job.parent_fork().is_none() && deactivate {
            let root = self.tree.root();
            if !ledger.holds(root) {
                self.lock(&mut ledger, root);
            }
            let cell = ledger.guard_mut(root).expect("root just locked");
            if cell.active.take().is_some() {
                tracing::debug!(worker = thread_id, job = job.id(), "unpinned the root");
            }
        }
    }

    fn more(&self, _thread_id: Option<usize>) -> bool {
        self.pending.load(Ordering::SeqCst) > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{round_up, SizedTask, Task};
    use crate::Context;

    struct Region(u64);

    impl Task for Region {
        fn run(&mut self, ctx: &mut Context<'_>) {
            ctx.join();
        }
    }

    impl SizedTask for Region {
        fn size(&self, block_size: u64) -> u64 {
            round_up(self.0, block_size)
        }
    }

    fn job(bytes: u64) -> Job {
        Job::sized(Region(bytes))
    }

    /// Root over two clusters of 1000 bytes, two workers each.
    fn sched() -> ActiveSetScheduler {
        let topo = Topology::new(vec![2, 2], vec![0, 1000], vec![1, 1]);
        ActiveSetScheduler::new(4, &topo).unwrap()
    }

    fn occupied_at(s: &ActiveSetScheduler, id: ClusterId) -> u64 {
        s.tree.node(id).payload.lock().unwrap().occupied
    }

    #[test]
    fn allocate_spreads_by_size() {
        assert_eq!(allocate(1500, 0, 4), 4);
        assert_eq!(allocate(1500, 1000, 4), 2);
        assert_eq!(allocate(5000, 1000, 4), 4);
        assert_eq!(allocate(999, 1000, 8), 1);
    }

    #[test]
    fn deactivation_releases_the_whole_pin() {
        let s = sched();
        let leaf0 = s.tree.leaf_for(0);
        let mid0 = s.tree.parent(leaf0).unwrap();
        let root = s.tree.root();

        // 1500 bytes exceed any mid cluster, so the job pins right below
        // the root and its footprint loads the dispatching path.
        s.add(job(1500), 4);
        assert!(s.more(None));
        let a = s.get(0).expect("dispatches at the lowest cluster that fits");
        assert_eq!(a.pin_id(), None);
        assert!(!s.more(None));
        assert_eq!(occupied_at(&s, leaf0), 1500);
        assert_eq!(occupied_at(&s, mid0), 1500);
        assert_eq!(occupied_at(&s, root), 1500);

        // The sibling under the loaded mid cluster is blocked; workers
        // elsewhere find only the drained root set.
        assert!(s.get(1).is_none());
        assert!(s.get(2).is_none());

        s.done(&a, 0, true);
        for usage in s.occupancies() {
            assert_eq!(usage.occupied, 0, "cluster {:?} still charged", usage.cluster);
        }
    }

    #[test]
    fn children_pin_at_leaves_and_spawn_for_siblings() {
        let s = sched();
        let leaf0 = s.tree.leaf_for(0);
        let leaf1 = s.tree.leaf_for(1);
        let mid0 = s.tree.parent(leaf0).unwrap();
        let root = s.tree.root();

        s.add(job(1500), 4);
        let a = s.get(0).expect("root job dispatches");

        // The job forks; `done` without deactivation keeps the set but
        // releases the running footprint, except the pin's own charge.
        s.done(&a, 0, false);
        assert_eq!(occupied_at(&s, leaf0), 0);
        assert_eq!(occupied_at(&s, mid0), 0);
        assert_eq!(occupied_at(&s, root), 1500);

        let mut c1 = job(300);
        let id1 = c1.id();
        c1.set_strand_id(Some(id1));
        c1.set_pin_id(a.pin_id());
        let mut c2 = job(300);
        let id2 = c2.id();
        c2.set_strand_id(Some(id2));
        c2.set_pin_id(a.pin_id());
        s.add(c1, 0);
        s.add(c2, 0);

        let got1 = s.get(1).expect("child fits its own leaf cluster");
        assert_eq!(got1.id(), id1);
        assert_eq!(got1.pin_id(), Some(id1));
        assert_eq!(occupied_at(&s, leaf1), 300);
        assert_eq!(occupied_at(&s, mid0), 300);

        // Worker 0 adopts the spawned set instead of taking the queued
        // child, and stays parked on it while it is empty.
        assert!(s.get(0).is_none());
        assert!(s.get(0).is_none());

        s.done(&got1, 1, true);
        assert_eq!(occupied_at(&s, leaf1), 0);
        assert_eq!(occupied_at(&s, mid0), 0);

        // One get clears the completed set off the leaf, the next pins the
        // remaining child there.
        assert!(s.get(0).is_none());
        let got2 = s.get(0).expect("second child dispatches after the set clears");
        assert_eq!(got2.id(), id2);
        assert_eq!(got2.pin_id(), Some(id2));
        assert_eq!(occupied_at(&s, leaf0), 300);
        assert_eq!(occupied_at(&s, mid0), 300);

        s.done(&got2, 0, true);
        assert_eq!(occupied_at(&s, leaf0), 0);
        assert_eq!(occupied_at(&s, mid0), 0);
        assert!(!s.more(None));
    }

    #[test]
    fn worker_add_rebuilds_an_empty_root() {
        let s = sched();
        let leaf0 = s.tree.leaf_for(0);
        let mid0 = s.tree.parent(leaf0).unwrap();

        let mut c = job(300);
        let id = c.id();
        c.set_strand_id(Some(id));
        s.add(c, 0);
        assert!(s.more(None));

        let got = s.get(0).expect("the worker finds its own submission");
        assert_eq!(got.pin_id(), Some(id));
        assert_eq!(occupied_at(&s, leaf0), 300);
        assert_eq!(occupied_at(&s, mid0), 300);
        assert_eq!(occupied_at(&s, s.tree.root()), 0);

        s.done(&got, 0, true);
        for usage in s.occupancies() {
            assert_eq!(usage.occupied, 0);
        }
    }

    #[test]
    #[should_panic(expected = "zero-byte task")]
    fn zero_byte_tasks_are_rejected() {
        let s = sched();
        s.add(job(0), 4);
    }
}
