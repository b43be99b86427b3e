//! Cross-policy tests: every scheduler must drive the same fork-join
//! computation to completion under a single-threaded, round-robin pump.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::context::Context;
use crate::job::{round_up, HierarchicalTask, Job, SizedTask, Task};
use crate::scheduler::central::CentralScheduler;
use crate::scheduler::hr1::ActiveSetScheduler;
use crate::scheduler::hr2::BucketScheduler;
use crate::scheduler::hr3::ReserveScheduler;
use crate::scheduler::hr4::ShardedBucketScheduler;
use crate::scheduler::local::LocalScheduler;
use crate::scheduler::steal::{LocalityStealScheduler, StealScheduler};
use crate::scheduler::tree::Topology;
use crate::scheduler::{BucketKind, Scheduler};
use crate::worker::{execute, Shared};

/// Divide-and-conquer over a byte range: splits in half until a piece fits
/// `leaf_bytes`, then counts itself. The merge continuation counts too.
struct Block {
    bytes: u64,
    leaf_bytes: u64,
    hits: Arc<AtomicUsize>,
}

impl Task for Block {
    fn run(&mut self, ctx: &mut Context<'_>) {
        if self.bytes <= self.leaf_bytes {
            self.hits.fetch_add(1, Ordering::SeqCst);
            ctx.join();
            return;
        }
        let half = self.bytes / 2;
        ctx.binary_fork(
            Job::hierarchical(Block {
                bytes: half,
                leaf_bytes: self.leaf_bytes,
                hits: Arc::clone(&self.hits),
            }),
            Job::hierarchical(Block {
                bytes: self.bytes - half,
                leaf_bytes: self.leaf_bytes,
                hits: Arc::clone(&self.hits),
            }),
            Job::hierarchical(Merge {
                bytes: self.bytes,
                hits: Arc::clone(&self.hits),
            }),
        );
    }
}

impl SizedTask for Block {
    fn size(&self, block_size: u64) -> u64 {
        round_up(self.bytes, block_size)
    }
}

impl HierarchicalTask for Block {
    fn strand_size(&self, block_size: u64) -> u64 {
        round_up(self.bytes, block_size)
    }
}

struct Merge {
    bytes: u64,
    hits: Arc<AtomicUsize>,
}

impl Task for Merge {
    fn run(&mut self, ctx: &mut Context<'_>) {
        self.hits.fetch_add(1, Ordering::SeqCst);
        ctx.join();
    }
}

impl SizedTask for Merge {
    fn size(&self, block_size: u64) -> u64 {
        round_up(self.bytes, block_size)
    }
}

impl HierarchicalTask for Merge {
    fn strand_size(&self, block_size: u64) -> u64 {
        round_up(self.bytes, block_size)
    }
}

/// 4096 bytes halved down to 512-byte pieces: 7 splits, 8 leaves, 7 merges.
fn computation(hits: &Arc<AtomicUsize>) -> Job {
    Job::hierarchical(Block {
        bytes: 4096,
        leaf_bytes: 512,
        hits: Arc::clone(hits),
    })
}

/// Pumps every worker slot in turn until the scheduler reports no work
/// anywhere. Panics if too many full sweeps in a row make no progress.
fn drain(shared: &Shared, workers: usize) -> usize {
    let mut ran = 0;
    let mut stalled = 0;
    while shared.scheduler.more(None) {
        let mut progressed = false;
        for id in 0..workers {
            if shared.scheduler.more(Some(id)) {
                if let Some(job) = shared.scheduler.get(id) {
                    execute(job, id, shared);
                    ran += 1;
                    progressed = true;
                }
            }
        }
        if progressed {
            stalled = 0;
        } else {
            stalled += 1;
            assert!(stalled < 10_000, "drain stalled with work still pending");
        }
    }
    ran
}

fn run_conformance(scheduler: Arc<dyn Scheduler>) {
    let workers = scheduler.num_workers();
    let shared = Shared::new(scheduler);
    let hits = Arc::new(AtomicUsize::new(0));

    shared.scheduler.add(computation(&hits), workers);
    let ran = drain(&shared, workers);

    assert_eq!(ran, 22);
    assert_eq!(hits.load(Ordering::SeqCst), 15);
    assert!(!shared.scheduler.more(None));
}

fn topology() -> Topology {
    Topology::new(vec![2, 2], vec![0, 8192], vec![64, 64])
}

#[test]
fn centralized_policy_conforms() {
    run_conformance(Arc::new(CentralScheduler::new(4).unwrap()));
}

#[test]
fn local_policy_conforms() {
    run_conformance(Arc::new(LocalScheduler::new(4).unwrap()));
}

#[test]
fn stealing_policy_conforms() {
    run_conformance(Arc::new(StealScheduler::new(4).unwrap()));
}

#[test]
fn locality_stealing_policy_conforms() {
    run_conformance(Arc::new(LocalityStealScheduler::new(4, 2, 1.0).unwrap()));
}

#[test]
fn active_set_policy_conforms() {
    run_conformance(Arc::new(ActiveSetScheduler::new(4, &topology()).unwrap()));
}

#[test]
fn bucket_policy_conforms() {
    run_conformance(Arc::new(
        BucketScheduler::new(4, &topology(), BucketKind::Plain).unwrap(),
    ));
}

#[test]
fn sharded_bucket_policy_conforms() {
    run_conformance(Arc::new(
        ShardedBucketScheduler::new(4, &topology()).unwrap(),
    ));
}

#[test]
fn reservation_policy_conforms() {
    run_conformance(Arc::new(ReserveScheduler::new(4, &topology()).unwrap()));
}

#[test]
fn single_worker_hierarchy_conforms() {
    let topology = Topology::two_level(1, 8192, 64);
    run_conformance(Arc::new(
        BucketScheduler::new(1, &topology, BucketKind::Plain).unwrap(),
    ));
}
