//! Worker threads driving a scheduler.
//!
//! Each worker owns one scheduler slot and loops: ask for a job, run it,
//! then apply whatever the job recorded. A fork reports the parent done
//! without deactivating its strand, wires children and continuation
//! together through [`Fork::spawn`] and hands the children back to the
//! scheduler. A join deactivates the strand and, on the last join of a
//! fork, makes the parked continuation runnable again. A join with no
//! owning fork is the end of the whole computation.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::context::Outcome;
use crate::fork::Fork;
use crate::job::Job;
use crate::scheduler::Scheduler;
use crate::PinningStrategy;

/// State shared between the pool front end and its workers.
pub(crate) struct Shared {
    pub(crate) scheduler: Arc<dyn Scheduler>,
    pub(crate) shutdown: AtomicBool,
    /// Workers currently parked with nothing to run.
    pub(crate) idle: AtomicUsize,
    #[cfg(feature = "metrics")]
    pub(crate) metrics: crate::metrics::Metrics,
}

impl Shared {
    pub(crate) fn new(scheduler: Arc<dyn Scheduler>) -> Arc<Self> {
        Arc::new(Shared {
            scheduler,
            shutdown: AtomicBool::new(false),
            idle: AtomicUsize::new(0),
            #[cfg(feature = "metrics")]
            metrics: crate::metrics::Metrics::new(),
        })
    }
}

/// A worker thread bound to one scheduler slot.
pub(crate) struct Worker {
    id: usize,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Creates and starts a new worker thread.
    pub(crate) fn new(id: usize, shared: Arc<Shared>, pinning: PinningStrategy) -> Self {
        let handle = thread::spawn(move || {
            pin_current(id, pinning);
            run_loop(id, shared);
        });

        Worker {
            id,
            handle: Some(handle),
        }
    }

    /// Returns the worker's ID.
    pub(crate) fn id(&self) -> usize {
        self.id
    }

    /// Waits for the worker thread to finish.
    pub(crate) fn join(mut self) -> thread::Result<()> {
        if let Some(handle) = self.handle.take() {
            handle.join()
        } else {
            Ok(())
        }
    }
}

/// Pins the calling thread to the core chosen by `pinning`.
fn pin_current(id: usize, pinning: PinningStrategy) {
    let index = match pinning {
        PinningStrategy::None => return,
        PinningStrategy::Linear => id,
        // Even-numbered logical processors only, so two workers never share
        // a physical core on two-way SMT machines.
        PinningStrategy::AvoidSMT => id * 2,
        PinningStrategy::Custom(map) => match map.get(id) {
            Some(&core) => core,
            None => return,
        },
    };
    if let Some(core_ids) = core_affinity::get_core_ids() {
        if index < core_ids.len() {
            core_affinity::set_for_current(core_ids[index]);
        }
    }
}

/// Main execution loop for a worker thread.
///
/// The idle count must cover every instant between taking a job and
/// finishing its bookkeeping, so a worker leaves the idle state before it
/// calls `get`, not after.
fn run_loop(id: usize, shared: Arc<Shared>) {
    let mut resting = false;
    loop {
        if shared.shutdown.load(Ordering::Relaxed) {
            break;
        }

        if shared.scheduler.more(Some(id)) {
            if resting {
                shared.idle.fetch_sub(1, Ordering::SeqCst);
                resting = false;
            }
            match shared.scheduler.get(id) {
                Some(job) => execute(job, id, &shared),
                // Work exists but this worker cannot take it right now:
                // another worker won the race, or admission is out of space.
                None => thread::yield_now(),
            }
            continue;
        }

        if !resting {
            shared.idle.fetch_add(1, Ordering::SeqCst);
            resting = true;
        }
        // No work available, yield to prevent busy-waiting
        thread::yield_now();
    }
}

/// Runs one job and applies the outcome it recorded.
pub(crate) fn execute(mut job: Job, worker_id: usize, shared: &Shared) {
    let scheduler: &dyn Scheduler = &*shared.scheduler;
    match job.run(worker_id) {
        Outcome::Fork {
            children,
            continuation,
        } => {
            // The forking job's space is released before its children are
            // added; the strand itself stays active.
            scheduler.done(&job, worker_id, false);
            let children = Fork::spawn(&job, children, continuation);
            #[cfg(feature = "metrics")]
            {
                shared.metrics.forks.fetch_add(1, Ordering::Relaxed);
                shared
                    .metrics
                    .children_spawned
                    .fetch_add(children.len() as u64, Ordering::Relaxed);
            }
            scheduler.add_multiple(children, worker_id);
        }
        Outcome::Join => {
            scheduler.done(&job, worker_id, true);
            #[cfg(feature = "metrics")]
            shared.metrics.joins.fetch_add(1, Ordering::Relaxed);
            match job.take_parent_fork() {
                Some(fork) => {
                    if let Some(continuation) = fork.join() {
                        scheduler.add(*continuation, worker_id);
                    }
                }
                None => {
                    tracing::debug!(
                        worker = worker_id,
                        job = job.id(),
                        "root strand joined, computation complete"
                    );
                }
            }
        }
    }
    if let Some(handle) = job.take_handle() {
        handle.complete();
    }
    #[cfg(feature = "metrics")]
    shared.metrics.jobs_completed.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::job::Task;
    use crate::scheduler::central::CentralScheduler;

    struct Leaf(Arc<AtomicUsize>);

    impl Task for Leaf {
        fn run(&mut self, ctx: &mut Context<'_>) {
            self.0.fetch_add(1, Ordering::SeqCst);
            ctx.join();
        }
    }

    struct Tree {
        depth: u32,
        hits: Arc<AtomicUsize>,
    }

    impl Task for Tree {
        fn run(&mut self, ctx: &mut Context<'_>) {
            if self.depth == 0 {
                self.hits.fetch_add(1, Ordering::SeqCst);
                ctx.join();
            } else {
                let down = self.depth - 1;
                ctx.binary_fork(
                    Job::new(Tree {
                        depth: down,
                        hits: Arc::clone(&self.hits),
                    }),
                    Job::new(Tree {
                        depth: down,
                        hits: Arc::clone(&self.hits),
                    }),
                    Job::new(Leaf(Arc::clone(&self.hits))),
                );
            }
        }
    }

    /// Runs everything the scheduler holds on worker 0, single-threaded.
    fn drain(shared: &Shared) -> usize {
        let mut ran = 0;
        while shared.scheduler.more(Some(0)) {
            let job = shared
                .scheduler
                .get(0)
                .expect("single-threaded drain never races");
            execute(job, 0, shared);
            ran += 1;
        }
        ran
    }

    fn harness() -> (Arc<Shared>, Arc<AtomicUsize>) {
        let scheduler = Arc::new(CentralScheduler::new(1).unwrap());
        (Shared::new(scheduler), Arc::new(AtomicUsize::new(0)))
    }

    #[test]
    fn fork_runs_children_then_continuation() {
        let (shared, hits) = harness();

        shared.scheduler.add(
            Job::new(Tree {
                depth: 1,
                hits: Arc::clone(&hits),
            }),
            1,
        );
        let ran = drain(&shared);

        // The splitter, two leaves, and the continuation.
        assert_eq!(ran, 4);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(!shared.scheduler.more(None));
    }

    #[test]
    fn nested_forks_drain_to_completion() {
        let (shared, hits) = harness();

        shared.scheduler.add(
            Job::new(Tree {
                depth: 3,
                hits: Arc::clone(&hits),
            }),
            1,
        );
        let ran = drain(&shared);

        // 7 inner forks, 8 depth-zero leaves, 7 continuations.
        assert_eq!(ran, 22);
        assert_eq!(hits.load(Ordering::SeqCst), 15);
    }

    #[test]
    fn handles_complete_when_the_job_itself_runs() {
        let (shared, hits) = harness();

        let mut job = Job::new(Tree {
            depth: 1,
            hits: Arc::clone(&hits),
        });
        let handle = job.handle();
        shared.scheduler.add(job, 1);
        assert!(!handle.is_complete());

        let job = shared.scheduler.get(0).unwrap();
        execute(job, 0, &shared);

        // The submitted job has run (and forked); its children are still
        // queued, so the computation as a whole is not finished.
        assert!(handle.is_complete());
        assert!(shared.scheduler.more(None));
    }
}
