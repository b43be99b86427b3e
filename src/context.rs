//! Context handed to a running task.
//!
//! The context is a task's only view of the runtime. It records the fork or
//! join the task requests; the worker applies the request after the task
//! body returns, so scheduler state is never re-entered from user code.

use crate::job::Job;

/// What a task asked the runtime to do. Applied by the executing worker
/// once the task body has returned.
pub(crate) enum Outcome {
    Fork {
        children: Vec<Job>,
        continuation: Box<Job>,
    },
    Join,
}

/// Capabilities available to a task while it is running.
///
/// Every task must call exactly one of [`fork`](Context::fork) (or a
/// convenience wrapper) or [`join`](Context::join) before returning.
/// Calling two, or returning without calling either, is a fatal protocol
/// error.
pub struct Context<'a> {
    job_id: u64,
    strand_id: Option<u64>,
    worker_id: usize,
    outcome: Option<Outcome>,
    _marker: std::marker::PhantomData<&'a ()>,
}

impl<'a> Context<'a> {
    pub(crate) fn new(job_id: u64, strand_id: Option<u64>, worker_id: usize) -> Self {
        Context {
            job_id,
            strand_id,
            worker_id,
            outcome: None,
            _marker: std::marker::PhantomData,
        }
    }

    /// Id of the job being executed.
    pub fn job_id(&self) -> u64 {
        self.job_id
    }

    /// Strand id of the job being executed, if it was spawned by a fork.
    pub fn strand_id(&self) -> Option<u64> {
        self.strand_id
    }

    /// Index of the worker running this task. External submissions never
    /// see this context, so the value is always a real worker index.
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Forks into `children` plus a `continuation` that runs after every
    /// child has joined.
    ///
    /// The current job is reported done (without deactivating its strand),
    /// the children are enqueued on the calling worker, and the continuation
    /// is held by the new fork until the last child joins.
    pub fn fork(&mut self, children: Vec<Job>, continuation: Job) {
        assert!(
            !children.is_empty(),
            "fork requires at least one child (job {})",
            self.job_id
        );
        self.record(Outcome::Fork {
            children,
            continuation: Box::new(continuation),
        });
    }

    /// Forks into exactly two children plus a continuation.
    pub fn binary_fork(&mut self, left: Job, right: Job, continuation: Job) {
        self.fork(vec![left, right], continuation);
    }

    /// Forks into one child plus a continuation.
    pub fn unary_fork(&mut self, child: Job, continuation: Job) {
        self.fork(vec![child], continuation);
    }

    /// Marks this job complete. The last joining child of a fork makes the
    /// fork's continuation runnable; a join with no owning fork signals
    /// whole-program completion.
    pub fn join(&mut self) {
        self.record(Outcome::Join);
    }

    fn record(&mut self, outcome: Outcome) {
        assert!(
            self.outcome.is_none(),
            "job {} forked or joined twice in one run",
            self.job_id
        );
        self.outcome = Some(outcome);
    }

    pub(crate) fn into_outcome(self, job_id: u64) -> Outcome {
        match self.outcome {
            Some(outcome) => outcome,
            None => panic!("job {job_id} finished without forking or joining"),
        }
    }
}
