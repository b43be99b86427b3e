//! Job definitions and size introspection.
//!
//! A [`Job`] is a unit of work owned by the runtime: by the caller until it
//! is submitted, by a scheduler queue while it is pending, and by the worker
//! executing it until it completes. Work is supplied through one of three
//! capability traits — [`Task`], [`SizedTask`], [`HierarchicalTask`] — and
//! the job records which capability it carries, so schedulers that need size
//! metadata can ask for it without downcasting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::context::Context;
use crate::fork::Fork;
use crate::scheduler::tree::ClusterId;

/// A unit of work.
///
/// `run` must call exactly one of the fork family or [`Context::join`]
/// before returning; finishing without either is a fatal protocol error.
pub trait Task: Send {
    /// Executes this task's body.
    fn run(&mut self, ctx: &mut Context<'_>);
}

/// A task that knows the byte footprint it will touch.
///
/// `size` is consumed by schedulers for admission decisions and is never
/// called by the task itself. Implementations should round up to a block
/// boundary; [`round_up`] does the arithmetic.
pub trait SizedTask: Task {
    /// Bytes of live data this task touches, rounded to `block_size`.
    fn size(&self, block_size: u64) -> u64;
}

/// A sized task that also knows the footprint of its whole strand.
///
/// The strand size covers the continuation chain this task begins, not just
/// the task itself; hierarchical schedulers use it to pick the smallest
/// cluster the strand fits under.
pub trait HierarchicalTask: SizedTask {
    /// Bytes of live data the whole strand touches, rounded to `block_size`.
    fn strand_size(&self, block_size: u64) -> u64;
}

/// Rounds `bytes` up to the next multiple of `block_size`.
pub fn round_up(bytes: u64, block_size: u64) -> u64 {
    debug_assert!(block_size > 0, "block size must be non-zero");
    bytes.div_ceil(block_size) * block_size
}

/// The capability a job was constructed with.
pub(crate) enum TaskKind {
    Plain(Box<dyn Task>),
    Sized(Box<dyn SizedTask>),
    Hierarchical(Box<dyn HierarchicalTask>),
}

impl TaskKind {
    fn run(&mut self, ctx: &mut Context<'_>) {
        match self {
            TaskKind::Plain(t) => t.run(ctx),
            TaskKind::Sized(t) => t.run(ctx),
            TaskKind::Hierarchical(t) => t.run(ctx),
        }
    }

    fn size(&self, block_size: u64) -> Option<u64> {
        match self {
            TaskKind::Plain(_) => None,
            TaskKind::Sized(t) => Some(t.size(block_size)),
            TaskKind::Hierarchical(t) => Some(t.size(block_size)),
        }
    }

    fn strand_size(&self, block_size: u64) -> Option<u64> {
        match self {
            TaskKind::Plain(_) | TaskKind::Sized(_) => None,
            TaskKind::Hierarchical(t) => Some(t.strand_size(block_size)),
        }
    }
}

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

fn next_job_id() -> u64 {
    NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed)
}

/// A schedulable unit of work.
///
/// Jobs move by value through the system, so a job cannot be executed twice
/// or observed after execution. To watch a specific job finish, take a
/// [`JobHandle`] before submitting it.
///
/// # Example
///
/// ```
/// use spacebound::{Context, Job, Task};
///
/// struct Hello;
/// impl Task for Hello {
///     fn run(&mut self, ctx: &mut Context<'_>) {
///         ctx.join();
///     }
/// }
///
/// let mut job = Job::new(Hello);
/// let handle = job.handle();
/// assert!(!handle.is_complete());
/// ```
pub struct Job {
    id: u64,
    strand_id: Option<u64>,
    parent: Option<Arc<Fork>>,
    pin_id: Option<u64>,
    pin: Option<ClusterId>,
    parent_pin: Option<ClusterId>,
    task: TaskKind,
    handle: Option<JobHandle>,
}

impl Job {
    /// Creates a plain job. Usable with the centralized, local and
    /// work-stealing schedulers; hierarchical schedulers reject it.
    pub fn new<T: Task + 'static>(task: T) -> Self {
        Self::from_kind(TaskKind::Plain(Box::new(task)))
    }

    /// Creates a sized job.
    pub fn sized<T: SizedTask + 'static>(task: T) -> Self {
        Self::from_kind(TaskKind::Sized(Box::new(task)))
    }

    /// Creates a hierarchical job, usable with every scheduler.
    pub fn hierarchical<T: HierarchicalTask + 'static>(task: T) -> Self {
        Self::from_kind(TaskKind::Hierarchical(Box::new(task)))
    }

    fn from_kind(task: TaskKind) -> Self {
        Job {
            id: next_job_id(),
            strand_id: None,
            parent: None,
            pin_id: None,
            pin: None,
            parent_pin: None,
            task,
            handle: None,
        }
    }

    /// Unique, monotonically assigned id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Id of the job that began this job's strand, if it was ever spawned.
    pub fn strand_id(&self) -> Option<u64> {
        self.strand_id
    }

    /// Byte footprint for admission decisions, `None` for plain jobs.
    pub fn size(&self, block_size: u64) -> Option<u64> {
        self.task.size(block_size)
    }

    /// Strand footprint, `None` unless the job is hierarchical.
    pub fn strand_size(&self, block_size: u64) -> Option<u64> {
        self.task.strand_size(block_size)
    }

    /// True when this job established its own pin rather than inheriting it.
    pub fn is_maximal(&self) -> bool {
        self.pin != self.parent_pin
    }

    /// Returns a handle that completes when this job finishes running.
    ///
    /// A forking job's handle completes when the job itself returns, not
    /// when its continuation does; put the handle on the final continuation
    /// (or use `sync_all`) to wait for a whole computation.
    pub fn handle(&mut self) -> JobHandle {
        self.handle.get_or_insert_with(JobHandle::new).clone()
    }

    pub(crate) fn run(&mut self, worker_id: usize) -> crate::context::Outcome {
        let mut ctx = Context::new(self.id, self.strand_id, worker_id);
        self.task.run(&mut ctx);
        ctx.into_outcome(self.id)
    }

    pub(crate) fn parent_fork(&self) -> Option<&Arc<Fork>> {
        self.parent.as_ref()
    }

    pub(crate) fn take_parent_fork(&mut self) -> Option<Arc<Fork>> {
        self.parent.take()
    }

    pub(crate) fn set_parent_fork(&mut self, fork: Option<Arc<Fork>>) {
        self.parent = fork;
    }

    pub(crate) fn set_strand_id(&mut self, strand_id: Option<u64>) {
        self.strand_id = strand_id;
    }

    pub(crate) fn pin_id(&self) -> Option<u64> {
        self.pin_id
    }

    pub(crate) fn set_pin_id(&mut self, pin_id: Option<u64>) {
        self.pin_id = pin_id;
    }

    pub(crate) fn pin(&self) -> Option<ClusterId> {
        self.pin
    }

    pub(crate) fn set_pin(&mut self, pin: Option<ClusterId>) {
        self.pin = pin;
    }

    pub(crate) fn parent_pin(&self) -> Option<ClusterId> {
        self.parent_pin
    }

    pub(crate) fn set_parent_pin(&mut self, pin: Option<ClusterId>) {
        self.parent_pin = pin;
    }

    pub(crate) fn take_handle(&mut self) -> Option<JobHandle> {
        self.handle.take()
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("strand_id", &self.strand_id)
            .field("pin_id", &self.pin_id)
            .field("pin", &self.pin)
            .finish()
    }
}

struct HandleState {
    done: Mutex<bool>,
    cond: Condvar,
}

/// Completion handle for one specific job.
///
/// Cloneable and always safe to wait on, whether the job has already run,
/// is queued, or has not been submitted yet.
#[derive(Clone)]
pub struct JobHandle {
    state: Arc<HandleState>,
}

impl JobHandle {
    fn new() -> Self {
        JobHandle {
            state: Arc::new(HandleState {
                done: Mutex::new(false),
                cond: Condvar::new(),
            }),
        }
    }

    /// Blocks until the job has finished running.
    pub fn wait(&self) {
        let mut done = self
            .state
            .done
            .lock()
            .expect("job handle lock poisoned");
        while !*done {
            done = self
                .state
                .cond
                .wait(done)
                .expect("job handle lock poisoned");
        }
    }

    /// Non-blocking completion check.
    pub fn is_complete(&self) -> bool {
        *self.state.done.lock().expect("job handle lock poisoned")
    }

    pub(crate) fn complete(&self) {
        let mut done = self
            .state
            .done
            .lock()
            .expect("job handle lock poisoned");
        *done = true;
        self.state.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;

    struct Nop;
    impl Task for Nop {
        fn run(&mut self, ctx: &mut Context<'_>) {
            ctx.join();
        }
    }

    struct Fixed(u64);
    impl Task for Fixed {
        fn run(&mut self, ctx: &mut Context<'_>) {
            ctx.join();
        }
    }
    impl SizedTask for Fixed {
        fn size(&self, block_size: u64) -> u64 {
            round_up(self.0, block_size)
        }
    }

    #[test]
    fn ids_are_unique_and_increasing() {
        let a = Job::new(Nop);
        let b = Job::new(Nop);
        assert!(b.id() > a.id());
    }

    #[test]
    fn round_up_to_block() {
        assert_eq!(round_up(1, 64), 64);
        assert_eq!(round_up(64, 64), 64);
        assert_eq!(round_up(65, 64), 128);
        assert_eq!(round_up(0, 64), 0);
    }

    #[test]
    fn size_by_capability() {
        let plain = Job::new(Nop);
        assert_eq!(plain.size(64), None);

        let sized = Job::sized(Fixed(100));
        assert_eq!(sized.size(64), Some(128));
        assert_eq!(sized.strand_size(64), None);
    }

    #[test]
    fn handle_completion() {
        let mut job = Job::new(Nop);
        let handle = job.handle();
        let again = job.handle();
        assert!(!handle.is_complete());
        handle.complete();
        assert!(again.is_complete());
        // wait() on a completed handle returns immediately
        handle.wait();
    }
}
