//! One shared FIFO queue for the whole pool.
//!
//! The baseline policy: no locality, no space accounting, every worker
//! contends on the same queue. Useful as a correctness reference and as the
//! control arm when measuring the other policies.

use crate::job::Job;
use crate::scheduler::queues::SyncQueue;
use crate::scheduler::{check_worker_id, ConfigError, Scheduler};

pub struct CentralScheduler {
    queue: SyncQueue<Job>,
    num_workers: usize,
}

impl CentralScheduler {
    pub fn new(num_workers: usize) -> Result<Self, ConfigError> {
        if num_workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        Ok(CentralScheduler {
            queue: SyncQueue::new(),
            num_workers,
        })
    }
}

impl Scheduler for CentralScheduler {
    fn num_workers(&self) -> usize {
        self.num_workers
    }

    fn add(&self, job: Job, thread_id: usize) {
        check_worker_id(thread_id, self.num_workers, true);
        self.queue.push_back(job);
    }

    fn get(&self, thread_id: usize) -> Option<Job> {
        check_worker_id(thread_id, self.num_workers, false);
        self.queue.pop_front()
    }

    fn done(&self, _job: &Job, thread_id: usize, _deactivate: bool) {
        check_worker_id(thread_id, self.num_workers, false);
    }

    fn more(&self, _thread_id: Option<usize>) -> bool {
        !self.queue.is_empty()
    }
}
