//! Strictly per-worker queues with no redistribution.
//!
//! Each worker only ever sees the jobs it added itself, so fork-join trees
//! stay on the worker that spawned them. External submissions land on
//! worker 0. There is no stealing: a worker with an empty queue asking for
//! work is a protocol error, callers must poll `more` first.

use crossbeam::utils::CachePadded;

use crate::job::Job;
use crate::scheduler::queues::SyncQueue;
use crate::scheduler::{check_worker_id, ConfigError, Scheduler};

pub struct LocalScheduler {
    queues: Vec<CachePadded<SyncQueue<Job>>>,
    num_workers: usize,
}

impl LocalScheduler {
    pub fn new(num_workers: usize) -> Result<Self, ConfigError> {
        if num_workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        Ok(LocalScheduler {
            queues: (0..num_workers)
                .map(|_| CachePadded::new(SyncQueue::new()))
                .collect(),
            num_workers,
        })
    }
}

impl Scheduler for LocalScheduler {
    fn num_workers(&self) -> usize {
        self.num_workers
    }

    fn add(&self, job: Job, thread_id: usize) {
        check_worker_id(thread_id, self.num_workers, true);
        let target = if thread_id == self.num_workers {
            0
        } else {
            thread_id
        };
        self.queues[target].push_back(job);
    }

    fn get(&self, thread_id: usize) -> Option<Job> {
        check_worker_id(thread_id, self.num_workers, false);
        match self.queues[thread_id].pop_front() {
            Some(job) => Some(job),
            None => panic!("worker {thread_id} asked for work with an empty local queue"),
        }
    }

    fn done(&self, _job: &Job, thread_id: usize, _deactivate: bool) {
        check_worker_id(thread_id, self.num_workers, false);
    }

    fn more(&self, thread_id: Option<usize>) -> bool {
        match thread_id {
            Some(t) => !self.queues[t].is_empty(),
            None => self.queues.iter().any(|q| !q.is_empty()),
        }
    }
}
