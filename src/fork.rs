//! Fork nodes of the job DAG.
//!
//! A fork owns the continuation of the job that forked and counts the
//! children that have not yet joined. The counter moves from N to 0 exactly
//! once; whichever thread makes the last decrement takes the continuation
//! out and enqueues it, so the continuation is scheduled exactly once no
//! matter how child completions interleave.

use std::sync::{Arc, Mutex};

use crate::job::Job;

struct ForkState {
    remaining: usize,
    continuation: Option<Box<Job>>,
}

/// Join point for one fork's children.
pub struct Fork {
    state: Mutex<ForkState>,
}

impl Fork {
    /// Wires up a fork requested by `parent`: the children become the
    /// fork's join set and are returned ready to enqueue, the continuation
    /// is parked inside the fork.
    ///
    /// Children start a strand of their own (`strand_id = own id`) and
    /// inherit the parent's pin with the parent's pin as their parent pin.
    /// The continuation stays on the parent's strand and keeps the parent's
    /// pin state and owning fork.
    pub(crate) fn spawn(parent: &Job, mut children: Vec<Job>, mut continuation: Box<Job>) -> Vec<Job> {
        continuation.set_strand_id(parent.strand_id());
        continuation.set_parent_fork(parent.parent_fork().cloned());
        continuation.set_pin_id(parent.pin_id());
        continuation.set_pin(parent.pin());
        continuation.set_parent_pin(parent.parent_pin());

        let fork = Arc::new(Fork {
            state: Mutex::new(ForkState {
                remaining: children.len(),
                continuation: Some(continuation),
            }),
        });

        for child in &mut children {
            child.set_strand_id(Some(child.id()));
            child.set_parent_fork(Some(Arc::clone(&fork)));
            child.set_pin_id(parent.pin_id());
            child.set_pin(parent.pin());
            child.set_parent_pin(parent.pin());
        }
        children
    }

    /// Records one child's join. Returns the continuation on the join that
    /// brings the outstanding count to zero, `None` otherwise.
    pub(crate) fn join(&self) -> Option<Box<Job>> {
        let mut state = self.state.lock().expect("fork lock poisoned");
        assert!(
            state.remaining > 0,
            "join on a fork whose children have all joined"
        );
        state.remaining -= 1;
        if state.remaining == 0 {
            Some(
                state
                    .continuation
                    .take()
                    .expect("fork continuation already taken"),
            )
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::job::{Job, Task};

    struct Nop;
    impl Task for Nop {
        fn run(&mut self, ctx: &mut Context<'_>) {
            ctx.join();
        }
    }

    fn jobs(n: usize) -> Vec<Job> {
        (0..n).map(|_| Job::new(Nop)).collect()
    }

    #[test]
    fn continuation_after_all_children_join() {
        let parent = Job::new(Nop);
        let children = Fork::spawn(&parent, jobs(4), Box::new(Job::new(Nop)));
        let fork = children[0].parent_fork().cloned().unwrap();

        assert!(fork.join().is_none());
        assert!(fork.join().is_none());
        assert!(fork.join().is_none());
        let continuation = fork.join();
        assert!(continuation.is_some());
    }

    #[test]
    #[should_panic(expected = "all joined")]
    fn extra_join_panics() {
        let parent = Job::new(Nop);
        let children = Fork::spawn(&parent, jobs(1), Box::new(Job::new(Nop)));
        let fork = children[0].parent_fork().cloned().unwrap();
        assert!(fork.join().is_some());
        let _ = fork.join();
    }

    #[test]
    fn strand_ids_assigned_at_spawn() {
        let mut parent = Job::new(Nop);
        parent.set_strand_id(Some(parent.id()));
        let cont_src = Job::new(Nop);
        let children = Fork::spawn(&parent, jobs(2), Box::new(cont_src));

        for child in &children {
            assert_eq!(child.strand_id(), Some(child.id()));
        }
        let fork = children[0].parent_fork().cloned().unwrap();
        let cont = {
            fork.join();
            fork.join().unwrap()
        };
        assert_eq!(cont.strand_id(), Some(parent.id()));
        assert!(cont.parent_fork().is_none());
    }

    #[test]
    fn pins_propagate_through_spawn() {
        use crate::scheduler::tree::ClusterId;

        let mut parent = Job::new(Nop);
        parent.set_pin(Some(ClusterId(3)));
        parent.set_parent_pin(Some(ClusterId(1)));
        parent.set_pin_id(Some(42));

        let children = Fork::spawn(&parent, jobs(2), Box::new(Job::new(Nop)));
        for child in &children {
            assert_eq!(child.pin(), Some(ClusterId(3)));
            assert_eq!(child.parent_pin(), Some(ClusterId(3)));
            assert_eq!(child.pin_id(), Some(42));
            assert!(!child.is_maximal());
        }

        let fork = children[0].parent_fork().cloned().unwrap();
        fork.join();
        let cont = fork.join().unwrap();
        assert_eq!(cont.pin(), Some(ClusterId(3)));
        assert_eq!(cont.parent_pin(), Some(ClusterId(1)));
        assert!(cont.is_maximal());
    }
}
