//! Thread-safe submission side of an event loop.
//!
//! Everything that crosses into the loop (task polls requested by wakers,
//! closures posted from other threads, shutdown requests) goes through this
//! mutex-protected queue. Task state itself never leaves the loop thread; the
//! inbox only carries task ids.

use super::priority::Priority;
use super::queue::ActionQueue;
use super::task::TaskId;
use crate::tracing_compat::trace;
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;

/// A unit of work waiting in the inbox.
pub(crate) enum Job {
    /// Poll a loop-local task.
    Poll(TaskId),
    /// Run a closure submitted from any thread.
    Post(Box<dyn FnOnce() + Send>),
    /// Stop the loop once this job is reached.
    Shutdown,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Poll(task) => f.debug_tuple("Poll").field(task).finish(),
            Self::Post(_) => f.write_str("Post(..)"),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

#[derive(Debug)]
struct InboxState {
    queue: ActionQueue<Job>,
    /// Tasks with a pending `Job::Poll` (dedups repeated wakes).
    queued_polls: HashSet<TaskId>,
    shutdown: bool,
}

/// Shared queue plus the condition variable the loop parks on.
#[derive(Debug)]
pub(crate) struct Inbox {
    state: Mutex<InboxState>,
    ready: Condvar,
}

impl Inbox {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(InboxState {
                queue: ActionQueue::with_capacity(capacity),
                queued_polls: HashSet::new(),
                shutdown: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Requests a poll of `task`. Returns false if the loop has shut down.
    pub(crate) fn schedule_poll(&self, task: TaskId, priority: Priority) -> bool {
        let mut state = self.state.lock();
        if state.shutdown {
            return false;
        }
        if state.queued_polls.insert(task) {
            state.queue.push(priority, Job::Poll(task));
            trace!(task_id = ?task, %priority, "task poll queued");
            drop(state);
            self.ready.notify_one();
        }
        true
    }

    /// Queues an arbitrary job. Returns false if the loop has shut down.
    pub(crate) fn push(&self, priority: Priority, job: Job) -> bool {
        let mut state = self.state.lock();
        if state.shutdown {
            return false;
        }
        state.queue.push(priority, job);
        drop(state);
        self.ready.notify_one();
        true
    }

    /// Marks the loop as shut down and wakes it. Pending jobs are discarded
    /// by the loop thread once it observes the flag.
    pub(crate) fn request_shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        drop(state);
        self.ready.notify_all();
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    /// Blocks until a job is available or shutdown is requested.
    ///
    /// Returns `None` once shut down.
    pub(crate) fn next_job(&self) -> Option<(Priority, Job)> {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return None;
            }
            if let Some((priority, job)) = state.queue.pop() {
                if let Job::Poll(task) = &job {
                    state.queued_polls.remove(task);
                }
                return Some((priority, job));
            }
            self.ready.wait(&mut state);
        }
    }

    /// Removes every pending job, returning them so they can be dropped
    /// outside the lock.
    pub(crate) fn drain(&self) -> Vec<Job> {
        let mut state = self.state.lock();
        state.queued_polls.clear();
        std::iter::from_fn(|| state.queue.pop().map(|(_, job)| job)).collect()
    }

    pub(crate) fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }
}
