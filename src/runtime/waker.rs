//! Wakers that redispatch task resumptions through the loop inbox.
//!
//! A waker may fire on any thread. It never touches the task; it only asks the
//! owning loop to poll the task again, at the task's own priority, so every
//! resumption still executes on the loop thread.

use super::inbox::Inbox;
use super::priority::Priority;
use super::task::TaskId;
use std::sync::Arc;
use std::task::{Wake, Waker};

/// Creates the waker for `task` on the loop owning `inbox`.
pub(crate) fn waker_for(inbox: &Arc<Inbox>, task: TaskId, priority: Priority) -> Waker {
    Waker::from(Arc::new(TaskWaker {
        inbox: Arc::clone(inbox),
        task,
        priority,
    }))
}

struct TaskWaker {
    inbox: Arc<Inbox>,
    task: TaskId,
    priority: Priority,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        // After shutdown the loop is gone; a late wake is simply dropped.
        let _ = self.inbox.schedule_poll(self.task, self.priority);
    }
}
