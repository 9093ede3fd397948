//! Loop-local task storage.
//!
//! Tasks are `!Send` futures pinned to the loop thread. Only their ids travel
//! through the inbox.

use super::priority::Priority;
use crate::bridge::capture::PanicCapture;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Identifier of a task on one event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[cfg(test)]
    pub(crate) const fn new_for_test(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Called with the panic when polling a task unwinds.
pub(crate) type PanicHandler = Box<dyn FnOnce(PanicCapture)>;

pub(crate) struct Task {
    pub(crate) future: Pin<Box<dyn Future<Output = ()>>>,
    pub(crate) priority: Priority,
    /// `None` for detached tasks: their panics fault the loop.
    pub(crate) on_panic: Option<PanicHandler>,
}

/// Task table owned by the loop thread.
#[derive(Default)]
pub(crate) struct TaskTable {
    tasks: HashMap<TaskId, Task>,
    next_id: u64,
}

impl TaskTable {
    pub(crate) fn insert(&mut self, task: Task) -> TaskId {
        let id = TaskId::new(self.next_id);
        self.next_id += 1;
        self.tasks.insert(id, task);
        id
    }

    /// Puts a pending task back after a poll.
    pub(crate) fn restore(&mut self, id: TaskId, task: Task) {
        self.tasks.insert(id, task);
    }

    pub(crate) fn take(&mut self, id: TaskId) -> Option<Task> {
        self.tasks.remove(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Removes every task so the futures can be dropped on the loop thread.
    pub(crate) fn drain(&mut self) -> Vec<Task> {
        self.tasks.drain().map(|(_, task)| task).collect()
    }
}
