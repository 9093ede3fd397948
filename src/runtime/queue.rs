//! Priority-ordered action queue.
//!
//! Ordering: higher priority first, then earlier submission (FIFO within the
//! same priority). Uses a binary heap for O(log n) push and pop; a generation
//! counter provides the FIFO tie-break.

use super::priority::Priority;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

struct QueueEntry<T> {
    priority: Priority,
    /// Submission order for FIFO tie-breaking among equal priorities.
    generation: u64,
    item: T,
}

impl<T> Ord for QueueEntry<T> {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: higher priority wins, then the lower generation.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

impl<T> PartialOrd for QueueEntry<T> {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for QueueEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.generation == other.generation
    }
}

impl<T> Eq for QueueEntry<T> {}

/// A queue of pending items ordered by [`Priority`] with FIFO tie-breaking.
pub struct ActionQueue<T> {
    heap: BinaryHeap<QueueEntry<T>>,
    next_generation: u64,
}

impl<T> Default for ActionQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ActionQueue<T> {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Creates an empty queue with pre-allocated capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity),
            next_generation: 0,
        }
    }

    /// Enqueues an item.
    #[inline]
    pub fn push(&mut self, priority: Priority, item: T) {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.heap.push(QueueEntry {
            priority,
            generation,
            item,
        });
    }

    /// Removes the next item to dispatch.
    #[inline]
    pub fn pop(&mut self) -> Option<(Priority, T)> {
        self.heap.pop().map(|entry| (entry.priority, entry.item))
    }

    /// Priority of the next item to dispatch.
    #[must_use]
    pub fn peek_priority(&self) -> Option<Priority> {
        self.heap.peek().map(|entry| entry.priority)
    }

    /// Number of pending items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Returns true if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drops every pending item.
    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

impl<T> std::fmt::Debug for ActionQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionQueue")
            .field("len", &self.heap.len())
            .field("next", &self.peek_priority())
            .finish()
    }
}
