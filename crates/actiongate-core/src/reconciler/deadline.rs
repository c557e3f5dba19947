//! One-shot deadlines ordered in a min-heap.
//!
//! Cancellation is lazy: cancelled handles stay in the heap and are skipped
//! when they surface.

use chrono::{DateTime, Utc};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};

/// Handle returned by [`DeadlineQueue::schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

#[derive(Debug)]
struct Entry<T> {
    deadline: DateTime<Utc>,
    handle: TimerHandle,
    payload: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.handle == other.handle
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.handle.cmp(&other.handle))
    }
}

#[derive(Debug)]
pub struct DeadlineQueue<T> {
    heap: BinaryHeap<Reverse<Entry<T>>>,
    cancelled: HashSet<TimerHandle>,
    next_id: u64,
}

impl<T> Default for DeadlineQueue<T> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            cancelled: HashSet::new(),
            next_id: 0,
        }
    }
}

impl<T> DeadlineQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, deadline: DateTime<Utc>, payload: T) -> TimerHandle {
        self.next_id += 1;
        let handle = TimerHandle(self.next_id);
        self.heap.push(Reverse(Entry {
            deadline,
            handle,
            payload,
        }));
        handle
    }

    /// Cancel a pending deadline. Returns false if it already fired or was
    /// cancelled before.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        let pending = self
            .heap
            .iter()
            .any(|Reverse(entry)| entry.handle == handle);
        pending && self.cancelled.insert(handle)
    }

    /// Earliest live deadline.
    pub fn next_deadline(&mut self) -> Option<DateTime<Utc>> {
        self.discard_cancelled();
        self.heap.peek().map(|Reverse(entry)| entry.deadline)
    }

    /// Remove and return every live entry due at or before `now`, earliest
    /// first.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<(TimerHandle, T)> {
        let mut due = Vec::new();
        loop {
            self.discard_cancelled();
            match self.heap.peek() {
                Some(Reverse(entry)) if entry.deadline <= now => {}
                _ => break,
            }
            if let Some(Reverse(entry)) = self.heap.pop() {
                due.push((entry.handle, entry.payload));
            }
        }
        due
    }

    /// Number of live deadlines.
    pub fn len(&self) -> usize {
        self.heap.len() - self.cancelled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.cancelled.clear();
    }

    fn discard_cancelled(&mut self) {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if !self.cancelled.remove(&entry.handle) {
                break;
            }
            self.heap.pop();
        }
    }
}
