//! Min-heap of timer deadlines
//!
//! Entries are keyed on (deadline in loop milliseconds, insertion sequence),
//! so equal deadlines fire in insertion order. Cancellation is lazy: the
//! key leaves the live set and the entry is skipped when it surfaces. Keys
//! that were already popped are not live, so cancelling them is a no-op.

use std::collections::{BinaryHeap, HashSet};

use svcio_core::SpinLock;

/// Identifies one heap insertion; a re-armed timer gets a new key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerKey(u64);

impl TimerKey {
    #[inline]
    pub fn raw(&self) -> u64 {
        self.0
    }
}

struct HeapEntry<T> {
    deadline: u64,
    key: TimerKey,
    item: T,
}

impl<T> PartialEq for HeapEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.key == other.key
    }
}

impl<T> Eq for HeapEntry<T> {}

impl<T> PartialOrd for HeapEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for HeapEntry<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed: BinaryHeap is a max-heap
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.key.0.cmp(&self.key.0))
    }
}

struct HeapInner<T> {
    heap: BinaryHeap<HeapEntry<T>>,
    live: HashSet<TimerKey>,
    next_key: u64,
}

impl<T> HeapInner<T> {
    /// Drop cancelled entries sitting at the top
    fn skip_cancelled(&mut self) {
        while let Some(top) = self.heap.peek() {
            if self.live.contains(&top.key) {
                break;
            }
            self.heap.pop();
        }
    }
}

pub struct TimerHeap<T> {
    inner: SpinLock<HeapInner<T>>,
}

impl<T> TimerHeap<T> {
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: SpinLock::new(HeapInner {
                heap: BinaryHeap::with_capacity(capacity),
                live: HashSet::new(),
                next_key: 1,
            }),
        }
    }

    pub fn insert(&self, deadline: u64, item: T) -> TimerKey {
        let mut inner = self.inner.lock();
        let key = TimerKey(inner.next_key);
        inner.next_key += 1;
        inner.live.insert(key);
        inner.heap.push(HeapEntry {
            deadline,
            key,
            item,
        });
        key
    }

    /// Returns false if the key was already cancelled or already popped.
    pub fn cancel(&self, key: TimerKey) -> bool {
        self.inner.lock().live.remove(&key)
    }

    /// Pop every live entry whose deadline is at or before `now`, earliest
    /// first. The caller fires them after the lock is released.
    pub fn pop_expired(&self, now: u64) -> Vec<T> {
        let mut inner = self.inner.lock();
        let mut expired = Vec::new();
        loop {
            inner.skip_cancelled();
            match inner.heap.peek() {
                Some(top) if top.deadline <= now => {}
                _ => break,
            }
            if let Some(entry) = inner.heap.pop() {
                inner.live.remove(&entry.key);
                expired.push(entry.item);
            }
        }
        expired
    }

    pub fn next_deadline(&self) -> Option<u64> {
        let mut inner = self.inner.lock();
        inner.skip_cancelled();
        inner.heap.peek().map(|e| e.deadline)
    }

    /// Entries neither popped nor cancelled
    pub fn len(&self) -> usize {
        self.inner.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove everything; returned items are dropped by the caller outside
    /// the lock.
    pub fn clear(&self) -> Vec<T> {
        let mut inner = self.inner.lock();
        inner.live.clear();
        let heap = std::mem::take(&mut inner.heap);
        heap.into_iter().map(|e| e.item).collect()
    }
}

impl<T> Default for TimerHeap<T> {
    fn default() -> Self {
        Self::new()
    }
}
