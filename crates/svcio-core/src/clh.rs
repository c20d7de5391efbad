//! CLH queue lock
//!
//! Contenders swap a node into the tail and spin on their predecessor's
//! flag, so each waiter watches a different cache line. Acquisition order is
//! strict FIFO.
//!
//! On unlock a thread clears its own node (releasing the successor) and
//! keeps the predecessor's node as its spare for the next acquisition. The
//! spare lives in thread-local storage and is freed when the thread exits,
//! so steady state is one live node per thread.

use core::cell::{Cell, UnsafeCell};
use core::ops::{Deref, DerefMut};
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crate::backoff::{Backoff, SPIN_LIMIT};

#[repr(align(64))]
struct ClhNode {
    locked: AtomicBool,
}

impl ClhNode {
    fn alloc(locked: bool) -> *mut ClhNode {
        Box::into_raw(Box::new(ClhNode {
            locked: AtomicBool::new(locked),
        }))
    }
}

struct SpareNode(Cell<*mut ClhNode>);

impl Drop for SpareNode {
    fn drop(&mut self) {
        let node = self.0.get();
        if !node.is_null() {
            // Safety: the spare is owned by this thread alone
            unsafe { drop(Box::from_raw(node)) };
        }
    }
}

thread_local! {
    static SPARE: SpareNode = const { SpareNode(Cell::new(ptr::null_mut())) };
}

fn take_node() -> *mut ClhNode {
    let node = SPARE
        .try_with(|s| s.0.replace(ptr::null_mut()))
        .unwrap_or(ptr::null_mut());
    if node.is_null() {
        ClhNode::alloc(true)
    } else {
        node
    }
}

fn recycle_node(node: *mut ClhNode) {
    let leftover = SPARE
        .try_with(|s| {
            if s.0.get().is_null() {
                s.0.set(node);
                ptr::null_mut()
            } else {
                node
            }
        })
        .unwrap_or(node);
    if !leftover.is_null() {
        // Safety: nobody else references a predecessor node after handoff
        unsafe { drop(Box::from_raw(leftover)) };
    }
}

/// FIFO queue lock protecting a value of type `T`
pub struct ClhLock<T> {
    tail: AtomicPtr<ClhNode>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for ClhLock<T> {}
unsafe impl<T: Send> Sync for ClhLock<T> {}

impl<T> ClhLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            tail: AtomicPtr::new(ClhNode::alloc(false)),
            data: UnsafeCell::new(value),
        }
    }

    /// Enqueue behind the current tail and wait for the predecessor
    pub fn lock(&self) -> ClhGuard<'_, T> {
        let node = take_node();
        // Safety: node is exclusively ours until published by the swap
        unsafe { (*node).locked.store(true, Ordering::Relaxed) };

        let pred = self.tail.swap(node, Ordering::AcqRel);
        let mut backoff = Backoff::new(SPIN_LIMIT);
        // Safety: pred stays alive until we recycle it in unlock
        while unsafe { (*pred).locked.load(Ordering::Acquire) } {
            backoff.snooze();
        }
        ClhGuard {
            lock: self,
            node,
            pred,
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T> Drop for ClhLock<T> {
    fn drop(&mut self) {
        let tail = *self.tail.get_mut();
        // Safety: with &mut self no guard is outstanding; the tail node
        // belongs to the lock
        unsafe { drop(Box::from_raw(tail)) };
    }
}

/// Holds a [`ClhLock`]; releases it when dropped
pub struct ClhGuard<'a, T> {
    lock: &'a ClhLock<T>,
    node: *mut ClhNode,
    pred: *mut ClhNode,
}

impl<'a, T> Deref for ClhGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for ClhGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for ClhGuard<'a, T> {
    fn drop(&mut self) {
        // Safety: our node is still queued; the successor (or the lock
        // itself as tail) takes ownership once the flag is cleared
        unsafe { (*self.node).locked.store(false, Ordering::Release) };
        recycle_node(self.pred);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn hammer(threads: usize, iters: usize) -> usize {
        let lock = Arc::new(ClhLock::new(0usize));
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..iters {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let total = *lock.lock();
        total
    }

    #[test]
    fn test_clh_basic() {
        let lock = ClhLock::new(1u32);
        *lock.lock() += 1;
        *lock.lock() += 1;
        assert_eq!(*lock.lock(), 3);
    }

    #[test]
    fn test_clh_nested_distinct_locks() {
        let a = ClhLock::new(0u32);
        let b = ClhLock::new(0u32);
        let mut ga = a.lock();
        let mut gb = b.lock();
        *ga += 1;
        *gb += 2;
        drop(ga);
        drop(gb);
        assert_eq!(*a.lock() + *b.lock(), 3);
    }

    #[test]
    fn test_clh_mutual_exclusion() {
        for &n in &[2usize, 5] {
            assert_eq!(hammer(n, 20_000), n * 20_000);
        }
    }

    #[test]
    #[ignore = "long contention grid"]
    fn test_clh_mutual_exclusion_full() {
        for &n in &[2usize, 5, 10, 20] {
            assert_eq!(hammer(n, 100_000), n * 100_000);
        }
    }

    #[test]
    fn test_clh_fifo_order() {
        let lock = Arc::new(ClhLock::new(Vec::new()));
        let held = lock.lock();

        let mut handles = vec![];
        for i in 0..4 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || lock.lock().push(i)));
            // Let thread i queue up before i + 1 arrives
            thread::sleep(Duration::from_millis(50));
        }
        drop(held);

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), vec![0, 1, 2, 3]);
    }
}
