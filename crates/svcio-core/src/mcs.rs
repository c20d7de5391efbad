//! MCS queue lock
//!
//! Each contender links its own node behind the previous tail and spins on
//! its own flag; the holder hands off by clearing the successor's flag.
//! FIFO, one cache miss per handoff.
//!
//! Unlock with no visible successor tries to swing the tail back to null.
//! If that CAS loses to a new arrival, the holder waits for the arrival to
//! publish itself in `next` before handing off.

use core::cell::{Cell, UnsafeCell};
use core::ops::{Deref, DerefMut};
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crate::backoff::{Backoff, SPIN_LIMIT};

#[repr(align(64))]
struct McsNode {
    next: AtomicPtr<McsNode>,
    locked: AtomicBool,
}

struct SpareNode(Cell<*mut McsNode>);

impl Drop for SpareNode {
    fn drop(&mut self) {
        let node = self.0.get();
        if !node.is_null() {
            unsafe { drop(Box::from_raw(node)) };
        }
    }
}

thread_local! {
    static SPARE: SpareNode = const { SpareNode(Cell::new(ptr::null_mut())) };
}

fn take_node() -> *mut McsNode {
    let node = SPARE
        .try_with(|s| s.0.replace(ptr::null_mut()))
        .unwrap_or(ptr::null_mut());
    if !node.is_null() {
        return node;
    }
    Box::into_raw(Box::new(McsNode {
        next: AtomicPtr::new(ptr::null_mut()),
        locked: AtomicBool::new(false),
    }))
}

fn recycle_node(node: *mut McsNode) {
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
        unsafe { drop(Box::from_raw(leftover)) };
    }
}

/// FIFO queue lock protecting a value of type `T`
pub struct McsLock<T> {
    tail: AtomicPtr<McsNode>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for McsLock<T> {}
unsafe impl<T: Send> Sync for McsLock<T> {}

impl<T> McsLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            tail: AtomicPtr::new(ptr::null_mut()),
            data: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> McsGuard<'_, T> {
        let node = take_node();
        // Safety: node is private until the swap publishes it
        unsafe {
            (*node).next.store(ptr::null_mut(), Ordering::Relaxed);
            (*node).locked.store(true, Ordering::Relaxed);
        }

        let prev = self.tail.swap(node, Ordering::AcqRel);
        if !prev.is_null() {
            // Safety: prev cannot be recycled before it hands off to us
            unsafe { (*prev).next.store(node, Ordering::Release) };
            let mut backoff = Backoff::new(SPIN_LIMIT);
            while unsafe { (*node).locked.load(Ordering::Acquire) } {
                backoff.snooze();
            }
        }
        McsGuard { lock: self, node }
    }

    /// Acquire only if nobody holds or waits for the lock
    pub fn try_lock(&self) -> Option<McsGuard<'_, T>> {
        let node = take_node();
        unsafe {
            (*node).next.store(ptr::null_mut(), Ordering::Relaxed);
            (*node).locked.store(true, Ordering::Relaxed);
        }
        match self.tail.compare_exchange(
            ptr::null_mut(),
            node,
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => Some(McsGuard { lock: self, node }),
            Err(_) => {
                recycle_node(node);
                None
            }
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

/// Holds an [`McsLock`]; hands off to the successor when dropped
pub struct McsGuard<'a, T> {
    lock: &'a McsLock<T>,
    node: *mut McsNode,
}

impl<'a, T> Deref for McsGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for McsGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for McsGuard<'a, T> {
    fn drop(&mut self) {
        let node = self.node;
        let mut next = unsafe { (*node).next.load(Ordering::Acquire) };
        if next.is_null() {
            if self
                .lock
                .tail
                .compare_exchange(node, ptr::null_mut(), Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                recycle_node(node);
                return;
            }
            // A new arrival swapped in but has not linked itself yet
            let mut backoff = Backoff::new(SPIN_LIMIT);
            loop {
                next = unsafe { (*node).next.load(Ordering::Acquire) };
                if !next.is_null() {
                    break;
                }
                backoff.snooze();
            }
        }
        unsafe { (*next).locked.store(false, Ordering::Release) };
        recycle_node(node);
    }
}
