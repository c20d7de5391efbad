//! Test-and-set spin lock
//!
//! Guards short critical sections: mailbox queues, the reactor job queue,
//! the timer heap. Acquisition is an atomic swap with acquire ordering;
//! release is a plain store with release ordering. No fairness between
//! waiters. Re-acquiring on the same thread deadlocks.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::backoff::{Backoff, SPIN_LIMIT};

/// A spin lock protecting a value of type `T`
pub struct SpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// Safety: SpinLock provides exclusive access to T
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Create a new spinlock containing the given value
    #[inline]
    pub const fn new(value: T) -> Self {
        SpinLock {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, spinning and then yielding until it's available
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let mut backoff = Backoff::new(SPIN_LIMIT);
        loop {
            if !self.locked.swap(true, Ordering::Acquire) {
                return SpinLockGuard { lock: self };
            }
            // Wait on a plain load so contenders don't bounce the line
            while self.locked.load(Ordering::Relaxed) {
                backoff.snooze();
            }
        }
    }

    /// Try to acquire the lock without waiting
    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self.locked.swap(true, Ordering::Acquire) {
            None
        } else {
            Some(SpinLockGuard { lock: self })
        }
    }

    /// Check if the lock is currently held
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Mutable access through an exclusive borrow, no locking needed
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        SpinLock::new(T::default())
    }
}

/// Guard that releases the spinlock when dropped
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<'a, T> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: We hold the lock
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for SpinLockGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: We hold the lock
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for SpinLockGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn hammer(threads: usize, iters: usize) -> usize {
        let lock = Arc::new(SpinLock::new(0usize));
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
    fn test_spinlock_basic() {
        let lock = SpinLock::new(0u32);
        {
            let mut guard = lock.lock();
            *guard = 42;
        }
        assert_eq!(*lock.lock(), 42);
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_spinlock_try_lock() {
        let lock = SpinLock::new(0u32);

        let guard = lock.try_lock();
        assert!(guard.is_some());
        assert!(lock.is_locked());

        // While held, try_lock should fail
        assert!(lock.try_lock().is_none());

        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_mutual_exclusion() {
        for &n in &[2usize, 5, 10, 20] {
            assert_eq!(hammer(n, 100_000), n * 100_000, "threads={}", n);
        }
    }
}
