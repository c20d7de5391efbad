//! Reader/writer spin lock with upgrade
//!
//! The whole lock state is one atomic word:
//!
//! ```text
//!  31                              2   1   0
//! ┌──────────────────────────────────┬───┬───┐
//! │          reader count            │ U │ W │
//! └──────────────────────────────────┴───┴───┘
//! ```
//!
//! `W` is held by the single writer, `U` by the single upgradable reader,
//! and each plain reader adds `READER`. An upgradable reader coexists with
//! plain readers and becomes the writer with one CAS from exactly `U` to
//! `W`, i.e. once the readers that got in ahead of it have left.
//!
//! Plain readers are only turned away by `W`. Readers arriving after an
//! upgrade was requested still get in and can delay the upgrade; this
//! relaxed behaviour is intentional and must not be tightened.

use core::cell::UnsafeCell;
use core::mem;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

use crate::backoff::{Backoff, RW_SPIN_LIMIT};

pub const WRITER: u32 = 1;
pub const UPGRADED: u32 = 2;
pub const READER: u32 = 4;

/// The lock word and its state transitions, without any protected data
///
/// Unlocking a mode that is not held is a precondition violation and is
/// not detected.
#[derive(Debug, Default)]
pub struct RawRwSpinLock {
    state: AtomicU32,
}

impl RawRwSpinLock {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
        }
    }

    /// Raw state word, for diagnostics and tests
    #[inline]
    pub fn state(&self) -> u32 {
        self.state.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn try_read(&self) -> bool {
        let prev = self.state.fetch_add(READER, Ordering::Acquire);
        if prev & WRITER != 0 {
            self.state.fetch_sub(READER, Ordering::Release);
            return false;
        }
        true
    }

    #[inline]
    pub fn try_write(&self) -> bool {
        self.state
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Set `U` if neither `U` nor `W` was set.
    ///
    /// When only `W` was set the stray `U` bit stays; the writer's unlock
    /// clears both bits.
    #[inline]
    pub fn try_upgradable(&self) -> bool {
        let prev = self.state.fetch_or(UPGRADED, Ordering::Acquire);
        prev & (UPGRADED | WRITER) == 0
    }

    /// Upgradable → writer
    #[inline]
    pub fn try_upgrade(&self) -> bool {
        self.state
            .compare_exchange(UPGRADED, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn read(&self) {
        let mut backoff = Backoff::new(RW_SPIN_LIMIT);
        loop {
            if self.state.load(Ordering::Relaxed) & WRITER == 0 && self.try_read() {
                return;
            }
            backoff.snooze();
        }
    }

    pub fn write(&self) {
        let mut backoff = Backoff::new(RW_SPIN_LIMIT);
        while !self.try_write() {
            backoff.snooze();
        }
    }

    pub fn upgradable(&self) {
        let mut backoff = Backoff::new(RW_SPIN_LIMIT);
        while !self.try_upgradable() {
            backoff.snooze();
        }
    }

    pub fn upgrade(&self) {
        let mut backoff = Backoff::new(RW_SPIN_LIMIT);
        while !self.try_upgrade() {
            backoff.snooze();
        }
    }

    #[inline]
    pub fn unlock_read(&self) {
        self.state.fetch_sub(READER, Ordering::Release);
    }

    #[inline]
    pub fn unlock_write(&self) {
        self.state.fetch_and(!(WRITER | UPGRADED), Ordering::Release);
    }

    #[inline]
    pub fn unlock_upgradable(&self) {
        self.state.fetch_sub(UPGRADED, Ordering::Release);
    }

    /// Writer → reader without letting another writer in between
    #[inline]
    pub fn downgrade_write_to_read(&self) {
        self.state.fetch_add(READER, Ordering::Acquire);
        self.state.fetch_and(!(WRITER | UPGRADED), Ordering::Release);
    }

    /// Upgradable → reader in one step
    #[inline]
    pub fn downgrade_upgradable_to_read(&self) {
        self.state.fetch_add(READER - UPGRADED, Ordering::AcqRel);
    }

    /// Writer → upgradable
    #[inline]
    pub fn downgrade_write_to_upgradable(&self) {
        self.state.fetch_or(UPGRADED, Ordering::Acquire);
        self.state.fetch_sub(WRITER, Ordering::Release);
    }
}

/// Reader/writer spin lock protecting a value of type `T`
pub struct RwSpinLock<T> {
    raw: RawRwSpinLock,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for RwSpinLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwSpinLock<T> {}

impl<T> RwSpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawRwSpinLock::new(),
            data: UnsafeCell::new(value),
        }
    }

    pub fn read(&self) -> ReadGuard<'_, T> {
        self.raw.read();
        ReadGuard { lock: self }
    }

    pub fn try_read(&self) -> Option<ReadGuard<'_, T>> {
        self.raw.try_read().then(|| ReadGuard { lock: self })
    }

    pub fn write(&self) -> WriteGuard<'_, T> {
        self.raw.write();
        WriteGuard { lock: self }
    }

    pub fn try_write(&self) -> Option<WriteGuard<'_, T>> {
        self.raw.try_write().then(|| WriteGuard { lock: self })
    }

    pub fn upgradable_read(&self) -> UpgradableGuard<'_, T> {
        self.raw.upgradable();
        UpgradableGuard { lock: self }
    }

    pub fn try_upgradable_read(&self) -> Option<UpgradableGuard<'_, T>> {
        self.raw.try_upgradable().then(|| UpgradableGuard { lock: self })
    }

    pub fn raw(&self) -> &RawRwSpinLock {
        &self.raw
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for RwSpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

pub struct ReadGuard<'a, T> {
    lock: &'a RwSpinLock<T>,
}

impl<'a, T> Deref for ReadGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> Drop for ReadGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.raw.unlock_read();
    }
}

pub struct WriteGuard<'a, T> {
    lock: &'a RwSpinLock<T>,
}

impl<'a, T> WriteGuard<'a, T> {
    pub fn downgrade(self) -> ReadGuard<'a, T> {
        let lock = self.lock;
        mem::forget(self);
        lock.raw.downgrade_write_to_read();
        ReadGuard { lock }
    }

    pub fn downgrade_to_upgradable(self) -> UpgradableGuard<'a, T> {
        let lock = self.lock;
        mem::forget(self);
        lock.raw.downgrade_write_to_upgradable();
        UpgradableGuard { lock }
    }
}

impl<'a, T> Deref for WriteGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for WriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for WriteGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.raw.unlock_write();
    }
}

/// Shared access plus the exclusive right to become the writer
pub struct UpgradableGuard<'a, T> {
    lock: &'a RwSpinLock<T>,
}

impl<'a, T> UpgradableGuard<'a, T> {
    /// Wait for the plain readers to drain, then take the write lock
    pub fn upgrade(self) -> WriteGuard<'a, T> {
        let lock = self.lock;
        mem::forget(self);
        lock.raw.upgrade();
        WriteGuard { lock }
    }

    pub fn try_upgrade(self) -> Result<WriteGuard<'a, T>, Self> {
        if self.lock.raw.try_upgrade() {
            let lock = self.lock;
            mem::forget(self);
            Ok(WriteGuard { lock })
        } else {
            Err(self)
        }
    }

    pub fn downgrade(self) -> ReadGuard<'a, T> {
        let lock = self.lock;
        mem::forget(self);
        lock.raw.downgrade_upgradable_to_read();
        ReadGuard { lock }
    }
}

impl<'a, T> Deref for UpgradableGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> Drop for UpgradableGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.raw.unlock_upgradable();
    }
}
