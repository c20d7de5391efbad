//! Bounded spin-then-yield backoff shared by every lock in this crate
//!
//! Waiters spin with CPU relax hints for a fixed budget, then give the rest
//! of their timeslice back to the OS and start a fresh budget. No lock ever
//! parks on a kernel primitive.

/// Spin budget for the plain spin lock and the queue locks
pub const SPIN_LIMIT: u32 = 2048;

/// Spin budget for the reader/writer lock
pub const RW_SPIN_LIMIT: u32 = 1024;

/// Spin-then-yield state for one wait loop
#[derive(Debug)]
pub struct Backoff {
    spins: u32,
    limit: u32,
}

impl Backoff {
    #[inline]
    pub const fn new(limit: u32) -> Self {
        Self { spins: 0, limit }
    }

    /// One wait step: relax the CPU, or yield once the budget is spent
    #[inline]
    pub fn snooze(&mut self) {
        if self.spins < self.limit {
            self.spins += 1;
            core::hint::spin_loop();
        } else {
            self.spins = 0;
            std::thread::yield_now();
        }
    }

    /// Whether the next `snooze` will yield
    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.spins >= self.limit
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(SPIN_LIMIT)
    }
}
