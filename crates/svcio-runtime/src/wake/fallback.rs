//! Condvar wake channel
//!
//! Portable fallback; also used directly in tests on every platform.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::WakeChannel;

struct WakeState {
    pending: u64,
    closed: bool,
}

pub struct CondvarWake {
    state: Mutex<WakeState>,
    condvar: Condvar,
}

impl CondvarWake {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WakeState {
                pending: 0,
                closed: false,
            }),
            condvar: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for CondvarWake {
    fn default() -> Self {
        Self::new()
    }
}

impl WakeChannel for CondvarWake {
    fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.lock();
        loop {
            if guard.closed {
                return false;
            }
            if guard.pending > 0 {
                guard.pending = 0;
                return true;
            }
            guard = match deadline {
                None => self.condvar.wait(guard).unwrap_or_else(|e| e.into_inner()),
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return false;
                    }
                    self.condvar
                        .wait_timeout(guard, d - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
            };
        }
    }

    fn wake(&self) {
        {
            let mut guard = self.lock();
            guard.pending = guard.pending.saturating_add(1);
        }
        self.condvar.notify_one();
    }

    fn wake_all(&self) {
        self.lock().closed = true;
        self.condvar.notify_all();
    }
}
