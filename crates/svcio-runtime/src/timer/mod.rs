//! Reactor timers
//!
//! An [`EventTimer`] fires its callback on a dispatch thread, either once or
//! every `interval`. Arming and disarming always happen inside the loop, so
//! `start`/`stop` are safe from any thread.
//!
//! Firing rules:
//! - once: clear `running`, then callback, then close callback
//! - repeating and still running: re-armed before the callback runs
//! - repeating but stopped: close callback only
//! - interval 0: fires immediately as a one-shot once started

pub mod heap;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use svcio_core::{ktrace, SpinLock};

use crate::event_io::EventIo;
use heap::TimerKey;

pub type TimerCallback = Box<dyn FnMut() + Send>;
pub type CloseCallback = Box<dyn FnOnce() + Send>;

pub struct EventTimer {
    io: Weak<EventIo>,
    once: bool,
    interval: Duration,
    running: AtomicBool,
    armed: SpinLock<Option<TimerKey>>,
    callback: SpinLock<TimerCallback>,
    on_close: SpinLock<Option<CloseCallback>>,
}

impl EventTimer {
    pub fn new<F>(io: &Arc<EventIo>, once: bool, interval: Duration, callback: F) -> Arc<Self>
    where
        F: FnMut() + Send + 'static,
    {
        Arc::new(Self {
            io: Arc::downgrade(io),
            once,
            interval,
            running: AtomicBool::new(false),
            armed: SpinLock::new(None),
            callback: SpinLock::new(Box::new(callback)),
            on_close: SpinLock::new(None),
        })
    }

    /// Runs once, after the final firing or after `stop` disarms the timer
    pub fn set_close_callback<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *self.on_close.lock() = Some(Box::new(f));
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_once(&self) -> bool {
        self.once
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn start(self: &Arc<Self>) -> bool {
        let Some(io) = self.io.upgrade() else {
            return false;
        };
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        io.run_in_loop(
            Arc::clone(self),
            |timer| timer.arm(),
            |timer| timer.running.store(false, Ordering::Release),
        );
        true
    }

    pub fn stop(self: &Arc<Self>) -> bool {
        let Some(io) = self.io.upgrade() else {
            return false;
        };
        if self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        io.run_in_loop(Arc::clone(self), |timer| timer.disarm(), |_| {});
        true
    }

    fn arm(self: Arc<Self>) {
        let Some(io) = self.io.upgrade() else {
            return;
        };
        if !self.is_running() {
            // stopped before the loop got here; the disarm job finds no key
            self.close();
            return;
        }
        if self.interval.is_zero() {
            if self
                .running
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.invoke();
            }
            self.close();
            return;
        }
        let deadline = io.now_ms() + self.interval.as_millis() as u64;
        let key = io.timers().insert(deadline, Arc::clone(&self));
        if let Some(stale) = self.armed.lock().replace(key) {
            io.timers().cancel(stale);
        }
        ktrace!("timer armed at {}ms", deadline);
    }

    fn disarm(self: Arc<Self>) {
        let Some(io) = self.io.upgrade() else {
            return;
        };
        let key = self.armed.lock().take();
        if let Some(key) = key {
            if io.timers().cancel(key) {
                self.close();
            }
        }
    }

    /// Called by the reactor after the heap entry was popped
    pub(crate) fn fire(self: Arc<Self>, io: &EventIo) {
        self.armed.lock().take();
        if self.once {
            if self
                .running
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.invoke();
            }
            self.close();
            return;
        }
        if self.is_running() {
            let deadline = io.now_ms() + self.interval.as_millis() as u64;
            let key = io.timers().insert(deadline, Arc::clone(&self));
            *self.armed.lock() = Some(key);
            self.invoke();
        } else {
            self.close();
        }
    }

    fn invoke(&self) {
        let mut cb = self.callback.lock();
        (*cb)();
    }

    fn close(&self) {
        let f = self.on_close.lock().take();
        if let Some(f) = f {
            f();
        }
    }
}
