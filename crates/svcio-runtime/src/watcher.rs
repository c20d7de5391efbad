//! Event watcher: a coalescing wake-up posted into the reactor
//!
//! Any number of `notify` calls between two handler runs collapse into a
//! single queued job. A manual-reset watcher stays in `Running` after its
//! handler starts and ignores notifications until `reset`; an auto-rearm
//! watcher is armed again before the callback runs.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use crate::event_io::EventIo;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherStatus {
    Closed = 0,
    Armed = 1,
    Notified = 2,
    Running = 3,
}

impl WatcherStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => WatcherStatus::Armed,
            2 => WatcherStatus::Notified,
            3 => WatcherStatus::Running,
            _ => WatcherStatus::Closed,
        }
    }
}

const CLOSED: u8 = WatcherStatus::Closed as u8;
const ARMED: u8 = WatcherStatus::Armed as u8;
const NOTIFIED: u8 = WatcherStatus::Notified as u8;
const RUNNING: u8 = WatcherStatus::Running as u8;

pub struct EventWatcher {
    io: Weak<EventIo>,
    status: AtomicU8,
    manual_reset: bool,
    callback: Box<dyn Fn() + Send + Sync>,
}

impl EventWatcher {
    pub fn new<F>(io: &Arc<EventIo>, manual_reset: bool, callback: F) -> Arc<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Arc::new(Self {
            io: Arc::downgrade(io),
            status: AtomicU8::new(CLOSED),
            manual_reset,
            callback: Box::new(callback),
        })
    }

    pub fn status(&self) -> WatcherStatus {
        WatcherStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_manual_reset(&self) -> bool {
        self.manual_reset
    }

    /// Closed -> Armed
    pub fn start(&self) -> bool {
        self.transition(CLOSED, ARMED)
    }

    /// Armed -> Notified and queue the handler. False if already notified,
    /// running (manual reset), closed, or the reactor is gone.
    pub fn notify(self: &Arc<Self>) -> bool {
        let Some(io) = self.io.upgrade() else {
            return false;
        };
        if !self.transition(ARMED, NOTIFIED) {
            return false;
        }
        io.queue_in_loop(
            Arc::clone(self),
            |watcher| watcher.handle(),
            |watcher| {
                watcher.transition(NOTIFIED, ARMED);
            },
        );
        true
    }

    /// Running -> Armed, for manual-reset watchers after the handler is done
    pub fn reset(&self) -> bool {
        self.transition(RUNNING, ARMED)
    }

    /// Returns true if the watcher was open.
    pub fn close(&self) -> bool {
        self.status.swap(CLOSED, Ordering::AcqRel) != CLOSED
    }

    fn handle(&self) {
        let next = if self.manual_reset { RUNNING } else { ARMED };
        if self.transition(NOTIFIED, next) {
            (self.callback)();
        }
    }

    #[inline]
    fn transition(&self, from: u8, to: u8) -> bool {
        self.status
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReactorConfig;
    use std::sync::atomic::AtomicU32;
    use std::thread;
    use std::time::{Duration, Instant};

    fn wait_for(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    #[test]
    fn test_state_transitions_without_loop() {
        let io = EventIo::new(ReactorConfig::new()).unwrap();
        let w = EventWatcher::new(&io, true, || {});
        assert_eq!(w.status(), WatcherStatus::Closed);
        assert!(!w.notify());
        assert!(w.start());
        assert!(!w.start());
        assert!(w.notify());
        assert_eq!(w.status(), WatcherStatus::Notified);
        // coalesced
        assert!(!w.notify());
        assert!(!w.reset());
        assert!(w.close());
        assert!(!w.close());
    }

    #[test]
    fn test_manual_reset_holds_until_reset() {
        let config = ReactorConfig::new().max_wait(Duration::from_millis(10));
        let io = EventIo::new(config).unwrap();
        let io2 = Arc::clone(&io);
        let h = thread::spawn(move || io2.dispatch());

        let hits = Arc::new(AtomicU32::new(0));
        let hh = Arc::clone(&hits);
        let w = EventWatcher::new(&io, true, move || {
            hh.fetch_add(1, Ordering::SeqCst);
        });
        w.start();
        assert!(w.notify());
        assert!(wait_for(|| hits.load(Ordering::SeqCst) == 1));
        assert_eq!(w.status(), WatcherStatus::Running);
        assert!(!w.notify());

        assert!(w.reset());
        assert!(w.notify());
        assert!(wait_for(|| hits.load(Ordering::SeqCst) == 2));

        io.stop_loop();
        h.join().unwrap();
    }

    #[test]
    fn test_auto_rearm() {
        let config = ReactorConfig::new().max_wait(Duration::from_millis(10));
        let io = EventIo::new(config).unwrap();
        let io2 = Arc::clone(&io);
        let h = thread::spawn(move || io2.dispatch());

        let hits = Arc::new(AtomicU32::new(0));
        let hh = Arc::clone(&hits);
        let w = EventWatcher::new(&io, false, move || {
            hh.fetch_add(1, Ordering::SeqCst);
        });
        w.start();
        for expected in 1..=5 {
            assert!(wait_for(|| w.notify()));
            assert!(wait_for(|| hits.load(Ordering::SeqCst) == expected));
        }
        assert!(wait_for(|| w.status() == WatcherStatus::Armed));

        io.stop_loop();
        h.join().unwrap();
    }

    #[test]
    fn test_closed_watcher_skips_handler() {
        let io = EventIo::new(ReactorConfig::new()).unwrap();
        let hits = Arc::new(AtomicU32::new(0));
        let hh = Arc::clone(&hits);
        let w = EventWatcher::new(&io, false, move || {
            hh.fetch_add(1, Ordering::SeqCst);
        });
        w.start();
        assert!(w.notify());
        w.close();
        io.do_events();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
