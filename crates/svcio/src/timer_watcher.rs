//! Service-scoped timers
//!
//! A `TimerWatcher` turns reactor timer firings into `RUN_AFTER` /
//! `RUN_EVERY` events in its service's mailbox. Each event carries the
//! watcher itself, so a firing that is still queued when the watcher is
//! stopped is dropped instead of delivered.

use std::sync::{Arc, Weak};
use std::time::Duration;

use svcio_core::SpinLock;
use svcio_runtime::EventTimer;

use crate::event::{ServiceEvent, EVENT_RUN_AFTER, EVENT_RUN_EVERY};
use crate::service::Service;

pub struct TimerWatcher {
    service: Arc<Service>,
    token: u32,
    timer: SpinLock<Option<Arc<EventTimer>>>,
}

impl TimerWatcher {
    pub fn new(service: &Arc<Service>, token: u32) -> Arc<Self> {
        Arc::new(Self {
            service: Arc::clone(service),
            token,
            timer: SpinLock::new(None),
        })
    }

    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    pub fn token(&self) -> u32 {
        self.token
    }

    pub fn start(self: &Arc<Self>, once: bool, interval: Duration) -> bool {
        let weak: Weak<TimerWatcher> = Arc::downgrade(self);
        let timer = EventTimer::new(self.service.io(), once, interval, move || {
            if let Some(watcher) = weak.upgrade() {
                watcher.fire(once);
            }
        });
        // the armed timer keeps its watcher alive until it closes
        let keep_alive = Arc::clone(self);
        timer.set_close_callback(move || drop(keep_alive));

        if let Some(old) = self.timer.lock().replace(Arc::clone(&timer)) {
            old.stop();
        }
        timer.start()
    }

    pub fn stop(&self) {
        let timer = self.timer.lock().take();
        if let Some(timer) = timer {
            timer.stop();
        }
    }

    /// True between `start` and `stop`, including after a one-shot fired
    pub fn is_running(&self) -> bool {
        self.timer.lock().is_some()
    }

    fn fire(self: Arc<Self>, once: bool) {
        let kind = if once { EVENT_RUN_AFTER } else { EVENT_RUN_EVERY };
        let source_id = self.service.id();
        let token = self.token;
        let service = Arc::clone(&self.service);
        service.enqueue(ServiceEvent::timer(kind, source_id, token, self));
    }
}
