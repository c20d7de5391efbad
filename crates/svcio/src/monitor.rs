//! Drain-stall monitor
//!
//! Every dispatch thread owns one slot. A drain marks the slot with the
//! event it is handling and bumps the slot version on entry and exit. A
//! periodic check that finds the same version twice in a row while a drain
//! is in progress reports the stalled service to the monitor service as a
//! `MSG | TEXT` event whose source is the stalled service.

use std::sync::atomic::{AtomicU32, Ordering};

use svcio_core::kwarn;

use crate::event::{ServiceEvent, EVENT_MSG, MSG_TEXT};
use crate::service_center::ServiceCenter;

#[derive(Default)]
struct MonitorSlot {
    version: AtomicU32,
    check_version: AtomicU32,
    source: AtomicU32,
    dest: AtomicU32,
}

pub struct ServiceMonitor {
    slots: Box<[MonitorSlot]>,
    target: AtomicU32,
}

impl ServiceMonitor {
    /// `slots` dispatch threads are tracked; higher dispatcher indices are
    /// not monitored
    pub fn new(slots: usize) -> Self {
        Self {
            slots: (0..slots.max(1)).map(|_| MonitorSlot::default()).collect(),
            target: AtomicU32::new(0),
        }
    }

    pub fn slots(&self) -> usize {
        self.slots.len()
    }

    /// Service that receives stall reports, 0 for none
    pub fn target(&self) -> u32 {
        self.target.load(Ordering::Acquire)
    }

    pub fn set_target(&self, id: u32) {
        self.target.store(id, Ordering::Release);
    }

    /// Mark `dispatcher` busy delivering from `source` to `dest`
    pub fn enter(&self, dispatcher: Option<usize>, source: u32, dest: u32) -> Option<usize> {
        let index = dispatcher?;
        let slot = self.slots.get(index)?;
        slot.source.store(source, Ordering::Relaxed);
        slot.dest.store(dest, Ordering::Relaxed);
        slot.version.fetch_add(1, Ordering::Release);
        Some(index)
    }

    pub fn leave(&self, index: Option<usize>) {
        let Some(slot) = index.and_then(|i| self.slots.get(i)) else {
            return;
        };
        slot.source.store(0, Ordering::Relaxed);
        slot.dest.store(0, Ordering::Relaxed);
        slot.version.fetch_add(1, Ordering::Release);
    }

    /// One monitor tick. Returns the number of stalls reported.
    pub fn check(&self, services: &ServiceCenter) -> usize {
        let target = self.target();
        let mut reported = 0;
        for slot in self.slots.iter() {
            let version = slot.version.load(Ordering::Acquire);
            if version != slot.check_version.load(Ordering::Relaxed) {
                slot.check_version.store(version, Ordering::Relaxed);
                continue;
            }
            let dest = slot.dest.load(Ordering::Relaxed);
            if dest == 0 {
                continue;
            }
            let source = slot.source.load(Ordering::Relaxed);
            kwarn!(
                "service {:#x} may be stuck handling an event from {:#x}, version {}",
                dest,
                source,
                version
            );
            let Some(monitor) = services.gain(target) else {
                continue;
            };
            let text = format!("stall {:#x} {:#x}", dest, source);
            if monitor.enqueue(ServiceEvent::message(
                EVENT_MSG | MSG_TEXT,
                dest,
                0,
                text.as_bytes(),
            )) {
                reported += 1;
            }
        }
        reported
    }
}
