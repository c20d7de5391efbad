//! Shared state of one service runtime
//!
//! Ties a reactor to the two registries, the stall monitor, and the count
//! of services waiting for a dispatch thread.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use svcio_core::{kdebug, SpinLock};
use svcio_runtime::{EventIo, EventTimer, ReactorConfig};

use crate::channel_center::ChannelCenter;
use crate::monitor::ServiceMonitor;
use crate::service_center::ServiceCenter;

pub struct ServiceRuntime {
    io: Arc<EventIo>,
    services: ServiceCenter,
    channels: ChannelCenter,
    monitor: ServiceMonitor,
    monitor_timer: SpinLock<Option<Arc<EventTimer>>>,
    waiting: AtomicUsize,
}

impl ServiceRuntime {
    pub fn new(io: Arc<EventIo>, config: &ReactorConfig) -> Arc<Self> {
        Arc::new(Self {
            io,
            services: ServiceCenter::new(config.registry_initial_capacity, config.registry_max_slots),
            channels: ChannelCenter::new(config.registry_initial_capacity, config.registry_max_slots),
            monitor: ServiceMonitor::new(config.concurrent_threads),
            monitor_timer: SpinLock::new(None),
            waiting: AtomicUsize::new(0),
        })
    }

    pub fn io(&self) -> &Arc<EventIo> {
        &self.io
    }

    pub fn services(&self) -> &ServiceCenter {
        &self.services
    }

    pub fn channels(&self) -> &ChannelCenter {
        &self.channels
    }

    pub fn monitor(&self) -> &ServiceMonitor {
        &self.monitor
    }

    /// Services notified but not yet picked up by a dispatch thread
    #[inline]
    pub fn waiting_services(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }

    pub(crate) fn service_notified(&self) {
        self.waiting.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn service_woken(&self) {
        let _ = self
            .waiting
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Report stalled drains to service `monitor_id` every `interval`.
    /// Replaces a running monitor.
    pub fn start_monitor(self: &Arc<Self>, monitor_id: u32, interval: Duration) -> bool {
        if self.services.gain(monitor_id).is_none() {
            return false;
        }
        self.monitor.set_target(monitor_id);

        let weak: Weak<ServiceRuntime> = Arc::downgrade(self);
        let timer = EventTimer::new(&self.io, false, interval, move || {
            if let Some(rt) = weak.upgrade() {
                rt.monitor.check(&rt.services);
            }
        });
        let old = self.monitor_timer.lock().replace(Arc::clone(&timer));
        if let Some(old) = old {
            old.stop();
        }
        kdebug!("monitor reporting to {:#x} every {:?}", monitor_id, interval);
        timer.start()
    }

    /// `start_monitor` ticking at the reactor's configured `monitor_interval`
    pub fn start_monitor_default(self: &Arc<Self>, monitor_id: u32) -> bool {
        let interval = self.io.config().monitor_interval;
        self.start_monitor(monitor_id, interval)
    }

    pub fn stop_monitor(&self) {
        let timer = self.monitor_timer.lock().take();
        if let Some(timer) = timer {
            timer.stop();
        }
        self.monitor.set_target(0);
    }

    /// Stop every registered service and force-close every channel. The
    /// reactor keeps running so the stop events can drain.
    pub fn shutdown(&self) {
        self.stop_monitor();
        for id in self.services.ids() {
            if let Some(service) = self.services.gain(id) {
                service.stop();
            }
        }
        for id in self.channels.ids() {
            if let Some(channel) = self.channels.gain(id) {
                channel.close(0);
            }
        }
        kdebug!("runtime shutdown requested");
    }

    /// Drop every registration. Breaks the runtime/service reference cycle
    /// once the reactor is gone.
    pub fn clear(&self) {
        self.stop_monitor();
        drop(self.services.clear());
        drop(self.channels.clear());
    }
}
