//! Service mailbox
//!
//! A service is a FIFO of [`ServiceEvent`]s drained by at most one dispatch
//! thread at a time. Producers on any thread `enqueue`; the first one to
//! find the mailbox idle notifies the service's manual-reset watcher, which
//! schedules a drain on the reactor. The drain hands each event to the
//! service's [`ServiceHandler`] in order.
//!
//! # Fairness
//!
//! After each batch, a drain that still has work checks whether other
//! services are waiting for a worker. If so it re-notifies itself and
//! returns, putting itself at the back of the reactor queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use svcio_core::{kdebug, ktrace, kwarn, SpinLock, SpinLockGuard};
use svcio_runtime::{EventIo, EventWatcher};

use crate::channel::Channel;
use crate::event::*;
use crate::runtime::ServiceRuntime;
use crate::timer_watcher::TimerWatcher;

/// Application side of a service
pub trait ServiceHandler: Send {
    /// Runs inside `Service::start`. Returning false aborts the start.
    fn on_start(&mut self, _service: &Arc<Service>) -> bool {
        true
    }

    /// One event. The return value matters for ACCEPT and CONNECT: false
    /// closes the channel that was created for the connection.
    fn on_event(&mut self, service: &Arc<Service>, event: Delivery<'_>) -> bool;

    /// Runs once, when the stop event is processed or a start is aborted
    fn on_stop(&mut self) {}
}

impl<F> ServiceHandler for F
where
    F: FnMut(&Arc<Service>, Delivery<'_>) -> bool + Send,
{
    fn on_event(&mut self, service: &Arc<Service>, event: Delivery<'_>) -> bool {
        self(service, event)
    }
}

type HandlerSlot = Option<Box<dyn ServiceHandler>>;

pub struct Service {
    runtime: Arc<ServiceRuntime>,
    id: AtomicU32,
    running: AtomicBool,
    depth: AtomicU32,
    queue: SpinLock<VecDeque<ServiceEvent>>,
    watcher: SpinLock<Option<Arc<EventWatcher>>>,
    handler: SpinLock<HandlerSlot>,
}

impl Service {
    pub fn new(runtime: &Arc<ServiceRuntime>) -> Arc<Self> {
        Arc::new(Self {
            runtime: Arc::clone(runtime),
            id: AtomicU32::new(0),
            running: AtomicBool::new(false),
            depth: AtomicU32::new(0),
            queue: SpinLock::new(VecDeque::new()),
            watcher: SpinLock::new(None),
            handler: SpinLock::new(None),
        })
    }

    pub fn runtime(&self) -> &Arc<ServiceRuntime> {
        &self.runtime
    }

    pub fn io(&self) -> &Arc<EventIo> {
        self.runtime.io()
    }

    /// 0 before start and after the stop event was processed
    #[inline]
    pub fn id(&self) -> u32 {
        self.id.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Events accepted but not yet handed to the handler
    #[inline]
    pub fn queue_size(&self) -> u32 {
        self.depth.load(Ordering::Acquire)
    }

    /// Register and start draining. Returns the service id, or 0 if the
    /// service was already started, the registry is full, or `on_start`
    /// refused.
    pub fn start<H>(self: &Arc<Self>, handler: H) -> u32
    where
        H: ServiceHandler + 'static,
    {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return 0;
        }

        let weak: Weak<Service> = Arc::downgrade(self);
        let watcher = EventWatcher::new(self.io(), true, move || {
            if let Some(service) = weak.upgrade() {
                service.drain();
            }
        });
        *self.watcher.lock() = Some(Arc::clone(&watcher));

        let id = self.runtime.services().register(Arc::clone(self));
        if id == 0 {
            self.running.store(false, Ordering::Release);
            self.watcher.lock().take();
            return 0;
        }
        self.id.store(id, Ordering::Release);

        let mut handler = handler;
        if !handler.on_start(self) {
            kdebug!("service {:#x} refused to start", id);
            self.running.store(false, Ordering::Release);
            handler.on_stop();
            self.runtime.services().deregister(id);
            self.id.store(0, Ordering::Release);
            self.watcher.lock().take();
            self.discard_pending();
            return 0;
        }

        *self.handler.lock() = Some(Box::new(handler));
        watcher.start();
        self.notify();
        kdebug!("service {:#x} started", id);
        id
    }

    /// Queue the stop event. Everything queued before it is still
    /// delivered; later enqueues are refused.
    pub fn stop(&self) -> bool {
        if self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let event = ServiceEvent::signal(EVENT_SERVICE_STOP, self.id(), 0);
        self.depth.fetch_add(1, Ordering::AcqRel);
        self.queue.lock().push_back(event);
        self.notify();
        true
    }

    /// Append an event. False (and the event is dropped) once stopped.
    ///
    /// The running check is repeated under the queue lock, so nothing can
    /// land behind the `SERVICE_STOP` that `stop` pushes.
    pub fn enqueue(&self, event: ServiceEvent) -> bool {
        if !self.is_running() {
            return false;
        }
        {
            let mut queue = self.queue.lock();
            if !self.is_running() {
                return false;
            }
            self.depth.fetch_add(1, Ordering::AcqRel);
            queue.push_back(event);
        }
        self.notify();
        true
    }

    /// Copy `data` into a new event of `kind`
    pub fn send(&self, source_id: u32, data: &[u8], kind: u8, token: u32) -> bool {
        if data.len() > MAX_PAYLOAD {
            kwarn!("service {:#x}: payload of {} bytes dropped", self.id(), data.len());
            return false;
        }
        self.enqueue(ServiceEvent::message(kind, source_id, token, data))
    }

    /// Move `buf` into a new event of `kind` without copying
    pub fn send_move(&self, source_id: u32, buf: Vec<u8>, kind: u8, token: u32) -> bool {
        if buf.len() > MAX_PAYLOAD {
            kwarn!("service {:#x}: payload of {} bytes dropped", self.id(), buf.len());
            return false;
        }
        self.enqueue(ServiceEvent::moved(kind, source_id, token, buf))
    }

    /// Deliver `RUN_AFTER` with `token` once, `ms` from now
    pub fn run_after(self: &Arc<Self>, ms: u64, token: u32) -> Option<Arc<TimerWatcher>> {
        let watcher = TimerWatcher::new(self, token);
        watcher
            .start(true, Duration::from_millis(ms))
            .then_some(watcher)
    }

    /// Deliver `RUN_EVERY` with `token` every `ms` until stopped
    pub fn run_every(self: &Arc<Self>, ms: u64, token: u32) -> Option<Arc<TimerWatcher>> {
        let watcher = TimerWatcher::new(self, token);
        watcher
            .start(false, Duration::from_millis(ms))
            .then_some(watcher)
    }

    fn notify(&self) {
        let watcher = self.watcher.lock().clone();
        if let Some(watcher) = watcher {
            if watcher.notify() {
                self.runtime.service_notified();
            }
        }
    }

    fn reset_watcher(&self) {
        let watcher = self.watcher.lock().clone();
        if let Some(watcher) = watcher {
            watcher.reset();
        }
    }

    fn discard_pending(&self) {
        let dropped = std::mem::take(&mut *self.queue.lock());
        self.depth.fetch_sub(dropped.len() as u32, Ordering::AcqRel);
    }

    fn drain(self: &Arc<Self>) {
        self.runtime.service_woken();
        let mut handler = self.handler.lock();
        let monitor = self.runtime.monitor();

        loop {
            let batch = std::mem::take(&mut *self.queue.lock());
            if batch.is_empty() {
                self.reset_watcher();
                if self.queue_size() > 0 {
                    self.notify();
                }
                return;
            }

            let mut events = batch.into_iter();
            while let Some(event) = events.next() {
                self.depth.fetch_sub(1, Ordering::AcqRel);
                let slot = monitor.enter(
                    self.io().current_dispatcher(),
                    event.header.source_id,
                    self.id(),
                );
                let keep_going = self.dispatch(&mut handler, event);
                monitor.leave(slot);
                if !keep_going {
                    // the rest of the batch dies with the service
                    self.depth.fetch_sub(events.len() as u32, Ordering::AcqRel);
                    return;
                }
            }

            if self.queue_size() > 0 && self.runtime.waiting_services() > 0 {
                ktrace!("service {:#x} yields to waiting services", self.id());
                self.reset_watcher();
                self.notify();
                return;
            }
        }
    }

    /// Returns false for the stop event.
    fn dispatch(
        self: &Arc<Self>,
        slot: &mut SpinLockGuard<'_, HandlerSlot>,
        event: ServiceEvent,
    ) -> bool {
        let kind = event.header.kind();
        let event_type = kind & EVENT_TYPE_MASK;
        let source_id = event.header.source_id;
        let token = event.header.token;

        if event_type == EVENT_SERVICE_STOP {
            self.finish(slot);
            return false;
        }

        let Some(handler) = slot.as_mut() else {
            return true;
        };
        let deliver = |handler: &mut Box<dyn ServiceHandler>, kind: u8, source_id: u32, payload: &[u8]| {
            handler.on_event(
                self,
                Delivery {
                    kind,
                    source_id,
                    token,
                    payload,
                },
            )
        };

        match event_type {
            EVENT_MSG => {
                let msg = kind & EVENT_MSG_MASK;
                match msg {
                    MSG_REPLY | MSG_CALL | MSG_SEND | MSG_TEXT => {
                        deliver(handler, EVENT_MSG | msg, source_id, event.bytes());
                    }
                    MSG_PING | MSG_PONG | MSG_CLOSE => {
                        deliver(handler, EVENT_MSG | msg, source_id, &[]);
                    }
                    _ => ktrace!("service {:#x}: unknown message kind {:#x}", self.id(), kind),
                }
            }
            EVENT_RUN_AFTER | EVENT_RUN_EVERY => {
                if let Payload::Timer(watcher) = &event.payload {
                    if watcher.is_running() {
                        deliver(handler, event_type, source_id, &[]);
                    }
                }
            }
            EVENT_YIELD | EVENT_SEND_OK | EVENT_DISCONNECT => {
                deliver(handler, event_type, source_id, &[]);
            }
            EVENT_ACCEPT | EVENT_CONNECT => match event.payload {
                Payload::Connection { conn, extra } => {
                    if event_type == EVENT_CONNECT && !conn.is_connecting() {
                        drop(conn);
                        deliver(handler, event_type, 0, &[]);
                    } else {
                        let channel = Channel::new(&self.runtime, conn);
                        let channel_id = channel.id();
                        if !deliver(handler, event_type, channel_id, &extra) {
                            channel.close(0);
                        }
                    }
                }
                _ => {
                    deliver(handler, event_type, 0, &[]);
                }
            },
            EVENT_DNS | EVENT_BINARY | EVENT_COMMAND => {
                deliver(handler, event_type, source_id, event.bytes());
            }
            _ => ktrace!("service {:#x}: unknown event kind {:#x}", self.id(), kind),
        }
        true
    }

    /// Stop event: run `on_stop`, drop the registration, retire the watcher
    fn finish(&self, slot: &mut SpinLockGuard<'_, HandlerSlot>) {
        if let Some(mut handler) = slot.take() {
            handler.on_stop();
        }
        let id = self.id.swap(0, Ordering::AcqRel);
        if id != 0 {
            self.runtime.services().deregister(id);
        }
        let watcher = self.watcher.lock().take();
        if let Some(watcher) = watcher {
            watcher.reset();
            watcher.close();
        }
        self.discard_pending();
        kdebug!("service {:#x} stopped", id);
    }
}
