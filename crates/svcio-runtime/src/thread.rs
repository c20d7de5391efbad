//! Dispatch thread wrapper
//!
//! An `EventIoThread` owns one OS thread running [`EventIo::dispatch`].
//! Status moves Starting -> Running -> Stopping -> Stopped; a stop issued
//! before the thread reaches Running wins and the thread exits without
//! dispatching.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use svcio_core::error::{SpawnError, SvcError, SvcResult};
use svcio_core::kprint::{clear_thread_tag, set_thread_tag};
use svcio_core::{kdebug, kwarn};

use crate::event_io::EventIo;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Starting = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl ThreadStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ThreadStatus::Starting,
            1 => ThreadStatus::Running,
            2 => ThreadStatus::Stopping,
            _ => ThreadStatus::Stopped,
        }
    }
}

/// Runs on the new thread before dispatching; returning false stops the
/// reactor.
pub type PreHook = Box<dyn FnOnce(&Arc<EventIo>) -> bool + Send>;
/// Runs on the thread after dispatch returns
pub type PostHook = Box<dyn FnOnce(&Arc<EventIo>) + Send>;

struct Shared {
    status: AtomicU8,
    hook_failed: AtomicBool,
}

impl Shared {
    fn status(&self) -> ThreadStatus {
        ThreadStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn transition(&self, from: ThreadStatus, to: ThreadStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

pub struct EventIoThread {
    io: Arc<EventIo>,
    name: String,
    shared: Arc<Shared>,
    pre: Mutex<Option<PreHook>>,
    post: Mutex<Option<PostHook>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EventIoThread {
    pub fn new(io: &Arc<EventIo>, name: impl Into<String>) -> Self {
        Self {
            io: Arc::clone(io),
            name: name.into(),
            shared: Arc::new(Shared {
                status: AtomicU8::new(ThreadStatus::Starting as u8),
                hook_failed: AtomicBool::new(false),
            }),
            pre: Mutex::new(None),
            post: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    pub fn with_hooks<P, Q>(self, pre: P, post: Q) -> Self
    where
        P: FnOnce(&Arc<EventIo>) -> bool + Send + 'static,
        Q: FnOnce(&Arc<EventIo>) + Send + 'static,
    {
        *self.pre.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(pre));
        *self.post.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(post));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn io(&self) -> &Arc<EventIo> {
        &self.io
    }

    pub fn status(&self) -> ThreadStatus {
        self.shared.status()
    }

    /// Spawn the dispatch thread. With `wait`, block until it is dispatching
    /// and every thread started on this reactor (capped at the configured
    /// concurrency) sits idle, or until it has already finished.
    pub fn start(&self, wait: bool) -> SvcResult<()> {
        let mut slot = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return Err(SvcError::AlreadyRunning);
        }

        let io = Arc::clone(&self.io);
        let shared = Arc::clone(&self.shared);
        let pre = self.pre.lock().unwrap_or_else(|e| e.into_inner()).take();
        let post = self.post.lock().unwrap_or_else(|e| e.into_inner()).take();
        let tag = self.name.clone();

        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || thread_main(io, shared, tag, pre, post))
            .map_err(|_| SpawnError::ThreadSpawnFailed)?;
        *slot = Some(handle);
        drop(slot);

        let attached = self.io.attach_thread();
        if wait {
            self.wait_started(attached)?;
        }
        Ok(())
    }

    fn wait_started(&self, attached: usize) -> SvcResult<()> {
        let target = attached.min(self.io.concurrent_threads().max(1));
        let deadline = Instant::now() + self.io.config().start_timeout;
        loop {
            match self.shared.status() {
                ThreadStatus::Stopped | ThreadStatus::Stopping => {
                    if self.shared.hook_failed.load(Ordering::Acquire) {
                        return Err(SpawnError::StartHookFailed.into());
                    }
                    return Ok(());
                }
                ThreadStatus::Running if self.io.idle_threads() >= target => return Ok(()),
                _ => {}
            }
            if Instant::now() >= deadline {
                kwarn!(
                    "{}: start barrier timed out ({} of {} idle)",
                    self.name,
                    self.io.idle_threads(),
                    target
                );
                return Ok(());
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Request stop and shut the reactor down. Returns false if the thread
    /// was already stopping or stopped.
    pub fn stop(&self, join: bool) -> bool {
        let requested = self
            .shared
            .transition(ThreadStatus::Starting, ThreadStatus::Stopping)
            || self
                .shared
                .transition(ThreadStatus::Running, ThreadStatus::Stopping);
        if requested {
            kdebug!("{}: stop requested", self.name);
            self.io.stop_loop();
        }
        if join {
            self.join();
        }
        requested
    }

    /// Wait for the thread to exit. Safe to call repeatedly and from
    /// several threads.
    pub fn join(&self) {
        let mut slot = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = slot.take() {
            if handle.thread().id() == thread::current().id() {
                // joining ourselves would deadlock; let the thread finish
                *slot = Some(handle);
                return;
            }
            if handle.join().is_err() {
                kwarn!("{}: dispatch thread panicked", self.name);
            }
        }
    }
}

impl Drop for EventIoThread {
    fn drop(&mut self) {
        self.stop(true);
    }
}

fn thread_main(
    io: Arc<EventIo>,
    shared: Arc<Shared>,
    tag: String,
    pre: Option<PreHook>,
    post: Option<PostHook>,
) {
    if !shared.transition(ThreadStatus::Starting, ThreadStatus::Running) {
        shared
            .status
            .store(ThreadStatus::Stopped as u8, Ordering::Release);
        return;
    }
    set_thread_tag(tag.as_str());
    kdebug!("dispatch thread running");

    if let Some(pre) = pre {
        if !pre(&io) {
            kwarn!("pre-start hook failed, stopping reactor");
            shared.hook_failed.store(true, Ordering::Release);
            io.stop_loop();
            shared
                .status
                .store(ThreadStatus::Stopped as u8, Ordering::Release);
            clear_thread_tag();
            return;
        }
    }

    io.dispatch();

    if let Some(post) = post {
        post(&io);
    }
    kdebug!("dispatch thread stopped");
    clear_thread_tag();
    shared
        .status
        .store(ThreadStatus::Stopped as u8, Ordering::Release);
}
