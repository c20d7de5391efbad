//! # svcio - service mailboxes over a multi-threaded reactor
//!
//! Services are reference-counted mailboxes. Any thread may post events to
//! a service; the reactor's dispatch threads drain each mailbox with at most
//! one drain in flight per service, so a service's handler never runs
//! concurrently with itself.
//!
//! ## Quick Start
//!
//! ```ignore
//! use svcio::{Runtime, ReactorConfig, Service, Delivery, EVENT_MSG, MSG_TEXT};
//!
//! fn main() {
//!     let mut runtime = Runtime::new(ReactorConfig::from_env().concurrent_threads(2)).unwrap();
//!     runtime.start().unwrap();
//!
//!     let echo = Service::new(runtime.services());
//!     let id = echo.start(|_svc: &std::sync::Arc<Service>, ev: Delivery<'_>| {
//!         println!("{:#x} says {:?}", ev.source_id, ev.payload);
//!         true
//!     });
//!     assert_ne!(id, 0);
//!     echo.send(0, b"hello", EVENT_MSG | MSG_TEXT, 0);
//!
//!     runtime.shutdown();
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │   Service / Channel / TimerWatcher     (this crate)      │
//! │   mailbox FIFO, event envelope, handle registries        │
//! └──────────────────────────────────────────────────────────┘
//!                             │ EventWatcher / EventTimer
//!                             ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │   EventIo reactor                      (svcio-runtime)   │
//! │   job queue, timer heap, wake channel, dispatch threads  │
//! └──────────────────────────────────────────────────────────┘
//!                             │
//!                             ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │   locks, handle layout, kprint, env    (svcio-core)      │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod event;
pub mod registry;
pub mod service_center;
pub mod channel_center;
pub mod service;
pub mod channel;
pub mod codec;
pub mod timer_watcher;
pub mod monitor;
pub mod runtime;

pub use channel::{Channel, ChannelStatus, Connection, ConnectionHandler};
pub use channel_center::ChannelCenter;
pub use codec::{Codec, LengthPrefixed};
pub use event::*;
pub use monitor::ServiceMonitor;
pub use registry::SlotTable;
pub use runtime::ServiceRuntime;
pub use service::{Service, ServiceHandler};
pub use service_center::ServiceCenter;
pub use timer_watcher::TimerWatcher;

// Re-export core types
pub use svcio_core::{
    ClhLock, Handle, McsLock, RwSpinLock, SpawnError, SpinLock, SvcError, SvcResult,
};

// Re-export kprint macros for logging
pub use svcio_core::{kdebug, kerror, kinfo, kprint, kprintln, ktrace, kwarn};
pub use svcio_core::kprint::{init as init_logging, set_flush_enabled, set_log_level, LogLevel};

// Re-export env utilities
pub use svcio_core::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};

// Re-export reactor types
pub use svcio_runtime::{
    EventIo, EventIoThread, EventTimer, EventWatcher, ReactorConfig, ThreadStatus,
};

use std::sync::Arc;

/// A reactor, its dispatch threads and a service runtime in one handle
///
/// `concurrent_threads` dispatch threads are spawned by `start()`; 0 is
/// treated as one.
pub struct Runtime {
    services: Arc<ServiceRuntime>,
    threads: Vec<EventIoThread>,
}

impl Runtime {
    /// Validate `config` and build the reactor. No thread runs yet.
    pub fn new(config: ReactorConfig) -> SvcResult<Self> {
        let io = EventIo::new(config.clone())?;
        let services = ServiceRuntime::new(io, &config);
        Ok(Self {
            services,
            threads: Vec::new(),
        })
    }

    pub fn services(&self) -> &Arc<ServiceRuntime> {
        &self.services
    }

    pub fn io(&self) -> &Arc<EventIo> {
        self.services.io()
    }

    /// Spawn the dispatch threads and wait until they are idle
    pub fn start(&mut self) -> SvcResult<()> {
        if !self.threads.is_empty() {
            return Err(SvcError::AlreadyRunning);
        }
        if !self.io().is_running() {
            return Err(SvcError::NotRunning);
        }
        let n = self.io().config().concurrent_threads.max(1);
        for i in 0..n {
            let thread = EventIoThread::new(self.io(), format!("svcio-{}", i));
            thread.start(true)?;
            self.threads.push(thread);
        }
        kdebug!("runtime started with {} dispatch threads", n);
        Ok(())
    }

    /// Start, run `f`, then shut down
    pub fn block_on<F, T>(&mut self, f: F) -> SvcResult<T>
    where
        F: FnOnce(&Arc<ServiceRuntime>) -> T,
    {
        self.start()?;
        let result = f(&self.services);
        self.shutdown();
        Ok(result)
    }

    /// Stop every service, let the stop events drain, then stop the
    /// reactor and join the dispatch threads
    pub fn shutdown(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        self.services.shutdown();
        let deadline = std::time::Instant::now() + self.io().config().start_timeout;
        while !self.services.services().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        for thread in self.threads.drain(..) {
            thread.stop(true);
        }
        self.services.clear();
        kdebug!("runtime shut down");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_block_on_round_trip() {
        let config = ReactorConfig::new()
            .concurrent_threads(2)
            .max_wait(Duration::from_millis(10));
        let mut runtime = Runtime::new(config).unwrap();
        let stops = Arc::new(AtomicUsize::new(0));

        struct Count(Arc<AtomicUsize>, Arc<AtomicUsize>);
        impl ServiceHandler for Count {
            fn on_event(&mut self, _: &Arc<Service>, _: Delivery<'_>) -> bool {
                self.0.fetch_add(1, Ordering::SeqCst);
                true
            }
            fn on_stop(&mut self) {
                self.1.fetch_add(1, Ordering::SeqCst);
            }
        }

        let seen = Arc::new(AtomicUsize::new(0));
        let (s, st) = (Arc::clone(&seen), Arc::clone(&stops));
        runtime
            .block_on(move |rt| {
                let service = Service::new(rt);
                assert_ne!(service.start(Count(s, st)), 0);
                for i in 0..10u32 {
                    service.send(0, &i.to_ne_bytes(), EVENT_MSG | MSG_SEND, 0);
                }
            })
            .unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 10);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert!(runtime.services().services().is_empty());
    }

    #[test]
    fn test_start_twice() {
        let config = ReactorConfig::new().max_wait(Duration::from_millis(10));
        let mut runtime = Runtime::new(config).unwrap();
        runtime.start().unwrap();
        assert_eq!(runtime.start(), Err(SvcError::AlreadyRunning));
        runtime.shutdown();
    }

    #[test]
    fn test_invalid_config() {
        let config = ReactorConfig::new().registry_initial_capacity(0);
        assert!(matches!(Runtime::new(config), Err(SvcError::InvalidConfig(_))));
    }
}
