//! # svcio-runtime
//!
//! Multi-threaded reactor for the svcio service runtime.
//!
//! This crate provides:
//! - The reactor (`EventIo`): cross-thread job posting with post-or-cancel
//! - Timers on a shared min-heap
//! - Coalescing event watchers
//! - Dispatch thread management with a start barrier
//! - Platform wake channels (eventfd, self-pipe, condvar)

pub mod config;
pub mod wake;
pub mod event_io;
pub mod timer;
pub mod watcher;
pub mod thread;

// Re-exports
pub use config::ReactorConfig;
pub use event_io::{EventIo, QueuedEvent};
pub use timer::EventTimer;
pub use watcher::{EventWatcher, WatcherStatus};
pub use thread::{EventIoThread, ThreadStatus};
pub use wake::{new_wake_channel, WakeChannel};
