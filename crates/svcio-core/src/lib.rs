//! # svcio-core
//!
//! Platform-agnostic building blocks for the svcio reactor and service
//! runtime.
//!
//! ## Modules
//!
//! - `backoff` - Bounded spin-then-yield wait helper
//! - `spinlock` - Test-and-set spin lock
//! - `clh` - CLH queue lock (spins on the predecessor's node)
//! - `mcs` - MCS queue lock (spins on its own node)
//! - `rwlock` - Reader/writer spin lock with upgrade, one state word
//! - `handle` - 32-bit registry handle layout
//! - `error` - Error types
//! - `kprint` - Kernel-style leveled logging macros
//! - `env` - Environment variable utilities

pub mod backoff;
pub mod spinlock;
pub mod clh;
pub mod mcs;
pub mod rwlock;
pub mod handle;
pub mod error;
pub mod kprint;
pub mod env;

pub use backoff::Backoff;
pub use spinlock::{SpinLock, SpinLockGuard};
pub use clh::{ClhGuard, ClhLock};
pub use mcs::{McsGuard, McsLock};
pub use rwlock::{RawRwSpinLock, ReadGuard, RwSpinLock, UpgradableGuard, WriteGuard};
pub use handle::Handle;
pub use error::{SpawnError, SvcError, SvcResult};
pub use env::{env_get, env_get_bool, env_get_ms, env_get_opt, env_get_str, env_is_set};
pub use kprint::{set_log_level, LogLevel};
