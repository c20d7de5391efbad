//! Reactor and registry configuration
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls
//! 2. Environment variables (`from_env()` only)
//! 3. `SVCIO_CONFIG_RS` file merged at build time
//! 4. Library defaults
//!
//! ```rust,ignore
//! use svcio_runtime::config::ReactorConfig;
//!
//! let config = ReactorConfig::from_env()
//!     .concurrent_threads(4)
//!     .max_wait(Duration::from_millis(20));
//! ```

pub mod defaults;

use std::time::Duration;

use svcio_core::env::{env_get, env_get_ms};
use svcio_core::handle::MAX_SLOTS;

#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Dispatch threads registered with the reactor. 0 means a single
    /// dispatcher that is not counted as a pool.
    pub concurrent_threads: usize,
    /// Longest single blocking wait, so a dispatcher re-checks its state
    /// even when nothing wakes it
    pub max_wait: Duration,
    /// Slots allocated by a registry on creation
    pub registry_initial_capacity: usize,
    /// Registry growth cap
    pub registry_max_slots: usize,
    /// Tick of the drain-stall monitor
    pub monitor_interval: Duration,
    /// Upper bound for `EventIoThread::start(true)` to wait on the barrier
    pub start_timeout: Duration,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ReactorConfig {
    /// Compile-time defaults only, no environment lookup
    pub fn new() -> Self {
        Self {
            concurrent_threads: defaults::CONCURRENT_THREADS,
            max_wait: Duration::from_millis(defaults::MAX_WAIT_MS),
            registry_initial_capacity: defaults::REGISTRY_INITIAL_CAPACITY,
            registry_max_slots: defaults::REGISTRY_MAX_SLOTS,
            monitor_interval: Duration::from_millis(defaults::MONITOR_INTERVAL_MS),
            start_timeout: Duration::from_millis(defaults::START_TIMEOUT_MS),
        }
    }

    /// Defaults overridden by environment variables (all optional):
    /// - `SVCIO_CONCURRENT_THREADS`
    /// - `SVCIO_MAX_WAIT_MS`
    /// - `SVCIO_REGISTRY_INITIAL_CAPACITY`
    /// - `SVCIO_REGISTRY_MAX_SLOTS`
    /// - `SVCIO_MONITOR_INTERVAL_MS`
    /// - `SVCIO_START_TIMEOUT_MS`
    pub fn from_env() -> Self {
        Self {
            concurrent_threads: env_get("SVCIO_CONCURRENT_THREADS", defaults::CONCURRENT_THREADS),
            max_wait: env_get_ms("SVCIO_MAX_WAIT_MS", defaults::MAX_WAIT_MS),
            registry_initial_capacity: env_get(
                "SVCIO_REGISTRY_INITIAL_CAPACITY",
                defaults::REGISTRY_INITIAL_CAPACITY,
            ),
            registry_max_slots: env_get("SVCIO_REGISTRY_MAX_SLOTS", defaults::REGISTRY_MAX_SLOTS),
            monitor_interval: env_get_ms("SVCIO_MONITOR_INTERVAL_MS", defaults::MONITOR_INTERVAL_MS),
            start_timeout: env_get_ms("SVCIO_START_TIMEOUT_MS", defaults::START_TIMEOUT_MS),
        }
    }

    pub fn concurrent_threads(mut self, n: usize) -> Self {
        self.concurrent_threads = n;
        self
    }

    pub fn max_wait(mut self, d: Duration) -> Self {
        self.max_wait = d;
        self
    }

    pub fn registry_initial_capacity(mut self, n: usize) -> Self {
        self.registry_initial_capacity = n;
        self
    }

    pub fn registry_max_slots(mut self, n: usize) -> Self {
        self.registry_max_slots = n;
        self
    }

    pub fn monitor_interval(mut self, d: Duration) -> Self {
        self.monitor_interval = d;
        self
    }

    pub fn start_timeout(mut self, d: Duration) -> Self {
        self.start_timeout = d;
        self
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.max_wait.is_zero() {
            return Err("max_wait must be non-zero");
        }
        if self.registry_initial_capacity == 0 {
            return Err("registry_initial_capacity must be at least 1");
        }
        if self.registry_max_slots > MAX_SLOTS {
            return Err("registry_max_slots exceeds the handle index range");
        }
        if self.registry_initial_capacity > self.registry_max_slots {
            return Err("registry_initial_capacity exceeds registry_max_slots");
        }
        if self.monitor_interval.is_zero() {
            return Err("monitor_interval must be non-zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let c = ReactorConfig::new();
        assert_eq!(c.registry_initial_capacity, 64);
        assert_eq!(c.registry_max_slots, MAX_SLOTS);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_builder_and_validation() {
        let c = ReactorConfig::new().registry_initial_capacity(0);
        assert!(c.validate().is_err());

        let c = ReactorConfig::new().registry_max_slots(MAX_SLOTS + 1);
        assert!(c.validate().is_err());

        let c = ReactorConfig::new()
            .concurrent_threads(3)
            .registry_initial_capacity(4)
            .registry_max_slots(8)
            .max_wait(Duration::from_millis(5));
        assert!(c.validate().is_ok());
        assert_eq!(c.concurrent_threads, 3);
    }

    #[test]
    fn test_from_env_override() {
        std::env::set_var("SVCIO_MAX_WAIT_MS", "7");
        let c = ReactorConfig::from_env();
        assert_eq!(c.max_wait, Duration::from_millis(7));
        std::env::remove_var("SVCIO_MAX_WAIT_MS");
    }
}
