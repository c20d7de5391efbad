//! Environment variable helpers used by the `from_env()` configuration
//!
//! ```ignore
//! use svcio_core::env::{env_get, env_get_bool};
//!
//! let threads: usize = env_get("SVCIO_CONCURRENT_THREADS", 2);
//! let wait_ms: u64 = env_get("SVCIO_MAX_WAIT_MS", 100);
//! let monitor = env_get_bool("SVCIO_MONITOR", false);
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`, falling back to `default` when unset or unparsable
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// "1", "true", "yes", "on" (any case) are true; other values are false;
/// unset returns `default`
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Milliseconds variable as a `Duration`
#[inline]
pub fn env_get_ms(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_get(key, default_ms))
}

#[inline]
pub fn env_is_set(key: &str) -> bool {
    std::env::var(key).is_ok()
}
