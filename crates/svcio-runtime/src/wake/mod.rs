//! Wake channel: breaks dispatch threads out of their blocking wait
//!
//! The reactor's dispatchers block in [`WakeChannel::wait`] until a job is
//! posted, the next timer is due, or the reactor stops. Platform
//! implementations use the cheapest pollable primitive available.

use std::time::Duration;

use svcio_core::error::SvcResult;

pub trait WakeChannel: Send + Sync {
    /// Block until woken or `timeout` elapses (`None` = no limit).
    ///
    /// Returns `true` if a wake signal was consumed. Callers re-check their
    /// queues regardless of the result.
    fn wait(&self, timeout: Option<Duration>) -> bool;

    /// Signal one pending wake. Signals are counted, never lost.
    fn wake(&self);

    /// Release every current and future waiter immediately. Used on stop.
    fn wake_all(&self);
}

mod fallback;
pub use fallback::CondvarWake;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod eventfd_linux;
        pub use eventfd_linux::EventFdWake as PlatformWake;
    } else if #[cfg(unix)] {
        mod pipe_unix;
        pub use pipe_unix::PipeWake as PlatformWake;
    } else {
        pub use fallback::CondvarWake as PlatformWake;
    }
}

/// Create the platform wake channel
pub fn new_wake_channel() -> SvcResult<Box<dyn WakeChannel>> {
    Ok(Box::new(PlatformWake::new()?))
}

/// Poll timeout in milliseconds: -1 for none, sub-millisecond rounds up
#[cfg(unix)]
pub(crate) fn poll_timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) if d.is_zero() => 0,
        Some(d) => {
            let ms = d.as_millis().max(1);
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}
