//! Error types for svcio
//!
//! Hot paths (enqueue, post, lookup) do not use these: they report with
//! `bool`, `Option` or the 0 handle. `SvcError` covers the places where the
//! environment itself can fail.

use core::fmt;

/// Result type for svcio operations
pub type SvcResult<T> = Result<T, SvcError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SvcError {
    /// Slot table hit its capacity cap with no free slot
    RegistryFull,

    /// Object is not running (stopped reactor, stopped service, closed channel)
    NotRunning,

    /// Start requested on an object that is already running
    AlreadyRunning,

    /// Configuration rejected by `validate()`
    InvalidConfig(&'static str),

    /// Worker thread could not be brought up
    Spawn(SpawnError),

    /// OS call failed with this errno
    Os(i32),
}

impl fmt::Display for SvcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SvcError::RegistryFull => write!(f, "registry full"),
            SvcError::NotRunning => write!(f, "not running"),
            SvcError::AlreadyRunning => write!(f, "already running"),
            SvcError::InvalidConfig(why) => write!(f, "invalid config: {}", why),
            SvcError::Spawn(e) => write!(f, "spawn error: {}", e),
            SvcError::Os(errno) => write!(f, "os error: {}", errno),
        }
    }
}

impl std::error::Error for SvcError {}

/// Worker thread start-up errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnError {
    /// The OS refused to create the thread
    ThreadSpawnFailed,

    /// The thread's pre-dispatch hook reported failure
    StartHookFailed,
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::ThreadSpawnFailed => write!(f, "failed to spawn thread"),
            SpawnError::StartHookFailed => write!(f, "start hook failed"),
        }
    }
}

impl From<SpawnError> for SvcError {
    fn from(e: SpawnError) -> Self {
        SvcError::Spawn(e)
    }
}

impl From<std::io::Error> for SvcError {
    fn from(e: std::io::Error) -> Self {
        SvcError::Os(e.raw_os_error().unwrap_or(0))
    }
}

impl SvcError {
    /// Capture the calling thread's errno
    pub fn last_os_error() -> Self {
        SvcError::Os(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }
}
