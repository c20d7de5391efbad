//! Kernel-style leveled logging to stderr
//!
//! Each line is written under the stderr lock so lines from different
//! dispatch threads never interleave. Threads can carry a short tag (the
//! reactor thread name, a service id) that is printed after the level.
//!
//! # Environment Variables
//!
//! - `SVCIO_LOG_LEVEL=<level>` - off, error, warn, info, debug, trace (or 0-5)
//! - `SVCIO_FLUSH_EPRINT=1` - Flush stderr after each line
//!
//! ```ignore
//! use svcio_core::{kdebug, kwarn};
//!
//! kdebug!("service {} started", id);
//! kwarn!("registry full ({} slots)", cap);
//! ```

use std::cell::RefCell;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" | "0" => Some(LogLevel::Off),
            "error" | "1" => Some(LogLevel::Error),
            "warn" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

thread_local! {
    static THREAD_TAG: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Read `SVCIO_LOG_LEVEL` / `SVCIO_FLUSH_EPRINT`. Runs once; later calls
/// are no-ops. Called lazily by the first log line.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    if let Ok(val) = std::env::var("SVCIO_FLUSH_EPRINT") {
        let flush = matches!(val.as_str(), "1" | "true" | "yes" | "on");
        FLUSH_ENABLED.store(flush, Ordering::Relaxed);
    }
    if let Some(level) = std::env::var("SVCIO_LOG_LEVEL")
        .ok()
        .and_then(|v| LogLevel::parse(&v))
    {
        LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    }
}

#[inline]
pub fn flush_enabled() -> bool {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    FLUSH_ENABLED.load(Ordering::Relaxed)
}

#[inline]
pub fn log_level() -> LogLevel {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Override the level; wins over the environment
pub fn set_log_level(level: LogLevel) {
    INITIALIZED.store(true, Ordering::SeqCst);
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn set_flush_enabled(enabled: bool) {
    FLUSH_ENABLED.store(enabled, Ordering::Relaxed);
}

#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level != LogLevel::Off && level as u8 <= log_level() as u8
}

/// Tag every line this thread logs, e.g. `io-0`
pub fn set_thread_tag(tag: impl Into<String>) {
    let tag = tag.into();
    let _ = THREAD_TAG.try_with(|t| *t.borrow_mut() = Some(tag));
}

pub fn clear_thread_tag() {
    let _ = THREAD_TAG.try_with(|t| *t.borrow_mut() = None);
}

#[doc(hidden)]
pub fn _kprint_impl(args: std::fmt::Arguments<'_>, newline: bool) {
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = handle.write_fmt(args);
    if newline {
        let _ = handle.write_all(b"\n");
    }
    if flush_enabled() {
        let _ = handle.flush();
    }
}

#[doc(hidden)]
pub fn _klog_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }
    let tag = THREAD_TAG
        .try_with(|t| t.borrow().clone())
        .ok()
        .flatten();

    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = match tag {
        Some(tag) => write!(handle, "{} [{}] ", level.prefix(), tag),
        None => write!(handle, "{} ", level.prefix()),
    };
    let _ = handle.write_fmt(args);
    let _ = handle.write_all(b"\n");
    if flush_enabled() {
        let _ = handle.flush();
    }
}

/// Print to stderr (no newline)
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {{
        $crate::kprint::_kprint_impl(format_args!($($arg)*), false);
    }};
}

/// Print to stderr with newline
#[macro_export]
macro_rules! kprintln {
    () => {{
        $crate::kprint::_kprint_impl(format_args!(""), true);
    }};
    ($($arg:tt)*) => {{
        $crate::kprint::_kprint_impl(format_args!($($arg)*), true);
    }};
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::Error, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::Warn, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::Info, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::Debug, format_args!($($arg)*));
    }};
}

/// Per-event detail; the most verbose level
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::Trace, format_args!($($arg)*));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parse() {
        assert_eq!(LogLevel::parse("DEBUG"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("2"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("loud"), None);
        assert_eq!(LogLevel::from_u8(99), LogLevel::Trace);
        assert!(LogLevel::Error < LogLevel::Trace);
    }

    #[test]
    fn test_off_is_never_enabled() {
        assert!(!level_enabled(LogLevel::Off));
    }

    #[test]
    fn test_macros_compile() {
        set_log_level(LogLevel::Off);
        set_thread_tag("test");
        kprint!("");
        kerror!("error {}", "msg");
        kwarn!("warn");
        kinfo!("info");
        kdebug!("debug {}", 1);
        ktrace!("trace");
        clear_thread_tag();
    }
}
