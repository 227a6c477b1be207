//! Log sink for allocator diagnostics.
//!
//! The allocator reports dumps ([`DrmMm::debug_table`](crate::DrmMm::debug_table)),
//! takedown of a dirty allocator and contract violations through a single
//! leveled sink. The embedding kernel registers its logger with
//! [`set_log_fn`]; until then output is silently discarded.

use core::fmt;
use core::sync::atomic::{AtomicPtr, Ordering};

/// Severity of an allocator log message. Lower is more severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    /// A caller broke the allocator contract; a panic follows.
    Error = 0,
    /// Unexpected but survivable state, e.g. takedown of a dirty allocator.
    Warn = 1,
    /// High-level progress.
    Info = 2,
    /// Allocator dumps.
    Debug = 3,
    /// Per-operation tracing (insert/remove/scan).
    Trace = 4,
}

impl LogLevel {
    /// Returns the fixed-width name used as a line prefix.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN ",
            Self::Info => "INFO ",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }
}

/// The signature of the log sink.
pub type LogFn = fn(LogLevel, fmt::Arguments<'_>);

fn null_log(_level: LogLevel, _args: fmt::Arguments<'_>) {}

static LOG_FN: AtomicPtr<()> = AtomicPtr::new(null_log as *mut ());

/// Registers the log sink. May be called more than once; the last
/// registration wins.
pub fn set_log_fn(f: LogFn) {
    LOG_FN.store(f as *mut (), Ordering::Release);
}

/// Restores the default sink, which discards everything.
pub fn clear_log_fn() {
    set_log_fn(null_log);
}

#[inline]
fn load_log_fn() -> LogFn {
    let ptr = LOG_FN.load(Ordering::Acquire);
    // SAFETY: only `LogFn` pointers are ever stored into LOG_FN.
    unsafe { core::mem::transmute::<*mut (), LogFn>(ptr) }
}

/// Implementation detail of the logging macros. Not public API.
#[doc(hidden)]
pub fn _log(level: LogLevel, args: fmt::Arguments<'_>) {
    load_log_fn()(level, args);
}

macro_rules! mm_log {
    ($level:expr, $($arg:tt)*) => {
        $crate::log::_log($level, format_args!($($arg)*))
    };
}

macro_rules! mm_error {
    ($($arg:tt)*) => { $crate::log::mm_log!($crate::log::LogLevel::Error, $($arg)*) };
}

macro_rules! mm_warn {
    ($($arg:tt)*) => { $crate::log::mm_log!($crate::log::LogLevel::Warn, $($arg)*) };
}

macro_rules! mm_debug {
    ($($arg:tt)*) => { $crate::log::mm_log!($crate::log::LogLevel::Debug, $($arg)*) };
}

macro_rules! mm_trace {
    ($($arg:tt)*) => { $crate::log::mm_log!($crate::log::LogLevel::Trace, $($arg)*) };
}

pub(crate) use {mm_debug, mm_error, mm_log, mm_trace, mm_warn};
