// src/logging.rs
// Minimal stderr logging for an embedded library: a global severity
// threshold and three macros. Nothing here reads the environment.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Message severity. The global threshold admits a level and everything
/// more severe than it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
}

impl LogLevel {
    fn rank(self) -> u8 {
        match self {
            LogLevel::Error => 0,
            LogLevel::Warn => 1,
            LogLevel::Info => 2,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
        })
    }
}

// Warnings and errors by default.
static THRESHOLD: AtomicU8 = AtomicU8::new(1);

pub fn set_log_level(level: LogLevel) {
    THRESHOLD.store(level.rank(), Ordering::Relaxed);
}

pub fn log_level() -> LogLevel {
    match THRESHOLD.load(Ordering::Relaxed) {
        0 => LogLevel::Error,
        1 => LogLevel::Warn,
        _ => LogLevel::Info,
    }
}

#[inline]
pub fn enabled(level: LogLevel) -> bool {
    level.rank() <= THRESHOLD.load(Ordering::Relaxed)
}

#[doc(hidden)]
pub fn emit(level: LogLevel, target: &str, args: fmt::Arguments<'_>) {
    if enabled(level) {
        eprintln!("{level} {target}: {args}");
    }
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::logging::emit(
            $crate::logging::LogLevel::Error,
            module_path!(),
            format_args!($($arg)*),
        )
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::logging::emit(
            $crate::logging::LogLevel::Warn,
            module_path!(),
            format_args!($($arg)*),
        )
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logging::emit(
            $crate::logging::LogLevel::Info,
            module_path!(),
            format_args!($($arg)*),
        )
    };
}
