//! Two-sink leveled logging on top of the `log` facade.
//!
//! Messages go to stderr and/or a user-supplied callback, each gated by its
//! own minimum level. The two sinks exist so that an embedding application
//! can silence console output entirely while still receiving diagnostics
//! through the callback.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use once_cell::sync::Lazy;

/// Verbosity levels, ordered from quietest to loudest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum LogLevel {
    Disable = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    fn from_u32(value: u32) -> LogLevel {
        match value {
            0 => LogLevel::Disable,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    fn from_record(level: log::Level) -> LogLevel {
        match level {
            log::Level::Error => LogLevel::Error,
            log::Level::Warn => LogLevel::Warn,
            log::Level::Info => LogLevel::Info,
            log::Level::Debug => LogLevel::Debug,
            log::Level::Trace => LogLevel::Trace,
        }
    }

    fn to_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Disable => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

/// Callback sink invoked for every message at or below the callback level.
pub type LogCallback = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

static STDERR_LEVEL: AtomicU32 = AtomicU32::new(LogLevel::Warn as u32);
static CALLBACK_LEVEL: AtomicU32 = AtomicU32::new(LogLevel::Disable as u32);
static CALLBACK: Lazy<Mutex<Option<LogCallback>>> = Lazy::new(|| Mutex::new(None));

struct JitLogger;

static LOGGER: JitLogger = JitLogger;

impl log::Log for JitLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        let level = LogLevel::from_record(metadata.level());
        level <= stderr_level() || level <= callback_level()
    }

    fn log(&self, record: &log::Record<'_>) {
        let level = LogLevel::from_record(record.level());
        if level <= stderr_level() {
            eprintln!("jit: {}", record.args());
        }
        if level <= callback_level() {
            let guard = CALLBACK.lock().expect("log callback poisoned");
            if let Some(cb) = guard.as_ref() {
                cb(level, &record.args().to_string());
            }
        }
    }

    fn flush(&self) {}
}

/// Installs the logger. Safe to call repeatedly; only the first call wins.
pub(crate) fn install() {
    let _ = log::set_logger(&LOGGER);
    refresh_max_level();
}

fn refresh_max_level() {
    let max = stderr_level().max(callback_level());
    log::set_max_level(max.to_filter());
}

/// Sets the minimum level for messages printed to stderr.
pub fn set_stderr_level(level: LogLevel) {
    STDERR_LEVEL.store(level as u32, Ordering::Relaxed);
    refresh_max_level();
}

/// Returns the current stderr log level.
pub fn stderr_level() -> LogLevel {
    LogLevel::from_u32(STDERR_LEVEL.load(Ordering::Relaxed))
}

/// Installs (or clears, with `None`) the callback sink and its level.
pub fn set_callback(level: LogLevel, callback: Option<LogCallback>) {
    *CALLBACK.lock().expect("log callback poisoned") = callback;
    CALLBACK_LEVEL.store(level as u32, Ordering::Relaxed);
    refresh_max_level();
}

/// Returns the current callback log level.
pub fn callback_level() -> LogLevel {
    LogLevel::from_u32(CALLBACK_LEVEL.load(Ordering::Relaxed))
}
