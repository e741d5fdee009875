use crate::ffi::TunnelLogSink;
use bitflags::bitflags;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::ffi::{c_void, CString};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::raw::c_char;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

type LogCallback = unsafe extern "C" fn(
    level: *const c_char,
    message: *const c_char,
    breadcrumbs: u32,
    context: *mut c_void,
);

static LOGGER: Lazy<LogManager> = Lazy::new(LogManager::new);

pub fn warn(message: impl Into<String>) {
    LOGGER.log(LogLevel::Warn, message.into());
}

pub fn error(message: impl Into<String>) {
    LOGGER.log(LogLevel::Error, message.into());
}

pub fn info(message: impl Into<String>) {
    LOGGER.log(LogLevel::Info, message.into());
}

pub fn debug(message: impl Into<String>) {
    LOGGER.log(LogLevel::Debug, message.into());
}

pub fn breadcrumb(flag: BreadcrumbFlags, message: impl Into<String>) {
    LOGGER.breadcrumb(flag, message.into());
}

pub fn install_sink(sink: Option<&TunnelLogSink>, level: Option<&str>) -> Result<(), &'static str> {
    LOGGER.install_sink(sink, level)
}

pub fn set_breadcrumb_mask(mask: u32) {
    LOGGER.set_breadcrumb_mask(mask);
}

/// Applies the process environment: master switch, debug verbosity and an
/// optional append-mode log file.
pub fn configure(enabled: bool, debug: bool, path: Option<&Path>) -> std::io::Result<()> {
    LOGGER.configure(enabled, debug, path)
}

bitflags! {
    #[derive(Clone, Copy, Debug)]
    pub struct BreadcrumbFlags: u32 {
        const CONFIG = 0b0000_0001;
        const TUNNEL = 0b0000_0010;
        const EVENTS = 0b0000_0100;
        const USAGE  = 0b0000_1000;
        const FFI    = 0b0001_0000;
        const RELAY  = 0b0010_0000;
        const ALL    = u32::MAX;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    fn from_str(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "error" | "err" => LogLevel::Error,
            "warn" | "warning" => LogLevel::Warn,
            "debug" | "dbg" => LogLevel::Debug,
            _ => LogLevel::Info,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

#[derive(Clone, Copy)]
struct LogSinkInner {
    callback: LogCallback,
    context: *mut std::ffi::c_void,
    breadcrumbs: BreadcrumbFlags,
    min_level: LogLevel,
}

unsafe impl Send for LogSinkInner {}
unsafe impl Sync for LogSinkInner {}

struct FileSink {
    file: File,
    min_level: LogLevel,
}

struct LogManager {
    sink: Mutex<Option<LogSinkInner>>,
    file: Mutex<Option<FileSink>>,
    enabled: AtomicBool,
    debug: AtomicBool,
    prefix: String,
}

impl LogManager {
    fn new() -> Self {
        let pid = std::process::id();
        Self {
            sink: Mutex::new(None),
            file: Mutex::new(None),
            enabled: AtomicBool::new(true),
            debug: AtomicBool::new(false),
            prefix: format!("[tb-p{pid}]"),
        }
    }

    fn install_sink(
        &self,
        sink: Option<&TunnelLogSink>,
        level: Option<&str>,
    ) -> Result<(), &'static str> {
        let mut guard = self.sink.lock();
        if let Some(sink) = sink {
            let callback = match sink.log {
                Some(cb) => cb,
                None => return Err("log callback missing"),
            };
            let min_level = level.map(LogLevel::from_str).unwrap_or(LogLevel::Info);
            *guard = Some(LogSinkInner {
                callback,
                context: sink.context,
                breadcrumbs: BreadcrumbFlags::from_bits_truncate(sink.enabled_breadcrumbs),
                min_level,
            });
        } else {
            *guard = None;
        }
        Ok(())
    }

    fn set_breadcrumb_mask(&self, mask: u32) {
        if let Some(inner) = self.sink.lock().as_mut() {
            inner.breadcrumbs = BreadcrumbFlags::from_bits_truncate(mask);
        }
    }

    fn configure(&self, enabled: bool, debug: bool, path: Option<&Path>) -> std::io::Result<()> {
        let file = match path {
            Some(path) => Some(FileSink {
                file: OpenOptions::new().create(true).append(true).open(path)?,
                min_level: if debug { LogLevel::Debug } else { LogLevel::Info },
            }),
            None => None,
        };
        *self.file.lock() = file;
        self.enabled.store(enabled, Ordering::Release);
        self.debug.store(debug, Ordering::Release);
        Ok(())
    }

    fn log(&self, level: LogLevel, message: String) {
        if message.is_empty() {
            return;
        }
        self.dispatch(level, BreadcrumbFlags::empty(), message);
    }

    fn breadcrumb(&self, flag: BreadcrumbFlags, message: String) {
        if message.is_empty() || flag.is_empty() {
            return;
        }
        self.dispatch(LogLevel::Debug, flag, message);
    }

    fn dispatch(&self, level: LogLevel, breadcrumbs: BreadcrumbFlags, message: String) {
        if !self.enabled.load(Ordering::Acquire) {
            return;
        }
        let formatted = if !breadcrumbs.is_empty() {
            let label = label_for(breadcrumbs);
            format!("{} [{}] {}", self.prefix, label, message)
        } else {
            format!("{} {}", self.prefix, message)
        };
        self.write_file(level, breadcrumbs, &formatted);

        let sink = {
            let guard = self.sink.lock();
            *guard
        };
        let Some(inner) = sink else { return };
        // Debug mode forwards every breadcrumb regardless of the sink mask.
        let debug = self.debug.load(Ordering::Acquire);
        if breadcrumbs.is_empty() {
            if level > inner.min_level && !debug {
                return;
            }
        } else if !debug && !inner.breadcrumbs.intersects(breadcrumbs) {
            return;
        }

        let level_c = match CString::new(level.as_str()) {
            Ok(val) => val,
            Err(_) => return,
        };
        let msg_c = match CString::new(formatted) {
            Ok(val) => val,
            Err(_) => return,
        };
        unsafe {
            (inner.callback)(
                level_c.as_ptr(),
                msg_c.as_ptr(),
                breadcrumbs.bits(),
                inner.context,
            );
        }
    }

    fn write_file(&self, level: LogLevel, breadcrumbs: BreadcrumbFlags, formatted: &str) {
        let mut guard = self.file.lock();
        let Some(sink) = guard.as_mut() else { return };
        if level > sink.min_level || (!breadcrumbs.is_empty() && sink.min_level < LogLevel::Debug)
        {
            return;
        }
        let _ = writeln!(
            sink.file,
            "{} {:<5} {}",
            unix_millis(),
            level.as_str(),
            formatted
        );
    }
}

fn label_for(flags: BreadcrumbFlags) -> &'static str {
    if flags.contains(BreadcrumbFlags::TUNNEL) {
        "TUNNEL"
    } else if flags.contains(BreadcrumbFlags::EVENTS) {
        "EVENTS"
    } else if flags.contains(BreadcrumbFlags::RELAY) {
        "RELAY"
    } else if flags.contains(BreadcrumbFlags::CONFIG) {
        "CONFIG"
    } else if flags.contains(BreadcrumbFlags::USAGE) {
        "USAGE"
    } else if flags.contains(BreadcrumbFlags::FFI) {
        "FFI"
    } else {
        "LOG"
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Rate-Limited Warnings
// ============================================================================
// A stalled host can overflow an event queue thousands of times per second;
// each category gets its own limiter so one flood cannot hide another.

/// Minimum interval between logs of the same category (in milliseconds).
const RATE_LIMIT_INTERVAL_MS: u64 = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Per-tunnel event queue full, oldest event evicted
    EventQueueOverflow,
    /// Host callback could not be invoked (string conversion, reentrancy)
    CallbackFailure,
    /// Relay link read/write failure
    LinkFailure,
}

impl ErrorCategory {
    const COUNT: usize = 3;

    fn index(self) -> usize {
        match self {
            Self::EventQueueOverflow => 0,
            Self::CallbackFailure => 1,
            Self::LinkFailure => 2,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::EventQueueOverflow => "EVENT_QUEUE_OVERFLOW",
            Self::CallbackFailure => "CALLBACK_FAILURE",
            Self::LinkFailure => "LINK_FAILURE",
        }
    }
}

struct RateLimitedLogger {
    last_log_times: [AtomicU64; ErrorCategory::COUNT],
}

impl RateLimitedLogger {
    const fn new() -> Self {
        Self {
            last_log_times: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
        }
    }

    fn try_log(&self, category: ErrorCategory, message: &str) -> bool {
        let now_ms = unix_millis();
        let idx = category.index();
        let last = self.last_log_times[idx].load(Ordering::Relaxed);

        if now_ms.saturating_sub(last) < RATE_LIMIT_INTERVAL_MS {
            return false;
        }

        if self.last_log_times[idx]
            .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            warn(format!("[{}] {}", category.label(), message));
            true
        } else {
            false
        }
    }
}

static RATE_LIMITER: RateLimitedLogger = RateLimitedLogger::new();

/// Logs a warning unless the same category logged within the last second.
/// Returns true if the log was emitted.
pub fn rate_limited_error(category: ErrorCategory, message: impl Into<String>) -> bool {
    RATE_LIMITER.try_log(category, &message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_parsing_defaults_to_info() {
        assert_eq!(LogLevel::from_str("WARNING"), LogLevel::Warn);
        assert_eq!(LogLevel::from_str("dbg"), LogLevel::Debug);
        assert_eq!(LogLevel::from_str("chatty"), LogLevel::Info);
    }

    #[test]
    fn rate_limiter_suppresses_repeats_within_interval() {
        let limiter = RateLimitedLogger::new();
        assert!(limiter.try_log(ErrorCategory::LinkFailure, "first"));
        assert!(!limiter.try_log(ErrorCategory::LinkFailure, "second"));
        assert!(limiter.try_log(ErrorCategory::CallbackFailure, "other category"));
    }

    #[test]
    fn breadcrumb_labels_prefer_tunnel() {
        let flags = BreadcrumbFlags::TUNNEL | BreadcrumbFlags::USAGE;
        assert_eq!(label_for(flags), "TUNNEL");
        assert_eq!(label_for(BreadcrumbFlags::USAGE), "USAGE");
    }
}
