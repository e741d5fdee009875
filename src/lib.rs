#![deny(unsafe_op_in_unsafe_fn)]

pub mod abi;
pub mod config;
pub mod engine;
pub mod environment;
pub mod error;
pub mod events;
pub mod ffi;
pub mod forwarding;
mod handles;
pub mod logger;
pub mod relay;
pub mod usage;

use crate::config::ConfigStore;
use crate::engine::TunnelStore;
use crate::error::{peek_last_exception, record, take_last_exception};
use crate::ffi::{copy_string, read_optional_str, TunnelLogSink};
use crate::relay::RelayConnector;
use once_cell::sync::Lazy;
use std::ffi::{c_char, c_void, CStr};
use std::sync::Arc;

pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

static CONFIGS: Lazy<ConfigStore> = Lazy::new(ConfigStore::new);
static TUNNELS: Lazy<TunnelStore> = Lazy::new(TunnelStore::default);

pub(crate) fn configs() -> &'static ConfigStore {
    &CONFIGS
}

pub(crate) fn tunnels() -> &'static TunnelStore {
    &TUNNELS
}

/// Swaps the relay connector used by tunnels initiated after this call.
/// Embedders use this to plug in a TLS-capable transport.
pub fn set_relay_connector(connector: Arc<dyn RelayConnector>) {
    tunnels().set_connector(connector);
}

/// Stages the log file path; empty or null clears it. Fails once the
/// environment is initialized.
#[no_mangle]
pub unsafe extern "C" fn TunnelSetLogPath(path: *const c_char) -> bool {
    let result = unsafe { read_optional_str(path, "log path") }.and_then(environment::set_log_path);
    record(result).is_some()
}

#[no_mangle]
pub extern "C" fn TunnelSetLogEnable(enabled: bool) -> bool {
    record(environment::set_log_enabled(enabled)).is_some()
}

#[no_mangle]
pub extern "C" fn TunnelSetDebug(debug: bool) -> bool {
    record(environment::set_debug(debug)).is_some()
}

/// Commits the staged environment. Later calls succeed without effect.
#[no_mangle]
pub extern "C" fn TunnelEnvironmentInit() -> bool {
    record(environment::initialize()).is_some()
}

#[no_mangle]
pub unsafe extern "C" fn TunnelSetLogSink(
    sink: *const TunnelLogSink,
    level: *const c_char,
    _reserved: *mut c_void,
) -> bool {
    let sink_ref = unsafe { sink.as_ref() };
    let level_str = if level.is_null() {
        None
    } else {
        match unsafe { CStr::from_ptr(level) }.to_str() {
            Ok(value) => Some(value),
            Err(_) => None,
        }
    };
    crate::logger::install_sink(sink_ref, level_str).is_ok()
}

#[no_mangle]
pub extern "C" fn TunnelSetBreadcrumbMask(mask: u32) {
    crate::logger::set_breadcrumb_mask(mask);
}

#[no_mangle]
pub unsafe extern "C" fn TunnelBridgeVersion(buffer: *mut c_char, capacity: usize) -> i64 {
    unsafe { copy_string(BRIDGE_VERSION, buffer, capacity) }
}

#[no_mangle]
pub extern "C" fn TunnelHasLastException() -> bool {
    error::has_last_exception()
}

/// Copies the calling thread's last exception (kind and message) and clears
/// it, but only when both buffers are large enough. Required capacities are
/// always written to the `*_required` out-parameters when non-null. Returns
/// `true` once the exception was taken.
#[no_mangle]
pub unsafe extern "C" fn TunnelTakeLastException(
    kind: *mut c_char,
    kind_capacity: usize,
    message: *mut c_char,
    message_capacity: usize,
    kind_required: *mut usize,
    message_required: *mut usize,
) -> bool {
    let Some(exception) = peek_last_exception() else {
        return false;
    };
    let needed_kind = exception.kind.len() + 1;
    let needed_message = exception.message.len() + 1;
    if let Some(out) = unsafe { kind_required.as_mut() } {
        *out = needed_kind;
    }
    if let Some(out) = unsafe { message_required.as_mut() } {
        *out = needed_message;
    }
    if kind.is_null()
        || message.is_null()
        || kind_capacity < needed_kind
        || message_capacity < needed_message
    {
        return false;
    }
    unsafe {
        copy_string(&exception.kind, kind, kind_capacity);
        copy_string(&exception.message, message, message_capacity);
    }
    take_last_exception();
    true
}

#[cfg(test)]
mod tests;
