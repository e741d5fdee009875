//! `#[repr(C)]` types and callback plumbing shared by the exported functions.

use crate::error::{BridgeError, Result};
use crate::events::{EventKind, EventSink, TunnelEvent};
use crate::logger::{self, ErrorCategory};
use smallvec::SmallVec;
use std::ffi::{c_char, c_void, CStr, CString};
use std::ptr;

#[repr(C)]
pub struct TunnelLogSink {
    pub log: Option<
        unsafe extern "C" fn(
            level: *const c_char,
            message: *const c_char,
            breadcrumbs: u32,
            context: *mut c_void,
        ),
    >,
    pub context: *mut c_void,
    pub enabled_breadcrumbs: u32,
}

/// Called exactly once when a registration is replaced, removed or its tunnel
/// is freed.
pub type ReleaseContextFn = unsafe extern "C" fn(context: *mut c_void);

pub type OnEstablishedFn = unsafe extern "C" fn(
    context: *mut c_void,
    tunnel: u32,
    urls: *const *const c_char,
    url_count: usize,
);
pub type OnTunnelFailedFn =
    unsafe extern "C" fn(context: *mut c_void, tunnel: u32, message: *const c_char);
pub type OnForwardingChangedFn =
    unsafe extern "C" fn(context: *mut c_void, tunnel: u32, url_map: *const c_char);
pub type OnAdditionalForwardingSucceededFn = unsafe extern "C" fn(
    context: *mut c_void,
    tunnel: u32,
    binding_url: *const c_char,
    forward_to: *const c_char,
    forwarding_type: *const c_char,
);
pub type OnAdditionalForwardingFailedFn = unsafe extern "C" fn(
    context: *mut c_void,
    tunnel: u32,
    binding_url: *const c_char,
    forward_to: *const c_char,
    forwarding_type: *const c_char,
    error: *const c_char,
);
pub type OnDisconnectedFn = unsafe extern "C" fn(
    context: *mut c_void,
    tunnel: u32,
    error: *const c_char,
    messages: *const *const c_char,
    message_count: usize,
);
pub type OnTunnelErrorFn = unsafe extern "C" fn(
    context: *mut c_void,
    tunnel: u32,
    error_no: u32,
    message: *const c_char,
    recoverable: bool,
);
pub type OnWillReconnectFn = unsafe extern "C" fn(
    context: *mut c_void,
    tunnel: u32,
    error: *const c_char,
    messages: *const *const c_char,
    message_count: usize,
);
pub type OnReconnectionCompletedFn = unsafe extern "C" fn(
    context: *mut c_void,
    tunnel: u32,
    urls: *const *const c_char,
    url_count: usize,
);
pub type OnReconnectionFailedFn =
    unsafe extern "C" fn(context: *mut c_void, tunnel: u32, retry_count: u32);
pub type OnUsageUpdateFn =
    unsafe extern "C" fn(context: *mut c_void, tunnel: u32, usage_json: *const c_char);

/// One typed host callback.
#[derive(Clone, Copy)]
pub enum ForeignCallback {
    Established(OnEstablishedFn),
    TunnelFailed(OnTunnelFailedFn),
    ForwardingChanged(OnForwardingChangedFn),
    AdditionalForwardingSucceeded(OnAdditionalForwardingSucceededFn),
    AdditionalForwardingFailed(OnAdditionalForwardingFailedFn),
    Disconnected(OnDisconnectedFn),
    TunnelError(OnTunnelErrorFn),
    WillReconnect(OnWillReconnectFn),
    ReconnectionCompleted(OnReconnectionCompletedFn),
    ReconnectionFailed(OnReconnectionFailedFn),
    UsageUpdate(OnUsageUpdateFn),
}

impl ForeignCallback {
    pub fn kind(&self) -> EventKind {
        match self {
            ForeignCallback::Established(_) => EventKind::Established,
            ForeignCallback::TunnelFailed(_) => EventKind::TunnelFailed,
            ForeignCallback::ForwardingChanged(_) => EventKind::ForwardingChanged,
            ForeignCallback::AdditionalForwardingSucceeded(_) => {
                EventKind::AdditionalForwardingSucceeded
            }
            ForeignCallback::AdditionalForwardingFailed(_) => EventKind::AdditionalForwardingFailed,
            ForeignCallback::Disconnected(_) => EventKind::Disconnected,
            ForeignCallback::TunnelError(_) => EventKind::TunnelError,
            ForeignCallback::WillReconnect(_) => EventKind::WillReconnect,
            ForeignCallback::ReconnectionCompleted(_) => EventKind::ReconnectionCompleted,
            ForeignCallback::ReconnectionFailed(_) => EventKind::ReconnectionFailed,
            ForeignCallback::UsageUpdate(_) => EventKind::UsageUpdate,
        }
    }
}

/// Host callback plus its opaque context. The release hook runs on drop, so
/// it fires once no matter how the registration ends.
pub struct ForeignSink {
    callback: ForeignCallback,
    context: *mut c_void,
    release: Option<ReleaseContextFn>,
}

// The host promises its context may be used from whichever thread pumps the
// tunnel, which is the contract of the registration functions.
unsafe impl Send for ForeignSink {}
unsafe impl Sync for ForeignSink {}

impl ForeignSink {
    pub fn new(
        callback: ForeignCallback,
        context: *mut c_void,
        release: Option<ReleaseContextFn>,
    ) -> Self {
        Self {
            callback,
            context,
            release,
        }
    }
}

impl Drop for ForeignSink {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            unsafe { release(self.context) };
        }
    }
}

impl EventSink for ForeignSink {
    fn deliver(&self, tunnel: u32, event: &TunnelEvent) {
        let context = self.context;
        match (self.callback, event) {
            (ForeignCallback::Established(cb), TunnelEvent::Established { urls }) => {
                let urls = CStringList::new(urls);
                unsafe { cb(context, tunnel, urls.as_ptr(), urls.len()) };
            }
            (ForeignCallback::TunnelFailed(cb), TunnelEvent::TunnelFailed { message }) => {
                let message = c_string(message);
                unsafe { cb(context, tunnel, message.as_ptr()) };
            }
            (ForeignCallback::ForwardingChanged(cb), TunnelEvent::ForwardingChanged { url_map }) => {
                let url_map = c_string(url_map);
                unsafe { cb(context, tunnel, url_map.as_ptr()) };
            }
            (
                ForeignCallback::AdditionalForwardingSucceeded(cb),
                TunnelEvent::AdditionalForwardingSucceeded {
                    binding_url,
                    forward_to,
                    forwarding_type,
                },
            ) => {
                let binding_url = c_string(binding_url);
                let forward_to = c_string(forward_to);
                let forwarding_type = c_string(forwarding_type.as_str());
                unsafe {
                    cb(
                        context,
                        tunnel,
                        binding_url.as_ptr(),
                        forward_to.as_ptr(),
                        forwarding_type.as_ptr(),
                    )
                };
            }
            (
                ForeignCallback::AdditionalForwardingFailed(cb),
                TunnelEvent::AdditionalForwardingFailed {
                    binding_url,
                    forward_to,
                    forwarding_type,
                    error,
                },
            ) => {
                let binding_url = c_string(binding_url);
                let forward_to = c_string(forward_to);
                let forwarding_type = c_string(forwarding_type.as_str());
                let error = c_string(error);
                unsafe {
                    cb(
                        context,
                        tunnel,
                        binding_url.as_ptr(),
                        forward_to.as_ptr(),
                        forwarding_type.as_ptr(),
                        error.as_ptr(),
                    )
                };
            }
            (ForeignCallback::Disconnected(cb), TunnelEvent::Disconnected { error, messages })
            | (ForeignCallback::WillReconnect(cb), TunnelEvent::WillReconnect { error, messages }) => {
                let error = c_string(error);
                let messages = CStringList::new(messages);
                unsafe { cb(context, tunnel, error.as_ptr(), messages.as_ptr(), messages.len()) };
            }
            (
                ForeignCallback::TunnelError(cb),
                TunnelEvent::TunnelError {
                    error_no,
                    message,
                    recoverable,
                },
            ) => {
                let message = c_string(message);
                unsafe { cb(context, tunnel, *error_no, message.as_ptr(), *recoverable) };
            }
            (
                ForeignCallback::ReconnectionCompleted(cb),
                TunnelEvent::ReconnectionCompleted { urls },
            ) => {
                let urls = CStringList::new(urls);
                unsafe { cb(context, tunnel, urls.as_ptr(), urls.len()) };
            }
            (
                ForeignCallback::ReconnectionFailed(cb),
                TunnelEvent::ReconnectionFailed { retry_count },
            ) => unsafe { cb(context, tunnel, *retry_count) },
            (ForeignCallback::UsageUpdate(cb), TunnelEvent::UsageUpdate { usage }) => {
                let usage = c_string(usage);
                unsafe { cb(context, tunnel, usage.as_ptr()) };
            }
            (callback, event) => {
                logger::rate_limited_error(
                    ErrorCategory::CallbackFailure,
                    format!(
                        "tunnel {tunnel}: {:?} callback handed a {:?} event",
                        callback.kind(),
                        event.kind()
                    ),
                );
            }
        }
    }
}

/// NUL-terminated copies of a string list plus the pointer array handed to C.
/// Both live until the callback returns.
pub struct CStringList {
    _owned: Vec<CString>,
    pointers: SmallVec<[*const c_char; 8]>,
}

impl CStringList {
    pub fn new(values: &[String]) -> Self {
        let owned: Vec<CString> = values.iter().map(|value| c_string(value)).collect();
        let pointers = owned.iter().map(|value| value.as_ptr()).collect();
        Self {
            _owned: owned,
            pointers,
        }
    }

    pub fn as_ptr(&self) -> *const *const c_char {
        if self.pointers.is_empty() {
            ptr::null()
        } else {
            self.pointers.as_ptr()
        }
    }

    pub fn len(&self) -> usize {
        self.pointers.len()
    }
}

/// Interior NULs cannot cross the boundary; they are dropped.
pub fn c_string(value: &str) -> CString {
    CString::new(value).unwrap_or_else(|_| {
        let cleaned: Vec<u8> = value.bytes().filter(|byte| *byte != 0).collect();
        CString::new(cleaned).unwrap_or_default()
    })
}

/// Two-phase string output: returns the capacity needed (bytes including the
/// NUL) and copies only when `capacity` covers it. A null `buffer` or zero
/// `capacity` is a pure length query.
///
/// # Safety
/// `buffer`, when non-null, must be writable for `capacity` bytes.
pub unsafe fn copy_string(value: &str, buffer: *mut c_char, capacity: usize) -> i64 {
    let bytes = value.as_bytes();
    let required = bytes.len() + 1;
    if buffer.is_null() || capacity < required {
        return required as i64;
    }
    unsafe {
        ptr::copy_nonoverlapping(bytes.as_ptr(), buffer.cast::<u8>(), bytes.len());
        *buffer.add(bytes.len()) = 0;
    }
    required as i64
}

/// Borrows a C string argument as UTF-8.
///
/// # Safety
/// `value`, when non-null, must point to a NUL-terminated string that stays
/// valid for `'a`.
pub unsafe fn read_str<'a>(value: *const c_char, what: &str) -> Result<&'a str> {
    if value.is_null() {
        return Err(BridgeError::validation(format!("{what} must not be null")));
    }
    unsafe { CStr::from_ptr(value) }
        .to_str()
        .map_err(|_| BridgeError::validation(format!("{what} is not valid UTF-8")))
}

/// Like `read_str`, but a null pointer reads as the empty string.
///
/// # Safety
/// Same contract as `read_str`.
pub unsafe fn read_optional_str<'a>(value: *const c_char, what: &str) -> Result<&'a str> {
    if value.is_null() {
        return Ok("");
    }
    unsafe { read_str(value, what) }
}

#[cfg(test)]
mod tests;
