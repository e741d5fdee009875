use super::{output_status, output_string};
use crate::engine::Tunnel;
use crate::error::{record, Result};
use crate::events::{EventKind, EventSink};
use crate::ffi::{
    read_optional_str, read_str, ForeignCallback, ForeignSink, OnAdditionalForwardingFailedFn,
    OnAdditionalForwardingSucceededFn, OnDisconnectedFn, OnEstablishedFn, OnForwardingChangedFn,
    OnReconnectionCompletedFn, OnReconnectionFailedFn, OnTunnelErrorFn, OnTunnelFailedFn,
    OnUsageUpdateFn, OnWillReconnectFn, ReleaseContextFn,
};
use crate::logger::{self, BreadcrumbFlags};
use crate::{configs, environment, tunnels};
use std::ffi::{c_char, c_void};
use std::sync::Arc;

fn with_tunnel<R>(tunnel: u32, op: impl FnOnce(&Tunnel) -> Result<R>) -> Result<R> {
    let tunnel = tunnels().get(tunnel)?;
    op(&tunnel)
}

fn strings_json(values: Vec<String>) -> String {
    serde_json::to_string(&values).unwrap_or_else(|_| "[]".to_string())
}

/// Snapshots `config` into a new tunnel. Returns `0` on failure.
#[no_mangle]
pub extern "C" fn TunnelInitiate(config: u32) -> u32 {
    environment::ensure_initialized();
    record(tunnels().initiate(configs(), config)).unwrap_or(0)
}

/// Runs the tunnel on the calling thread until it stops or fails, delivering
/// callbacks along the way. Returns whether the tunnel was ever active.
#[no_mangle]
pub extern "C" fn TunnelStart(tunnel: u32) -> bool {
    record(with_tunnel(tunnel, Tunnel::start)).unwrap_or(false)
}

#[no_mangle]
pub extern "C" fn TunnelStartNonBlocking(tunnel: u32) -> bool {
    output_status(with_tunnel(tunnel, Tunnel::start_non_blocking))
}

/// Blocks until at least one event was delivered or the tunnel is terminal.
/// Returns whether the host should keep resuming.
#[no_mangle]
pub extern "C" fn TunnelResume(tunnel: u32) -> bool {
    record(with_tunnel(tunnel, Tunnel::resume)).unwrap_or(false)
}

/// `timeout_ms`: `-1` blocks, `0` polls, `n` waits up to `n` milliseconds.
#[no_mangle]
pub extern "C" fn TunnelResumeWithTimeout(tunnel: u32, timeout_ms: i64) -> bool {
    record(with_tunnel(tunnel, |tunnel| {
        tunnel.resume_with_timeout(timeout_ms)
    }))
    .unwrap_or(false)
}

#[no_mangle]
pub extern "C" fn TunnelStop(tunnel: u32) -> bool {
    output_status(with_tunnel(tunnel, Tunnel::stop))
}

/// Stops the tunnel if needed, releases every registered callback and
/// retires the handle.
#[no_mangle]
pub extern "C" fn TunnelFree(tunnel: u32) -> bool {
    output_status(tunnels().free(tunnel))
}

#[no_mangle]
pub extern "C" fn TunnelIsActive(tunnel: u32) -> bool {
    record(with_tunnel(tunnel, |tunnel| Ok(tunnel.is_active()))).unwrap_or(false)
}

/// `0` created, `1` connecting, `2` active, `3` reconnecting, `4` stopped,
/// `5` failed; `-1` for an invalid handle.
#[no_mangle]
pub extern "C" fn TunnelGetState(tunnel: u32) -> i32 {
    record(with_tunnel(tunnel, |tunnel| Ok(tunnel.state() as i32))).unwrap_or(-1)
}

#[no_mangle]
pub extern "C" fn TunnelRetryCount(tunnel: u32) -> i64 {
    record(with_tunnel(tunnel, |tunnel| Ok(i64::from(tunnel.retry_count())))).unwrap_or(-1)
}

/// Public URLs as a JSON array of strings.
#[no_mangle]
pub unsafe extern "C" fn TunnelGetUrls(tunnel: u32, buffer: *mut c_char, capacity: usize) -> i64 {
    let result = with_tunnel(tunnel, |tunnel| Ok(strings_json(tunnel.urls())));
    unsafe { output_string(result, buffer, capacity) }
}

#[no_mangle]
pub unsafe extern "C" fn TunnelGetGreetingMessages(
    tunnel: u32,
    buffer: *mut c_char,
    capacity: usize,
) -> i64 {
    let result = with_tunnel(tunnel, |tunnel| Ok(strings_json(tunnel.greeting_messages())));
    unsafe { output_string(result, buffer, capacity) }
}

/// Live forwarding table, including forwardings added after start.
#[no_mangle]
pub unsafe extern "C" fn TunnelGetForwardings(
    tunnel: u32,
    buffer: *mut c_char,
    capacity: usize,
) -> i64 {
    let result = with_tunnel(tunnel, |tunnel| Ok(tunnel.forwardings_json()));
    unsafe { output_string(result, buffer, capacity) }
}

/// Queues a forwarding; the outcome arrives as an
/// `additional_forwarding_succeeded` or `additional_forwarding_failed` event.
#[no_mangle]
pub unsafe extern "C" fn TunnelRequestAdditionalForwarding(
    tunnel: u32,
    binding_url: *const c_char,
    forward_to: *const c_char,
    forwarding_type: *const c_char,
) -> bool {
    let result = (|| {
        let binding_url = unsafe { read_optional_str(binding_url, "binding_url") }?;
        let forward_to = unsafe { read_str(forward_to, "forward_to") }?;
        let forwarding_type = unsafe { read_optional_str(forwarding_type, "forwarding type") }?;
        let forwarding_type = forwarding_type.parse()?;
        with_tunnel(tunnel, |tunnel| {
            tunnel.request_additional_forwarding(binding_url, forward_to, forwarding_type)
        })
    })();
    output_status(result)
}

#[no_mangle]
pub extern "C" fn TunnelStartUsageUpdate(tunnel: u32) -> bool {
    output_status(with_tunnel(tunnel, |tunnel| {
        tunnel.start_usage_update().map(|_| ())
    }))
}

/// A no-op success when no reporter is running.
#[no_mangle]
pub extern "C" fn TunnelStopUsageUpdate(tunnel: u32) -> bool {
    output_status(with_tunnel(tunnel, |tunnel| {
        tunnel.stop_usage_update();
        Ok(())
    }))
}

#[no_mangle]
pub unsafe extern "C" fn TunnelGetCurrentUsages(
    tunnel: u32,
    buffer: *mut c_char,
    capacity: usize,
) -> i64 {
    let result = with_tunnel(tunnel, |tunnel| Ok(tunnel.current_usage().to_json()));
    unsafe { output_string(result, buffer, capacity) }
}

/// Installs (or with a null callback, removes) the sink for one event kind.
/// `release`, when given, is called with `context` exactly once: when this
/// registration is replaced, removed or its tunnel freed, or straight away if
/// the registration does not take.
unsafe fn register(
    tunnel: u32,
    kind: EventKind,
    callback: Option<ForeignCallback>,
    context: *mut c_void,
    release: Option<ReleaseContextFn>,
) -> bool {
    let sink = callback.map(|callback| {
        Arc::new(ForeignSink::new(callback, context, release)) as Arc<dyn EventSink>
    });
    if sink.is_none() {
        if let Some(release) = release {
            unsafe { release(context) };
        }
    }
    // On failure the sink is dropped here, which runs its release hook.
    let result = with_tunnel(tunnel, |tunnel| Ok(tunnel.register_sink(kind, sink)));
    match record(result) {
        Some(replaced) => {
            logger::breadcrumb(
                BreadcrumbFlags::FFI,
                format!(
                    "tunnel {tunnel} {:?} callback {}",
                    kind,
                    if replaced { "replaced" } else { "set" }
                ),
            );
            true
        }
        None => false,
    }
}

macro_rules! tunnel_callback {
    ($name:ident, $callback:ty, $variant:ident) => {
        #[no_mangle]
        pub unsafe extern "C" fn $name(
            tunnel: u32,
            callback: Option<$callback>,
            context: *mut c_void,
            release: Option<ReleaseContextFn>,
        ) -> bool {
            unsafe {
                register(
                    tunnel,
                    EventKind::$variant,
                    callback.map(ForeignCallback::$variant),
                    context,
                    release,
                )
            }
        }
    };
}

tunnel_callback!(TunnelSetOnEstablished, OnEstablishedFn, Established);
tunnel_callback!(TunnelSetOnTunnelFailed, OnTunnelFailedFn, TunnelFailed);
tunnel_callback!(
    TunnelSetOnForwardingChanged,
    OnForwardingChangedFn,
    ForwardingChanged
);
tunnel_callback!(
    TunnelSetOnAdditionalForwardingSucceeded,
    OnAdditionalForwardingSucceededFn,
    AdditionalForwardingSucceeded
);
tunnel_callback!(
    TunnelSetOnAdditionalForwardingFailed,
    OnAdditionalForwardingFailedFn,
    AdditionalForwardingFailed
);
tunnel_callback!(TunnelSetOnDisconnected, OnDisconnectedFn, Disconnected);
tunnel_callback!(TunnelSetOnTunnelError, OnTunnelErrorFn, TunnelError);
tunnel_callback!(TunnelSetOnWillReconnect, OnWillReconnectFn, WillReconnect);
tunnel_callback!(
    TunnelSetOnReconnectionCompleted,
    OnReconnectionCompletedFn,
    ReconnectionCompleted
);
tunnel_callback!(
    TunnelSetOnReconnectionFailed,
    OnReconnectionFailedFn,
    ReconnectionFailed
);
tunnel_callback!(TunnelSetOnUsageUpdate, OnUsageUpdateFn, UsageUpdate);
