use std::env;
use std::ffi::{c_char, c_void, CStr, CString};
use std::ptr;
use std::slice;
use tunnel_bridge::abi::config::{
    TunnelConfigAddForwarding, TunnelConfigFree, TunnelConfigNew, TunnelConfigSetAutoReconnect,
    TunnelConfigSetMaxReconnectAttempts, TunnelConfigSetServerAddress, TunnelConfigSetSsl,
    TunnelConfigSetToken,
};
use tunnel_bridge::abi::tunnel::{
    TunnelFree, TunnelInitiate, TunnelSetOnDisconnected, TunnelSetOnEstablished,
    TunnelSetOnReconnectionCompleted, TunnelSetOnReconnectionFailed, TunnelSetOnTunnelError,
    TunnelSetOnTunnelFailed, TunnelSetOnUsageUpdate, TunnelSetOnWillReconnect, TunnelStart,
    TunnelStartUsageUpdate,
};
use tunnel_bridge::ffi::TunnelLogSink;
use tunnel_bridge::{
    TunnelEnvironmentInit, TunnelSetBreadcrumbMask, TunnelSetDebug, TunnelSetLogSink,
    TunnelTakeLastException,
};

fn main() -> anyhow::Result<()> {
    let settings = Settings::parse()?;
    if settings.debug {
        check(TunnelSetDebug(true), "TunnelSetDebug")?;
    }
    check(TunnelEnvironmentInit(), "TunnelEnvironmentInit")?;
    install_log_sink(settings.debug);

    let config = TunnelConfigNew();
    if config == 0 {
        return Err(last_error("TunnelConfigNew"));
    }
    let outcome = run(config, &settings);
    TunnelConfigFree(config);
    outcome
}

fn run(config: u32, settings: &Settings) -> anyhow::Result<()> {
    let server = CString::new(settings.server.as_str())?;
    check(
        unsafe { TunnelConfigSetServerAddress(config, server.as_ptr()) },
        "server address",
    )?;
    let token = CString::new(settings.token.as_str())?;
    check(unsafe { TunnelConfigSetToken(config, token.as_ptr()) }, "token")?;
    check(TunnelConfigSetSsl(config, settings.ssl), "ssl")?;
    check(
        TunnelConfigSetAutoReconnect(config, settings.auto_reconnect),
        "auto reconnect",
    )?;
    if let Some(attempts) = settings.max_attempts {
        check(
            TunnelConfigSetMaxReconnectAttempts(config, attempts),
            "max reconnect attempts",
        )?;
    }
    for forwarding in &settings.forwardings {
        let kind = CString::new(forwarding.kind.as_str())?;
        let binding = CString::new(forwarding.binding.as_str())?;
        let target = CString::new(forwarding.target.as_str())?;
        check(
            unsafe {
                TunnelConfigAddForwarding(config, kind.as_ptr(), binding.as_ptr(), target.as_ptr())
            },
            "forwarding",
        )?;
    }

    let tunnel = TunnelInitiate(config);
    if tunnel == 0 {
        return Err(last_error("TunnelInitiate"));
    }
    install_callbacks(tunnel);
    if settings.usage && !TunnelStartUsageUpdate(tunnel) {
        eprintln!("[standalone] {}", last_error("usage updates"));
    }

    eprintln!("[standalone] connecting to {}", settings.server);
    let was_active = TunnelStart(tunnel);
    let failure = tunnel_bridge::TunnelHasLastException().then(|| last_error("TunnelStart"));
    TunnelFree(tunnel);
    if let Some(failure) = failure {
        return Err(failure);
    }
    if !was_active {
        anyhow::bail!("tunnel never became active");
    }
    Ok(())
}

#[derive(Debug)]
struct Forwarding {
    kind: String,
    binding: String,
    target: String,
}

impl Forwarding {
    /// `[type=]target[@binding]`, type defaulting to http.
    fn parse(value: &str) -> Self {
        let (kind, rest) = match value.split_once('=') {
            Some((kind, rest)) => (kind.to_string(), rest),
            None => ("http".to_string(), value),
        };
        let (target, binding) = match rest.split_once('@') {
            Some((target, binding)) => (target, binding),
            None => (rest, ""),
        };
        Self {
            kind,
            binding: binding.to_string(),
            target: target.to_string(),
        }
    }
}

#[derive(Debug)]
struct Settings {
    server: String,
    token: String,
    ssl: bool,
    auto_reconnect: bool,
    max_attempts: Option<u32>,
    usage: bool,
    debug: bool,
    forwardings: Vec<Forwarding>,
}

impl Settings {
    fn parse() -> anyhow::Result<Self> {
        let mut server = None;
        let mut token = String::new();
        let mut ssl = false;
        let mut auto_reconnect = false;
        let mut max_attempts = None;
        let mut usage = false;
        let mut debug = false;
        let mut forwardings = Vec::new();
        let mut args = env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--server" => {
                    server = Some(
                        args.next()
                            .ok_or_else(|| anyhow::anyhow!("--server requires a value"))?,
                    );
                }
                "--token" => {
                    token = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--token requires a value"))?;
                }
                "--forward" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--forward requires a value"))?;
                    forwardings.push(Forwarding::parse(&value));
                }
                "--max-attempts" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--max-attempts requires a value"))?;
                    max_attempts = Some(
                        value
                            .parse()
                            .map_err(|_| anyhow::anyhow!("invalid attempt count"))?,
                    );
                }
                "--ssl" => ssl = true,
                "--auto-reconnect" => auto_reconnect = true,
                "--usage" => usage = true,
                "--debug" => debug = true,
                _ => {
                    anyhow::bail!(
                        "unknown argument '{}'. Supported flags: --server <host:port>, --token <token>, --forward [type=]target[@binding], --max-attempts <n>, --ssl, --auto-reconnect, --usage, --debug",
                        arg
                    );
                }
            }
        }
        let server = server.ok_or_else(|| anyhow::anyhow!("--server is required"))?;
        if forwardings.is_empty() {
            anyhow::bail!("at least one --forward is required");
        }
        Ok(Self {
            server,
            token,
            ssl,
            auto_reconnect,
            max_attempts,
            usage,
            debug,
            forwardings,
        })
    }
}

fn check(ok: bool, what: &str) -> anyhow::Result<()> {
    if ok {
        Ok(())
    } else {
        Err(last_error(what))
    }
}

fn last_error(what: &str) -> anyhow::Error {
    let mut kind = [0 as c_char; 64];
    let mut message = [0 as c_char; 1024];
    let taken = unsafe {
        TunnelTakeLastException(
            kind.as_mut_ptr(),
            kind.len(),
            message.as_mut_ptr(),
            message.len(),
            ptr::null_mut(),
            ptr::null_mut(),
        )
    };
    if !taken {
        return anyhow::anyhow!("{what} failed");
    }
    let kind = unsafe { CStr::from_ptr(kind.as_ptr()) }.to_string_lossy();
    let message = unsafe { CStr::from_ptr(message.as_ptr()) }.to_string_lossy();
    anyhow::anyhow!("{what}: {kind}: {message}")
}

unsafe fn text(value: *const c_char) -> String {
    if value.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(value) }.to_string_lossy().into_owned()
}

unsafe fn texts(values: *const *const c_char, count: usize) -> Vec<String> {
    if values.is_null() || count == 0 {
        return Vec::new();
    }
    unsafe { slice::from_raw_parts(values, count) }
        .iter()
        .map(|value| unsafe { text(*value) })
        .collect()
}

unsafe extern "C" fn on_established(
    _context: *mut c_void,
    tunnel: u32,
    urls: *const *const c_char,
    url_count: usize,
) {
    let urls = unsafe { texts(urls, url_count) };
    println!("[standalone] tunnel {tunnel} established");
    for url in urls {
        println!("  {url}");
    }
}

unsafe extern "C" fn on_failed(_context: *mut c_void, tunnel: u32, message: *const c_char) {
    println!("[standalone] tunnel {tunnel} failed: {}", unsafe {
        text(message)
    });
}

unsafe extern "C" fn on_disconnected(
    _context: *mut c_void,
    tunnel: u32,
    error: *const c_char,
    messages: *const *const c_char,
    message_count: usize,
) {
    let messages = unsafe { texts(messages, message_count) };
    println!(
        "[standalone] tunnel {tunnel} disconnected: {} {:?}",
        unsafe { text(error) },
        messages
    );
}

unsafe extern "C" fn on_error(
    _context: *mut c_void,
    tunnel: u32,
    error_no: u32,
    message: *const c_char,
    recoverable: bool,
) {
    println!(
        "[standalone] tunnel {tunnel} error {error_no} (recoverable={recoverable}): {}",
        unsafe { text(message) }
    );
}

unsafe extern "C" fn on_will_reconnect(
    _context: *mut c_void,
    tunnel: u32,
    error: *const c_char,
    _messages: *const *const c_char,
    _message_count: usize,
) {
    println!("[standalone] tunnel {tunnel} reconnecting after: {}", unsafe {
        text(error)
    });
}

unsafe extern "C" fn on_reconnected(
    _context: *mut c_void,
    tunnel: u32,
    urls: *const *const c_char,
    url_count: usize,
) {
    let urls = unsafe { texts(urls, url_count) };
    println!("[standalone] tunnel {tunnel} reconnected: {urls:?}");
}

unsafe extern "C" fn on_reconnection_failed(_context: *mut c_void, tunnel: u32, retries: u32) {
    println!("[standalone] tunnel {tunnel} gave up after {retries} attempts");
}

unsafe extern "C" fn on_usage(_context: *mut c_void, tunnel: u32, usage: *const c_char) {
    println!("[standalone] tunnel {tunnel} usage {}", unsafe { text(usage) });
}

fn install_callbacks(tunnel: u32) {
    let context = ptr::null_mut();
    let installed = unsafe {
        [
            TunnelSetOnEstablished(tunnel, Some(on_established), context, None),
            TunnelSetOnTunnelFailed(tunnel, Some(on_failed), context, None),
            TunnelSetOnDisconnected(tunnel, Some(on_disconnected), context, None),
            TunnelSetOnTunnelError(tunnel, Some(on_error), context, None),
            TunnelSetOnWillReconnect(tunnel, Some(on_will_reconnect), context, None),
            TunnelSetOnReconnectionCompleted(tunnel, Some(on_reconnected), context, None),
            TunnelSetOnReconnectionFailed(tunnel, Some(on_reconnection_failed), context, None),
            TunnelSetOnUsageUpdate(tunnel, Some(on_usage), context, None),
        ]
    };
    if installed.contains(&false) {
        eprintln!("[standalone] {}", last_error("callback registration"));
    }
}

fn install_log_sink(debug: bool) {
    unsafe extern "C" fn log_sink(
        level: *const c_char,
        message: *const c_char,
        _breadcrumbs: u32,
        _context: *mut c_void,
    ) {
        if message.is_null() {
            return;
        }
        let entry = unsafe { text(message) };
        let level = if level.is_null() {
            "info".to_string()
        } else {
            unsafe { text(level) }
        };
        eprintln!("[bridge][{level}] {entry}");
    }

    let sink = TunnelLogSink {
        log: Some(log_sink),
        context: ptr::null_mut(),
        enabled_breadcrumbs: if debug { u32::MAX } else { 0 },
    };
    let level: &[u8] = if debug { b"debug\0" } else { b"info\0" };
    unsafe {
        TunnelSetLogSink(&sink, level.as_ptr().cast(), ptr::null_mut());
    }
    if debug {
        TunnelSetBreadcrumbMask(u32::MAX);
    }
}
