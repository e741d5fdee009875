use super::{output_status, output_string};
use crate::config::{ConfigFlag, ConfigList, ConfigText};
use crate::error::record;
use crate::ffi::{read_optional_str, read_str};
use crate::{configs, environment};
use std::ffi::c_char;

#[no_mangle]
pub extern "C" fn TunnelConfigNew() -> u32 {
    environment::ensure_initialized();
    record(configs().create()).unwrap_or(0)
}

#[no_mangle]
pub extern "C" fn TunnelConfigFree(config: u32) -> bool {
    output_status(configs().free(config))
}

macro_rules! config_flag {
    ($getter:ident, $setter:ident, $flag:expr) => {
        #[no_mangle]
        pub extern "C" fn $setter(config: u32, value: bool) -> bool {
            output_status(configs().set_flag(config, $flag, value))
        }

        #[no_mangle]
        pub extern "C" fn $getter(config: u32) -> bool {
            record(configs().get_flag(config, $flag)).unwrap_or(false)
        }
    };
}

config_flag!(TunnelConfigGetSsl, TunnelConfigSetSsl, ConfigFlag::Ssl);
config_flag!(TunnelConfigGetInsecure, TunnelConfigSetInsecure, ConfigFlag::Insecure);
config_flag!(TunnelConfigGetForce, TunnelConfigSetForce, ConfigFlag::Force);
config_flag!(TunnelConfigGetHttpsOnly, TunnelConfigSetHttpsOnly, ConfigFlag::HttpsOnly);
config_flag!(
    TunnelConfigGetAllowPreflight,
    TunnelConfigSetAllowPreflight,
    ConfigFlag::AllowPreflight
);
config_flag!(
    TunnelConfigGetXForwardedFor,
    TunnelConfigSetXForwardedFor,
    ConfigFlag::XForwardedFor
);
config_flag!(
    TunnelConfigGetReverseProxy,
    TunnelConfigSetReverseProxy,
    ConfigFlag::ReverseProxy
);
config_flag!(
    TunnelConfigGetOriginalRequestUrl,
    TunnelConfigSetOriginalRequestUrl,
    ConfigFlag::OriginalRequestUrl
);
config_flag!(
    TunnelConfigGetAdvancedParsing,
    TunnelConfigSetAdvancedParsing,
    ConfigFlag::AdvancedParsing
);
config_flag!(
    TunnelConfigGetWebDebugger,
    TunnelConfigSetWebDebugger,
    ConfigFlag::WebDebugger
);
config_flag!(
    TunnelConfigGetAutoReconnect,
    TunnelConfigSetAutoReconnect,
    ConfigFlag::AutoReconnect
);

macro_rules! config_text {
    ($getter:ident, $setter:ident, $field:expr, $what:literal) => {
        #[no_mangle]
        pub unsafe extern "C" fn $setter(config: u32, value: *const c_char) -> bool {
            let result = unsafe { read_optional_str(value, $what) }
                .and_then(|value| configs().set_text(config, $field, value));
            output_status(result)
        }

        #[no_mangle]
        pub unsafe extern "C" fn $getter(config: u32, buffer: *mut c_char, capacity: usize) -> i64 {
            unsafe { output_string(configs().get_text(config, $field), buffer, capacity) }
        }
    };
}

config_text!(
    TunnelConfigGetServerAddress,
    TunnelConfigSetServerAddress,
    ConfigText::ServerAddress,
    "server address"
);
config_text!(
    TunnelConfigGetSniServerName,
    TunnelConfigSetSniServerName,
    ConfigText::SniServerName,
    "sni server name"
);
config_text!(
    TunnelConfigGetToken,
    TunnelConfigSetToken,
    ConfigText::Token,
    "token"
);
config_text!(
    TunnelConfigGetArgument,
    TunnelConfigSetArgument,
    ConfigText::Argument,
    "argument"
);
config_text!(
    TunnelConfigGetLocalServerTls,
    TunnelConfigSetLocalServerTls,
    ConfigText::LocalServerTls,
    "local server tls"
);
config_text!(
    TunnelConfigGetWebDebuggerAddr,
    TunnelConfigSetWebDebuggerAddr,
    ConfigText::WebDebuggerAddr,
    "web debugger address"
);

macro_rules! config_list {
    ($getter:ident, $setter:ident, $list:expr, $what:literal) => {
        /// Takes a JSON array of strings.
        #[no_mangle]
        pub unsafe extern "C" fn $setter(config: u32, json: *const c_char) -> bool {
            let result = unsafe { read_optional_str(json, $what) }
                .and_then(|json| configs().set_list_json(config, $list, json));
            output_status(result)
        }

        #[no_mangle]
        pub unsafe extern "C" fn $getter(config: u32, buffer: *mut c_char, capacity: usize) -> i64 {
            unsafe { output_string(configs().get_list_json(config, $list), buffer, capacity) }
        }
    };
}

config_list!(
    TunnelConfigGetBasicAuths,
    TunnelConfigSetBasicAuths,
    ConfigList::BasicAuths,
    "basic auths"
);
config_list!(
    TunnelConfigGetBearerTokens,
    TunnelConfigSetBearerTokens,
    ConfigList::BearerTokens,
    "bearer tokens"
);
config_list!(
    TunnelConfigGetIpWhitelist,
    TunnelConfigSetIpWhitelist,
    ConfigList::IpWhitelist,
    "ip whitelist"
);

#[no_mangle]
pub extern "C" fn TunnelConfigSetReconnectInterval(config: u32, seconds: f64) -> bool {
    output_status(configs().set_reconnect_interval(config, seconds))
}

/// Seconds; `-1.0` on failure.
#[no_mangle]
pub extern "C" fn TunnelConfigGetReconnectInterval(config: u32) -> f64 {
    record(configs().get_reconnect_interval(config)).unwrap_or(-1.0)
}

#[no_mangle]
pub extern "C" fn TunnelConfigSetMaxReconnectAttempts(config: u32, attempts: u32) -> bool {
    output_status(configs().set_max_reconnect_attempts(config, attempts))
}

#[no_mangle]
pub extern "C" fn TunnelConfigGetMaxReconnectAttempts(config: u32) -> i64 {
    record(configs().get_max_reconnect_attempts(config))
        .map(i64::from)
        .unwrap_or(-1)
}

#[no_mangle]
pub unsafe extern "C" fn TunnelConfigSetHeaderManipulations(
    config: u32,
    json: *const c_char,
) -> bool {
    let result = unsafe { read_optional_str(json, "header manipulations") }
        .and_then(|json| configs().set_header_manipulations(config, json));
    output_status(result)
}

#[no_mangle]
pub unsafe extern "C" fn TunnelConfigGetHeaderManipulations(
    config: u32,
    buffer: *mut c_char,
    capacity: usize,
) -> i64 {
    unsafe { output_string(configs().get_header_manipulations(config), buffer, capacity) }
}

#[no_mangle]
pub unsafe extern "C" fn TunnelConfigAddForwardingSimple(
    config: u32,
    forward_to: *const c_char,
) -> bool {
    let result = unsafe { read_str(forward_to, "forward_to") }
        .and_then(|forward_to| configs().add_forwarding_simple(config, forward_to));
    output_status(result)
}

/// `forwarding_type` is one of `http`, `tcp`, `udp`, `tls`, `tlstcp`; null
/// or empty means `http`.
#[no_mangle]
pub unsafe extern "C" fn TunnelConfigAddForwarding(
    config: u32,
    forwarding_type: *const c_char,
    binding_url: *const c_char,
    forward_to: *const c_char,
) -> bool {
    let result = (|| {
        let forwarding_type = unsafe { read_optional_str(forwarding_type, "forwarding type") }?;
        let binding_url = unsafe { read_optional_str(binding_url, "binding_url") }?;
        let forward_to = unsafe { read_str(forward_to, "forward_to") }?;
        configs().add_forwarding(config, forwarding_type, binding_url, forward_to)
    })();
    output_status(result)
}

/// Replaces the whole table from a JSON array; nothing changes on error.
#[no_mangle]
pub unsafe extern "C" fn TunnelConfigSetForwardings(config: u32, json: *const c_char) -> bool {
    let result = unsafe { read_optional_str(json, "forwardings") }
        .and_then(|json| configs().set_forwardings(config, json));
    output_status(result)
}

#[no_mangle]
pub unsafe extern "C" fn TunnelConfigGetForwardings(
    config: u32,
    buffer: *mut c_char,
    capacity: usize,
) -> i64 {
    unsafe { output_string(configs().get_forwardings(config), buffer, capacity) }
}

#[no_mangle]
pub extern "C" fn TunnelConfigResetForwardings(config: u32) -> bool {
    output_status(configs().reset_forwardings(config))
}
