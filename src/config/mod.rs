//! Tunnel configuration objects and the store that owns them.
//!
//! A `TunnelConfig` is plain data; `ConfigStore` wraps each one in its own
//! mutex behind a handle so the host can mutate configs from any thread.

mod headers;

pub use headers::{HeaderAction, HeaderRule};

use crate::error::{BridgeError, HandleKind, Result};
use crate::forwarding::{split_host_port, ForwardingTable};
use crate::handles::HandleRegistry;
use crate::logger::{self, BreadcrumbFlags};
use parking_lot::Mutex;
use std::net::IpAddr;
use std::time::Duration;

pub const DEFAULT_SERVER_ADDRESS: &str = "a.pinggy.io:443";
pub const DEFAULT_SERVER_PORT: u16 = 443;
pub const DEFAULT_WEB_DEBUGGER_ADDR: &str = "localhost:4300";
pub const DEFAULT_RECONNECT_INTERVAL_SECS: f64 = 5.0;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 20;

const MAX_TEXT_LEN: usize = 4096;
const MAX_LIST_ENTRIES: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigFlag {
    Ssl,
    Insecure,
    Force,
    HttpsOnly,
    AllowPreflight,
    XForwardedFor,
    ReverseProxy,
    OriginalRequestUrl,
    AdvancedParsing,
    WebDebugger,
    AutoReconnect,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigText {
    ServerAddress,
    SniServerName,
    Token,
    Argument,
    LocalServerTls,
    WebDebuggerAddr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigList {
    BasicAuths,
    BearerTokens,
    IpWhitelist,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TunnelConfig {
    pub server_address: String,
    pub sni_server_name: String,
    pub token: String,
    pub basic_auths: Vec<String>,
    pub bearer_tokens: Vec<String>,
    pub ip_whitelist: Vec<String>,
    pub forwardings: ForwardingTable,
    pub ssl: bool,
    pub insecure: bool,
    pub force: bool,
    pub https_only: bool,
    pub allow_preflight: bool,
    pub x_forwarded_for: bool,
    pub reverse_proxy: bool,
    pub original_request_url: bool,
    pub advanced_parsing: bool,
    pub web_debugger: bool,
    pub auto_reconnect: bool,
    pub reconnect_interval_secs: f64,
    pub max_reconnect_attempts: u32,
    pub argument: String,
    pub local_server_tls: String,
    pub header_manipulations: Vec<HeaderRule>,
    pub web_debugger_addr: String,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            server_address: DEFAULT_SERVER_ADDRESS.to_string(),
            sni_server_name: String::new(),
            token: String::new(),
            basic_auths: Vec::new(),
            bearer_tokens: Vec::new(),
            ip_whitelist: Vec::new(),
            forwardings: ForwardingTable::new(),
            ssl: false,
            insecure: false,
            force: false,
            https_only: false,
            allow_preflight: false,
            x_forwarded_for: false,
            reverse_proxy: true,
            original_request_url: false,
            advanced_parsing: true,
            web_debugger: false,
            auto_reconnect: false,
            reconnect_interval_secs: DEFAULT_RECONNECT_INTERVAL_SECS,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            argument: String::new(),
            local_server_tls: String::new(),
            header_manipulations: Vec::new(),
            web_debugger_addr: DEFAULT_WEB_DEBUGGER_ADDR.to_string(),
        }
    }
}

impl TunnelConfig {
    pub fn flag(&self, flag: ConfigFlag) -> bool {
        match flag {
            ConfigFlag::Ssl => self.ssl,
            ConfigFlag::Insecure => self.insecure,
            ConfigFlag::Force => self.force,
            ConfigFlag::HttpsOnly => self.https_only,
            ConfigFlag::AllowPreflight => self.allow_preflight,
            ConfigFlag::XForwardedFor => self.x_forwarded_for,
            ConfigFlag::ReverseProxy => self.reverse_proxy,
            ConfigFlag::OriginalRequestUrl => self.original_request_url,
            ConfigFlag::AdvancedParsing => self.advanced_parsing,
            ConfigFlag::WebDebugger => self.web_debugger,
            ConfigFlag::AutoReconnect => self.auto_reconnect,
        }
    }

    pub fn set_flag(&mut self, flag: ConfigFlag, value: bool) {
        let slot = match flag {
            ConfigFlag::Ssl => &mut self.ssl,
            ConfigFlag::Insecure => &mut self.insecure,
            ConfigFlag::Force => &mut self.force,
            ConfigFlag::HttpsOnly => &mut self.https_only,
            ConfigFlag::AllowPreflight => &mut self.allow_preflight,
            ConfigFlag::XForwardedFor => &mut self.x_forwarded_for,
            ConfigFlag::ReverseProxy => &mut self.reverse_proxy,
            ConfigFlag::OriginalRequestUrl => &mut self.original_request_url,
            ConfigFlag::AdvancedParsing => &mut self.advanced_parsing,
            ConfigFlag::WebDebugger => &mut self.web_debugger,
            ConfigFlag::AutoReconnect => &mut self.auto_reconnect,
        };
        *slot = value;
    }

    pub fn text(&self, field: ConfigText) -> &str {
        match field {
            ConfigText::ServerAddress => &self.server_address,
            ConfigText::SniServerName => &self.sni_server_name,
            ConfigText::Token => &self.token,
            ConfigText::Argument => &self.argument,
            ConfigText::LocalServerTls => &self.local_server_tls,
            ConfigText::WebDebuggerAddr => &self.web_debugger_addr,
        }
    }

    pub fn set_text(&mut self, field: ConfigText, value: &str) -> Result<()> {
        if value.len() > MAX_TEXT_LEN {
            return Err(BridgeError::validation(format!(
                "{field:?} exceeds {MAX_TEXT_LEN} bytes"
            )));
        }
        match field {
            ConfigText::ServerAddress | ConfigText::WebDebuggerAddr if !value.is_empty() => {
                let (host, _) = split_host_port(value)?;
                if host.is_empty() || host.chars().any(char::is_whitespace) {
                    return Err(BridgeError::validation(format!(
                        "{field:?} '{value}' has no usable host"
                    )));
                }
            }
            ConfigText::SniServerName | ConfigText::LocalServerTls
                if value.chars().any(|c| c.is_whitespace() || c == '/') =>
            {
                return Err(BridgeError::validation(format!(
                    "{field:?} must be a bare host name"
                )));
            }
            ConfigText::Token if value.chars().any(char::is_control) => {
                return Err(BridgeError::validation("token contains control characters"));
            }
            _ => {}
        }
        let slot = match field {
            ConfigText::ServerAddress => &mut self.server_address,
            ConfigText::SniServerName => &mut self.sni_server_name,
            ConfigText::Token => &mut self.token,
            ConfigText::Argument => &mut self.argument,
            ConfigText::LocalServerTls => &mut self.local_server_tls,
            ConfigText::WebDebuggerAddr => &mut self.web_debugger_addr,
        };
        *slot = value.to_string();
        Ok(())
    }

    pub fn list(&self, list: ConfigList) -> &[String] {
        match list {
            ConfigList::BasicAuths => &self.basic_auths,
            ConfigList::BearerTokens => &self.bearer_tokens,
            ConfigList::IpWhitelist => &self.ip_whitelist,
        }
    }

    pub fn list_json(&self, list: ConfigList) -> String {
        serde_json::to_string(self.list(list)).unwrap_or_else(|_| "[]".to_string())
    }

    /// Replaces a list from a JSON array of strings; an empty document clears it.
    pub fn set_list_json(&mut self, list: ConfigList, json: &str) -> Result<()> {
        let entries: Vec<String> = if json.trim().is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(json).map_err(|error| {
                BridgeError::validation(format!("{list:?} must be a JSON array of strings: {error}"))
            })?
        };
        self.set_list(list, entries)
    }

    pub fn set_list(&mut self, list: ConfigList, entries: Vec<String>) -> Result<()> {
        if entries.len() > MAX_LIST_ENTRIES {
            return Err(BridgeError::validation(format!(
                "{list:?} is limited to {MAX_LIST_ENTRIES} entries"
            )));
        }
        for entry in &entries {
            match list {
                ConfigList::BasicAuths => validate_basic_auth(entry)?,
                ConfigList::BearerTokens => {
                    if entry.is_empty() || entry.chars().any(char::is_whitespace) {
                        return Err(BridgeError::validation(
                            "bearer tokens must be non-empty and contain no whitespace",
                        ));
                    }
                }
                ConfigList::IpWhitelist => validate_ip_or_cidr(entry)?,
            }
        }
        let slot = match list {
            ConfigList::BasicAuths => &mut self.basic_auths,
            ConfigList::BearerTokens => &mut self.bearer_tokens,
            ConfigList::IpWhitelist => &mut self.ip_whitelist,
        };
        *slot = entries;
        Ok(())
    }

    /// Accepts any non-negative number of seconds a `Duration` can hold.
    pub fn set_reconnect_interval(&mut self, seconds: f64) -> Result<()> {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(BridgeError::validation(format!(
                "reconnect interval must be a non-negative number of seconds, got {seconds}"
            )));
        }
        if Duration::try_from_secs_f64(seconds).is_err() {
            return Err(BridgeError::validation(format!(
                "reconnect interval of {seconds} seconds is too large"
            )));
        }
        self.reconnect_interval_secs = seconds;
        Ok(())
    }

    /// Out-of-range values written straight to the field saturate.
    pub fn reconnect_interval(&self) -> Duration {
        let seconds = self.reconnect_interval_secs;
        if seconds > 0.0 {
            Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
        } else {
            Duration::ZERO
        }
    }

    pub fn header_manipulations_json(&self) -> String {
        serde_json::to_string(&self.header_manipulations).unwrap_or_else(|_| "[]".to_string())
    }

    pub fn set_header_manipulations_json(&mut self, json: &str) -> Result<()> {
        self.header_manipulations = headers::parse_rules(json)?;
        Ok(())
    }

    /// Server address with the default relay and port filled in.
    pub fn resolved_server_address(&self) -> String {
        let address = if self.server_address.is_empty() {
            DEFAULT_SERVER_ADDRESS
        } else {
            self.server_address.as_str()
        };
        match split_host_port(address) {
            Ok((_, Some(_))) => address.to_string(),
            Ok((host, None)) if host.contains(':') => format!("[{host}]:{DEFAULT_SERVER_PORT}"),
            _ => format!("{address}:{DEFAULT_SERVER_PORT}"),
        }
    }

    /// Name presented for TLS; falls back to the server host.
    pub fn effective_sni(&self) -> String {
        if !self.sni_server_name.is_empty() {
            return self.sni_server_name.clone();
        }
        let address = self.resolved_server_address();
        split_host_port(&address)
            .map(|(host, _)| host.to_string())
            .unwrap_or_default()
    }
}

fn validate_basic_auth(entry: &str) -> Result<()> {
    match entry.split_once(':') {
        Some((user, _)) if !user.is_empty() && !user.chars().any(char::is_whitespace) => Ok(()),
        _ => Err(BridgeError::validation(format!(
            "basic auth entry '{entry}' must look like user:password"
        ))),
    }
}

fn validate_ip_or_cidr(entry: &str) -> Result<()> {
    let invalid = || BridgeError::validation(format!("'{entry}' is not an IP address or CIDR"));
    let (addr, prefix) = match entry.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (entry, None),
    };
    let ip: IpAddr = addr.parse().map_err(|_| invalid())?;
    if let Some(prefix) = prefix {
        let bits: u8 = prefix.parse().map_err(|_| invalid())?;
        let max = if ip.is_ipv4() { 32 } else { 128 };
        if bits > max {
            return Err(invalid());
        }
    }
    Ok(())
}

/// Owns every live config behind a handle.
pub struct ConfigStore {
    registry: HandleRegistry<Mutex<TunnelConfig>>,
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore {
    pub fn new() -> Self {
        Self {
            registry: HandleRegistry::new(HandleKind::Config),
        }
    }

    pub fn create(&self) -> Result<u32> {
        let handle = self.registry.insert(Mutex::new(TunnelConfig::default()))?;
        logger::breadcrumb(BreadcrumbFlags::CONFIG, format!("config {handle} created"));
        Ok(handle)
    }

    pub fn free(&self, handle: u32) -> Result<()> {
        self.registry.remove(handle)?;
        logger::breadcrumb(BreadcrumbFlags::CONFIG, format!("config {handle} freed"));
        Ok(())
    }

    pub fn read<R>(&self, handle: u32, reader: impl FnOnce(&TunnelConfig) -> R) -> Result<R> {
        let config = self.registry.get(handle)?;
        let guard = config.lock();
        Ok(reader(&guard))
    }

    pub fn update<R>(
        &self,
        handle: u32,
        writer: impl FnOnce(&mut TunnelConfig) -> Result<R>,
    ) -> Result<R> {
        let config = self.registry.get(handle)?;
        let mut guard = config.lock();
        writer(&mut guard)
    }

    /// Deep copy used when a tunnel is initiated.
    pub fn snapshot(&self, handle: u32) -> Result<TunnelConfig> {
        self.read(handle, TunnelConfig::clone)
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn get_flag(&self, handle: u32, flag: ConfigFlag) -> Result<bool> {
        self.read(handle, |config| config.flag(flag))
    }

    pub fn set_flag(&self, handle: u32, flag: ConfigFlag, value: bool) -> Result<()> {
        self.update(handle, |config| {
            config.set_flag(flag, value);
            Ok(())
        })
    }

    pub fn get_text(&self, handle: u32, field: ConfigText) -> Result<String> {
        self.read(handle, |config| config.text(field).to_string())
    }

    pub fn set_text(&self, handle: u32, field: ConfigText, value: &str) -> Result<()> {
        self.update(handle, |config| config.set_text(field, value))
    }

    pub fn get_list_json(&self, handle: u32, list: ConfigList) -> Result<String> {
        self.read(handle, |config| config.list_json(list))
    }

    pub fn set_list_json(&self, handle: u32, list: ConfigList, json: &str) -> Result<()> {
        self.update(handle, |config| config.set_list_json(list, json))
    }

    pub fn get_reconnect_interval(&self, handle: u32) -> Result<f64> {
        self.read(handle, |config| config.reconnect_interval_secs)
    }

    pub fn set_reconnect_interval(&self, handle: u32, seconds: f64) -> Result<()> {
        self.update(handle, |config| config.set_reconnect_interval(seconds))
    }

    pub fn get_max_reconnect_attempts(&self, handle: u32) -> Result<u32> {
        self.read(handle, |config| config.max_reconnect_attempts)
    }

    pub fn set_max_reconnect_attempts(&self, handle: u32, attempts: u32) -> Result<()> {
        self.update(handle, |config| {
            config.max_reconnect_attempts = attempts;
            Ok(())
        })
    }

    pub fn get_header_manipulations(&self, handle: u32) -> Result<String> {
        self.read(handle, TunnelConfig::header_manipulations_json)
    }

    pub fn set_header_manipulations(&self, handle: u32, json: &str) -> Result<()> {
        self.update(handle, |config| config.set_header_manipulations_json(json))
    }

    pub fn get_forwardings(&self, handle: u32) -> Result<String> {
        self.read(handle, |config| config.forwardings.to_json())
    }

    pub fn set_forwardings(&self, handle: u32, json: &str) -> Result<()> {
        self.update(handle, |config| config.forwardings.set_bulk(json))
    }

    pub fn add_forwarding_simple(&self, handle: u32, forward_to: &str) -> Result<()> {
        self.update(handle, |config| config.forwardings.add_simple(forward_to))
    }

    pub fn add_forwarding(
        &self,
        handle: u32,
        forwarding_type: &str,
        binding_url: &str,
        forward_to: &str,
    ) -> Result<()> {
        let forwarding_type = forwarding_type.parse()?;
        self.update(handle, |config| {
            config
                .forwardings
                .add(forwarding_type, binding_url, forward_to)
        })
    }

    pub fn reset_forwardings(&self, handle: u32) -> Result<()> {
        self.update(handle, |config| {
            config.forwardings.reset();
            Ok(())
        })
    }
}
