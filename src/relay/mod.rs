//! Seam between the tunnel engine and whatever actually talks to the relay.
//!
//! The engine only ever sees a `RelayConnector` (dial + negotiate) and the
//! `RelayLink` it hands back. `TcpRelayConnector` is the plaintext reference
//! connector; embedders with a TLS stack install their own.

mod tcp;
pub mod wire;

pub use tcp::TcpRelayConnector;

use crate::config::{HeaderRule, TunnelConfig};
use crate::forwarding::ForwardingRule;
use crate::usage::UsageSample;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Session options sent to the relay with the greeting.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionOptions {
    pub force: bool,
    pub https_only: bool,
    pub allow_preflight: bool,
    pub x_forwarded_for: bool,
    pub reverse_proxy: bool,
    pub original_request_url: bool,
    pub advanced_parsing: bool,
    pub web_debugger: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub basic_auths: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bearer_tokens: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_whitelist: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub header_manipulations: Vec<HeaderRule>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub local_server_tls: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub argument: String,
}

/// Everything a connector needs for one dial attempt.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectRequest {
    /// `host:port`, defaults already applied.
    pub server_address: String,
    pub sni: String,
    pub token: String,
    pub ssl: bool,
    pub insecure: bool,
    pub forwardings: Vec<ForwardingRule>,
    pub options: SessionOptions,
}

impl ConnectRequest {
    /// `forwardings` is the tunnel's live table, which may have grown past the
    /// config snapshot through additional forwarding requests.
    pub fn from_config(config: &TunnelConfig, forwardings: Vec<ForwardingRule>) -> Self {
        Self {
            server_address: config.resolved_server_address(),
            sni: config.effective_sni(),
            token: config.token.clone(),
            ssl: config.ssl,
            insecure: config.insecure,
            forwardings,
            options: SessionOptions {
                force: config.force,
                https_only: config.https_only,
                allow_preflight: config.allow_preflight,
                x_forwarded_for: config.x_forwarded_for,
                reverse_proxy: config.reverse_proxy,
                original_request_url: config.original_request_url,
                advanced_parsing: config.advanced_parsing,
                web_debugger: config.web_debugger,
                basic_auths: config.basic_auths.clone(),
                bearer_tokens: config.bearer_tokens.clone(),
                ip_whitelist: config.ip_whitelist.clone(),
                header_manipulations: config.header_manipulations.clone(),
                local_server_tls: config.local_server_tls.clone(),
                argument: config.argument.clone(),
            },
        }
    }
}

/// What the relay handed back after a successful greeting.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Established {
    pub urls: Vec<String>,
    pub messages: Vec<String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The relay answered and said no (bad token, conflicting forwarding).
    #[error("{message}")]
    Rejected { code: u32, message: String },
    #[error("i/o error: {0}")]
    Io(String),
    #[error("timed out after {0} ms")]
    Timeout(u64),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("{0}")]
    Unsupported(String),
}

pub const CODE_IO: u32 = 1;
pub const CODE_TIMEOUT: u32 = 2;
pub const CODE_PROTOCOL: u32 = 3;
pub const CODE_UNSUPPORTED: u32 = 4;

impl LinkError {
    /// Numeric code carried in `tunnel_error` events.
    pub fn code(&self) -> u32 {
        match self {
            LinkError::Rejected { code, .. } => *code,
            LinkError::Io(_) => CODE_IO,
            LinkError::Timeout(_) => CODE_TIMEOUT,
            LinkError::Protocol(_) => CODE_PROTOCOL,
            LinkError::Unsupported(_) => CODE_UNSUPPORTED,
        }
    }
}

impl From<std::io::Error> for LinkError {
    fn from(error: std::io::Error) -> Self {
        LinkError::Io(error.to_string())
    }
}

/// Unsolicited traffic from an established link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkNotice {
    ForwardingChanged { url_map: String },
    /// Non-fatal problem; the session carries on.
    Warning { code: u32, message: String },
    Usage(UsageSample),
    /// The relay is about to drop the session.
    Fatal { code: u32, message: String },
    Closed { error: String, messages: Vec<String> },
}

pub trait RelayConnector: Send + Sync {
    /// Dials and negotiates one session.
    fn connect(
        &self,
        request: ConnectRequest,
    ) -> BoxFuture<'static, Result<(Box<dyn RelayLink>, Established), LinkError>>;
}

pub trait RelayLink: Send {
    /// Next notice from the relay. Must be cancel-safe: the engine races it
    /// against stop requests and host commands.
    fn next_notice(&mut self) -> BoxFuture<'_, LinkNotice>;

    /// Asks the relay to add one forwarding to the running session.
    fn request_forwarding(&mut self, rule: ForwardingRule) -> BoxFuture<'_, Result<(), LinkError>>;

    fn close(&mut self) -> BoxFuture<'_, ()>;
}
