//! JSON-lines frames spoken by `TcpRelayConnector`. One frame per line,
//! tagged by `type`.

use super::SessionOptions;
use crate::forwarding::ForwardingRule;
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Hello {
        version: u32,
        #[serde(default)]
        token: String,
        #[serde(default)]
        sni: String,
        forwardings: Vec<ForwardingRule>,
        options: SessionOptions,
    },
    Forward {
        id: u64,
        rule: ForwardingRule,
    },
    Close,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Welcome {
        urls: Vec<String>,
        #[serde(default)]
        messages: Vec<String>,
    },
    Reject {
        #[serde(default)]
        code: u32,
        message: String,
    },
    ForwardResult {
        id: u64,
        ok: bool,
        #[serde(default)]
        error: Option<String>,
    },
    ForwardingChanged {
        map: serde_json::Value,
    },
    Warning {
        code: u32,
        message: String,
    },
    Fatal {
        code: u32,
        message: String,
    },
    Usage {
        #[serde(default)]
        live_connections: u64,
        #[serde(default)]
        total_connections: u64,
        #[serde(default)]
        total_req_bytes: u64,
        #[serde(default)]
        total_res_bytes: u64,
        #[serde(default)]
        total_tx_bytes: u64,
    },
    Bye {
        #[serde(default)]
        error: String,
        #[serde(default)]
        messages: Vec<String>,
    },
}

/// Serializes a frame as one newline-terminated line.
pub fn encode_line<T: Serialize>(frame: &T) -> serde_json::Result<Vec<u8>> {
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    Ok(line)
}

pub fn decode_line<T: for<'de> Deserialize<'de>>(line: &str) -> serde_json::Result<T> {
    serde_json::from_str(line.trim_end())
}
