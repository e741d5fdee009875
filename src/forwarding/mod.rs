//! Ordered forwarding rules (binding URL -> local target) and their JSON wire
//! format.
//!
//! Validation is structural only: nothing here resolves hostnames or probes
//! the local target.

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

pub const MAX_RULES: usize = 64;
const MAX_LABEL_LEN: usize = 63;
const MAX_HOST_LEN: usize = 253;

/// Serialized lowercase; parsed through `FromStr` so JSON input accepts the
/// same spellings as the per-rule setters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum ForwardingType {
    #[default]
    Http,
    Tcp,
    Udp,
    Tls,
    TlsTcp,
}

impl ForwardingType {
    pub fn as_str(self) -> &'static str {
        match self {
            ForwardingType::Http => "http",
            ForwardingType::Tcp => "tcp",
            ForwardingType::Udp => "udp",
            ForwardingType::Tls => "tls",
            ForwardingType::TlsTcp => "tlstcp",
        }
    }
}

impl fmt::Display for ForwardingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ForwardingType {
    type Err = BridgeError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "http" => Ok(ForwardingType::Http),
            "tcp" => Ok(ForwardingType::Tcp),
            "udp" => Ok(ForwardingType::Udp),
            "tls" => Ok(ForwardingType::Tls),
            "tlstcp" => Ok(ForwardingType::TlsTcp),
            other => Err(BridgeError::validation(format!(
                "unknown forwarding type '{other}'"
            ))),
        }
    }
}

impl TryFrom<String> for ForwardingType {
    type Error = BridgeError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardingRule {
    #[serde(rename = "type", default)]
    pub forwarding_type: ForwardingType,
    #[serde(default)]
    pub binding_url: String,
    pub forward_to: String,
}

impl ForwardingRule {
    /// Builds a rule after checking both endpoints.
    pub fn new(
        forwarding_type: ForwardingType,
        binding_url: impl Into<String>,
        forward_to: impl Into<String>,
    ) -> Result<Self> {
        let rule = Self {
            forwarding_type,
            binding_url: binding_url.into().trim().to_string(),
            forward_to: forward_to.into().trim().to_string(),
        };
        rule.validate()?;
        Ok(rule)
    }

    pub fn validate(&self) -> Result<()> {
        validate_binding_url(&self.binding_url)?;
        validate_forward_to(&self.forward_to)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ForwardingTable {
    rules: Vec<ForwardingRule>,
}

impl ForwardingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an http rule with an automatically assigned binding.
    pub fn add_simple(&mut self, forward_to: &str) -> Result<()> {
        self.add(ForwardingType::Http, "", forward_to)
    }

    pub fn add(
        &mut self,
        forwarding_type: ForwardingType,
        binding_url: &str,
        forward_to: &str,
    ) -> Result<()> {
        let rule = ForwardingRule::new(forwarding_type, binding_url, forward_to)?;
        self.push(rule)
    }

    pub fn push(&mut self, rule: ForwardingRule) -> Result<()> {
        if self.rules.len() >= MAX_RULES {
            return Err(BridgeError::validation(format!(
                "forwarding table is limited to {MAX_RULES} rules"
            )));
        }
        self.rules.push(rule);
        Ok(())
    }

    /// Replaces the whole table. Nothing changes unless every rule parses and
    /// validates.
    pub fn set_bulk(&mut self, json: &str) -> Result<()> {
        let parsed = parse_rules(json)?;
        self.rules = parsed;
        Ok(())
    }

    pub fn reset(&mut self) {
        self.rules.clear();
    }

    pub fn rules(&self) -> &[ForwardingRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.rules).unwrap_or_else(|_| "[]".to_string())
    }
}

pub fn parse_rules(json: &str) -> Result<Vec<ForwardingRule>> {
    let trimmed = json.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let rules: Vec<ForwardingRule> = serde_json::from_str(trimmed)
        .map_err(|error| BridgeError::validation(format!("invalid forwarding JSON: {error}")))?;
    if rules.len() > MAX_RULES {
        return Err(BridgeError::validation(format!(
            "forwarding table is limited to {MAX_RULES} rules"
        )));
    }
    rules
        .into_iter()
        .enumerate()
        .map(|(index, rule)| {
            ForwardingRule::new(rule.forwarding_type, rule.binding_url, rule.forward_to).map_err(
                |error| BridgeError::validation(format!("forwarding rule {index}: {error}")),
            )
        })
        .collect()
}

/// Accepts empty (auto-assigned), `host:port`, `:port` or a bare subdomain.
pub fn validate_binding_url(value: &str) -> Result<()> {
    if value.is_empty() {
        return Ok(());
    }
    if value.contains("://") {
        return Err(BridgeError::validation(format!(
            "binding url '{value}' must not carry a scheme"
        )));
    }
    match split_host_port(value)? {
        (host, Some(_)) if host.is_empty() => Ok(()),
        (host, _) => validate_host(host)
            .map_err(|reason| BridgeError::validation(format!("binding url '{value}': {reason}"))),
    }
}

/// Accepts a URL with scheme, `host:port` or `:port`.
pub fn validate_forward_to(value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(BridgeError::validation("forward_to must not be empty"));
    }
    if value.contains("://") {
        let url = Url::parse(value)
            .map_err(|error| BridgeError::validation(format!("forward_to '{value}': {error}")))?;
        if url.host_str().map(str::is_empty).unwrap_or(true) {
            return Err(BridgeError::validation(format!(
                "forward_to '{value}' has no host"
            )));
        }
        return Ok(());
    }
    match split_host_port(value)? {
        (_, None) => Err(BridgeError::validation(format!(
            "forward_to '{value}' needs a port"
        ))),
        (host, Some(_)) if host.is_empty() => Ok(()),
        (host, Some(_)) => validate_host(host)
            .map_err(|reason| BridgeError::validation(format!("forward_to '{value}': {reason}"))),
    }
}

/// Splits `host[:port]`, accepting bracketed IPv6 literals.
pub fn split_host_port(value: &str) -> Result<(&str, Option<u16>)> {
    let invalid_port = |port: &str| {
        BridgeError::validation(format!("invalid port '{port}' in '{value}'"))
    };
    if let Some(rest) = value.strip_prefix('[') {
        let Some((host, tail)) = rest.split_once(']') else {
            return Err(BridgeError::validation(format!(
                "unterminated IPv6 literal in '{value}'"
            )));
        };
        return match tail {
            "" => Ok((host, None)),
            _ => {
                let port = tail.strip_prefix(':').ok_or_else(|| invalid_port(tail))?;
                Ok((host, Some(parse_port(port).ok_or_else(|| invalid_port(port))?)))
            }
        };
    }
    match value.rsplit_once(':') {
        Some((host, port)) => {
            if host.contains(':') {
                return Err(BridgeError::validation(format!(
                    "IPv6 address in '{value}' must be bracketed"
                )));
            }
            let port = parse_port(port).ok_or_else(|| invalid_port(port))?;
            Ok((host, Some(port)))
        }
        None => Ok((value, None)),
    }
}

fn parse_port(value: &str) -> Option<u16> {
    value.parse::<u16>().ok().filter(|port| *port != 0)
}

fn validate_host(host: &str) -> std::result::Result<(), &'static str> {
    if host.is_empty() {
        return Err("host is empty");
    }
    if host.parse::<std::net::IpAddr>().is_ok() {
        return Ok(());
    }
    if host.len() > MAX_HOST_LEN {
        return Err("host name too long");
    }
    for label in host.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err("malformed host label");
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err("host label may not start or end with '-'");
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err("host contains invalid characters");
        }
    }
    Ok(())
}
