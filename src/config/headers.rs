use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};

const MAX_HEADER_RULES: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderAction {
    Add,
    Remove,
    Update,
}

/// One request-header rewrite applied by the relay before forwarding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderRule {
    pub action: HeaderAction,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl HeaderRule {
    fn validate(&self) -> Result<()> {
        if self.key.is_empty()
            || self
                .key
                .chars()
                .any(|c| c.is_whitespace() || c.is_control() || c == ':')
        {
            return Err(BridgeError::validation(format!(
                "invalid header name '{}'",
                self.key
            )));
        }
        match (self.action, &self.value) {
            (HeaderAction::Remove, Some(_)) => Err(BridgeError::validation(format!(
                "remove rule for '{}' must not carry a value",
                self.key
            ))),
            (HeaderAction::Add | HeaderAction::Update, None) => Err(BridgeError::validation(
                format!("rule for '{}' needs a value", self.key),
            )),
            (_, Some(value)) if value.chars().any(|c| c == '\r' || c == '\n') => Err(
                BridgeError::validation(format!("value for '{}' spans lines", self.key)),
            ),
            _ => Ok(()),
        }
    }
}

pub(super) fn parse_rules(json: &str) -> Result<Vec<HeaderRule>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let rules: Vec<HeaderRule> = serde_json::from_str(json)
        .map_err(|error| BridgeError::validation(format!("invalid header rules JSON: {error}")))?;
    if rules.len() > MAX_HEADER_RULES {
        return Err(BridgeError::validation(format!(
            "at most {MAX_HEADER_RULES} header rules are allowed"
        )));
    }
    for rule in &rules {
        rule.validate()?;
    }
    Ok(rules)
}
