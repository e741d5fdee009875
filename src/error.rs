//! Error taxonomy shared by every synchronous entry point.
//!
//! Asynchronous failures (authentication, link loss) never surface here; they
//! travel through the event sinks instead.

use std::cell::RefCell;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleKind {
    Config,
    Tunnel,
}

impl HandleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HandleKind::Config => "config",
            HandleKind::Tunnel => "tunnel",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("unknown or stale {} handle {handle}", kind.as_str())]
    InvalidHandle { kind: HandleKind, handle: u32 },
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    InvalidState(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("transient error: {0}")]
    Transient(String),
    #[error("fatal error: {0}")]
    Fatal(String),
    #[error("runtime unavailable: {0}")]
    Runtime(String),
}

impl BridgeError {
    pub fn validation(message: impl Into<String>) -> Self {
        BridgeError::Validation(message.into())
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        BridgeError::InvalidState(message.into())
    }

    /// Exception type name reported to the host runtime.
    pub fn kind_name(&self) -> &'static str {
        match self {
            BridgeError::InvalidHandle { .. } => "InvalidHandle",
            BridgeError::Validation(_) => "ValidationError",
            BridgeError::InvalidState(_) => "InvalidStateError",
            BridgeError::Connection(_) => "ConnectionError",
            BridgeError::Transient(_) => "TransientError",
            BridgeError::Fatal(_) => "FatalError",
            BridgeError::Runtime(_) => "RuntimeError",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LastException {
    pub kind: String,
    pub message: String,
}

thread_local! {
    static LAST_EXCEPTION: RefCell<Option<LastException>> = const { RefCell::new(None) };
}

/// Records `error` as the calling thread's last exception.
pub fn set_last_exception(error: &BridgeError) {
    let exception = LastException {
        kind: error.kind_name().to_string(),
        message: error.to_string(),
    };
    LAST_EXCEPTION.with(|slot| *slot.borrow_mut() = Some(exception));
}

pub fn has_last_exception() -> bool {
    LAST_EXCEPTION.with(|slot| slot.borrow().is_some())
}

pub fn peek_last_exception() -> Option<LastException> {
    LAST_EXCEPTION.with(|slot| slot.borrow().clone())
}

pub fn take_last_exception() -> Option<LastException> {
    LAST_EXCEPTION.with(|slot| slot.borrow_mut().take())
}

/// Unwraps a core result at the ABI boundary, parking the error in the
/// last-exception slot.
pub fn record<T>(result: Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(error) => {
            crate::logger::debug(format!("{}: {}", error.kind_name(), error));
            set_last_exception(&error);
            None
        }
    }
}
