//! Process-wide settings (log file, log switch, debug verbosity).
//!
//! Setters stage values; the first `initialize` (explicit, or implicit on the
//! first config/tunnel creation) commits them exactly once. Later staging is
//! rejected so every component sees one consistent environment.

use crate::error::{BridgeError, Result};
use crate::logger::{self, BreadcrumbFlags};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::path::PathBuf;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Environment {
    pub log_path: Option<PathBuf>,
    pub log_enabled: bool,
    pub debug: bool,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            log_path: None,
            log_enabled: true,
            debug: false,
        }
    }
}

static STAGED: Mutex<Option<Environment>> = Mutex::new(None);
static COMMITTED: OnceCell<Environment> = OnceCell::new();

fn stage(update: impl FnOnce(&mut Environment)) -> Result<()> {
    if COMMITTED.get().is_some() {
        return Err(BridgeError::invalid_state(
            "environment is already initialized",
        ));
    }
    let mut staged = STAGED.lock();
    update(staged.get_or_insert_with(Environment::default));
    Ok(())
}

pub fn set_log_path(path: &str) -> Result<()> {
    let path = if path.is_empty() {
        None
    } else {
        Some(PathBuf::from(path))
    };
    stage(|env| env.log_path = path)
}

pub fn set_log_enabled(enabled: bool) -> Result<()> {
    stage(|env| env.log_enabled = enabled)
}

pub fn set_debug(debug: bool) -> Result<()> {
    stage(|env| env.debug = debug)
}

/// Commits the staged environment. Returns `true` for the call that actually
/// performed the initialization.
pub fn initialize() -> Result<bool> {
    let mut first = false;
    let committed = COMMITTED.get_or_try_init(|| {
        let env = STAGED.lock().clone().unwrap_or_default();
        logger::configure(env.log_enabled, env.debug, env.log_path.as_deref()).map_err(
            |error| {
                BridgeError::validation(format!(
                    "cannot open log file {:?}: {error}",
                    env.log_path
                ))
            },
        )?;
        first = true;
        Ok::<_, BridgeError>(env)
    })?;
    if first {
        logger::breadcrumb(
            BreadcrumbFlags::FFI,
            format!(
                "environment initialized (log_enabled={}, debug={}, log_path={:?})",
                committed.log_enabled, committed.debug, committed.log_path
            ),
        );
    }
    Ok(first)
}

/// Commits with whatever has been staged so far; used implicitly before the
/// first object is created.
pub fn ensure_initialized() {
    if COMMITTED.get().is_some() {
        return;
    }
    if let Err(error) = initialize() {
        logger::warn(format!("environment initialization failed: {error}"));
    }
}
