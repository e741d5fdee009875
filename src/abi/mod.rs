//! Exported `extern "C"` surface over the config and tunnel stores.
//!
//! Conventions shared by every export:
//! - handles are `u32`, and `0` is returned where creation fails;
//! - fallible calls return `false` (or a negative number) and park the error
//!   in the calling thread's last-exception slot;
//! - variable-length outputs use the two-phase protocol of `ffi::copy_string`.

pub mod config;
pub mod tunnel;

use crate::error::{record, Result};
use crate::ffi::copy_string;
use std::ffi::c_char;

/// Writes a string result through the two-phase protocol, or returns `-1`
/// after recording the error.
///
/// # Safety
/// `buffer`, when non-null, must be writable for `capacity` bytes.
unsafe fn output_string(result: Result<String>, buffer: *mut c_char, capacity: usize) -> i64 {
    match record(result) {
        Some(value) => unsafe { copy_string(&value, buffer, capacity) },
        None => -1,
    }
}

fn output_status(result: Result<()>) -> bool {
    record(result).is_some()
}
