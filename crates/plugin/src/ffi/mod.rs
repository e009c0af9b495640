//! C ABI surface
//!
//! Nothing may unwind into the host: every export runs under [`guarded`].

pub mod exports;
pub mod vulkan;

use std::ffi::c_char;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Run an export body, turning a panic into `fallback`
pub(crate) fn guarded<T>(name: &str, fallback: T, body: impl FnOnce() -> T) -> T {
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(value) => value,
        Err(_) => {
            tracing::error!("Panic in {}", name);
            fallback
        }
    }
}

/// Helper to write an error message to a C buffer
///
/// # Safety
/// - `error` must be a valid pointer or null
/// - `maxlen` must accurately reflect the buffer size
pub(crate) unsafe fn write_error(error: *mut c_char, maxlen: usize, msg: &str) {
    if !error.is_null() && maxlen > 0 {
        let bytes = msg.as_bytes();
        let len = bytes.len().min(maxlen - 1);
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), error as *mut u8, len);
        *error.add(len) = 0;
    }
}
