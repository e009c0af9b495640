//! C-compatible exports called by the host

use std::ffi::{c_char, c_void};

use tracing::instrument;

use gcap_engine::{CaptureSlot, DispatchTable};
use gcap_sdk::{Backend, LogFn};

use super::{guarded, write_error};
use crate::{logging, runtime};

// Metadata - static strings with null terminators for C compatibility
static NAME: &[u8] = b"gcap-hook\0";
static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();

/// Capture/reset callback pair for one backend, bound into the host by attach
macro_rules! backend_callbacks {
    ($backend:expr, $capture:ident, $reset:ident) => {
        extern "C" fn $capture(a: *mut c_void, b: *mut c_void, c: *mut c_void) -> bool {
            guarded(stringify!($capture), false, || unsafe {
                runtime().capture($backend, a, b, c)
            })
        }

        extern "C" fn $reset(context: *mut c_void) -> bool {
            guarded(stringify!($reset), false, || unsafe {
                runtime().reset($backend, context)
            })
        }
    };
}

backend_callbacks!(Backend::D3D9, d3d9_capture, d3d9_reset);
backend_callbacks!(Backend::D3D11, d3d11_capture, d3d11_reset);
backend_callbacks!(Backend::D3D12, d3d12_capture, d3d12_reset);
backend_callbacks!(Backend::OpenGL, opengl_capture, opengl_reset);
backend_callbacks!(Backend::Vulkan, vulkan_capture, vulkan_reset);

/// The callbacks handed to the host, one slot per backend
pub fn dispatch_table() -> DispatchTable {
    DispatchTable::new()
        .with(CaptureSlot::new(Backend::D3D9, d3d9_capture, d3d9_reset))
        .with(CaptureSlot::new(Backend::D3D11, d3d11_capture, d3d11_reset))
        .with(CaptureSlot::new(Backend::D3D12, d3d12_capture, d3d12_reset))
        .with(CaptureSlot::new(Backend::OpenGL, opengl_capture, opengl_reset))
        .with(CaptureSlot::new(Backend::Vulkan, vulkan_capture, vulkan_reset))
}

/// Bind the capture callbacks into the host module
///
/// Polled by the loader until it succeeds. While the host module is not
/// loaded yet, `error` receives the reason and the call returns false.
///
/// # Safety
/// - `error` must be a valid pointer to a buffer of at least `maxlen` bytes, or null
#[no_mangle]
#[instrument(skip_all)]
pub unsafe extern "C" fn gcap_hook_attach(error: *mut c_char, maxlen: usize) -> bool {
    let result = guarded("gcap_hook_attach", Err("Panic during attach".to_string()), || {
        let install_logger = |logger: LogFn| logging::set_host_logger(Some(logger));
        runtime()
            .try_attach(&dispatch_table(), &install_logger)
            .map_err(|e| {
                if e.is_retryable() {
                    tracing::trace!("Attach not ready: {}", e);
                } else {
                    tracing::warn!("Attach failed: {}", e);
                }
                e.to_string()
            })
    });

    match result {
        Ok(()) => {
            tracing::info!("Capture callbacks bound into host");
            true
        }
        Err(msg) => {
            write_error(error, maxlen, &msg);
            false
        }
    }
}

/// Install, replace or clear (null) the logger that receives hook diagnostics
#[no_mangle]
pub extern "C" fn gcap_hook_set_log_callback(logger: Option<LogFn>) {
    logging::set_host_logger(logger);
}

#[no_mangle]
pub extern "C" fn gcap_hook_get_name() -> *const c_char {
    NAME.as_ptr() as *const c_char
}

#[no_mangle]
pub extern "C" fn gcap_hook_get_version() -> *const c_char {
    VERSION.as_ptr() as *const c_char
}
