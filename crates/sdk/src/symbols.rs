//! Host module export names and callback signatures
//!
//! These strings must match exactly what the consumer module exports.
//! Every setter takes a (capture, reset) pair of `cdecl` function pointers.

use std::ffi::{c_char, c_int, c_void};

use crate::backend::Backend;
use crate::frame::FrameDescriptor;

/// Setter for the Direct3D 9 capture pair
pub const SET_D3D9_CALLBACKS: &[u8] = b"set_d3d9_capture_callbacks\0";

/// Setter for the Direct3D 10/11 capture pair
pub const SET_D3D11_CALLBACKS: &[u8] = b"set_d3d11_capture_callbacks\0";

/// Setter for the Direct3D 12 capture pair
pub const SET_D3D12_CALLBACKS: &[u8] = b"set_d3d12_capture_callbacks\0";

/// Setter for the OpenGL capture pair
pub const SET_OGL_CALLBACKS: &[u8] = b"set_ogl_capture_callbacks\0";

/// Setter for the Vulkan capture pair
pub const SET_VULKAN_CALLBACKS: &[u8] = b"set_vulkan_capture_callbacks\0";

/// Host logger, handed to our log callback setter
pub const WRITE_LOG: &[u8] = b"write_log\0";

/// Optional host notification for a captured frame
pub const CAPTURE_FRAME_READY: &[u8] = b"capture_frame_ready\0";

/// Optional host notification for a reset
pub const CAPTURE_RESET_NOTIFY: &[u8] = b"capture_reset_notify\0";

/// Setter symbols in backend slot order, for iteration
pub const SETTER_SYMBOLS: [(Backend, &[u8]); Backend::COUNT] = [
    (Backend::D3D9, SET_D3D9_CALLBACKS),
    (Backend::D3D11, SET_D3D11_CALLBACKS),
    (Backend::D3D12, SET_D3D12_CALLBACKS),
    (Backend::OpenGL, SET_OGL_CALLBACKS),
    (Backend::Vulkan, SET_VULKAN_CALLBACKS),
];

/// Look up the setter symbol for a backend
pub fn setter_symbol(backend: Backend) -> &'static [u8] {
    SETTER_SYMBOLS[backend.index()].1
}

/// Host setter entry point: `bool set_xxx_capture_callbacks(capture, reset)`
pub type SetCallbacksFn =
    unsafe extern "C" fn(capture: *const c_void, reset: *const c_void) -> bool;

/// Capture callback with the widest argument list (Vulkan passes three)
///
/// Backends with fewer arguments ignore the trailing ones; the cdecl
/// convention makes the narrower host call sites compatible.
pub type CaptureFn =
    unsafe extern "C" fn(a: *mut c_void, b: *mut c_void, c: *mut c_void) -> bool;

/// Reset callback; D3D backends ignore the context argument
pub type ResetFn = unsafe extern "C" fn(context: *mut c_void) -> bool;

/// External logger: `void write_log(int level, const char* message)`
pub type LogFn = unsafe extern "C" fn(level: c_int, message: *const c_char);

/// Optional host frame notification
pub type FrameReadyFn = unsafe extern "C" fn(frame: *const FrameDescriptor);

/// Optional host reset notification
pub type ResetNotifyFn = unsafe extern "C" fn(backend: u32);

/// Log levels understood by the host logger
pub mod log_level {
    pub const ERROR: i32 = 0;
    pub const WARN: i32 = 1;
    pub const INFO: i32 = 2;
    pub const DEBUG: i32 = 3;
    pub const TRACE: i32 = 4;
}
