//! gcap SDK - Native Graphics Type Definitions
//!
//! This crate contains the types shared between the capture hook and the
//! module that hosts it. It has no dependencies and compiles quickly,
//! allowing parallel compilation of dependent crates.
//!
//! # Modules
//!
//! - [`backend`] - Graphics backend identifiers
//! - [`interfaces`] - Opaque COM/GL handle types and vtable layouts
//! - [`symbols`] - Host module export names and callback signatures
//! - [`frame`] - The frame descriptor handed to the capture sink

pub mod backend;
pub mod frame;
pub mod interfaces;
pub mod symbols;

pub use backend::Backend;
pub use frame::{FrameDescriptor, HandleKind};
pub use interfaces::*;
pub use symbols::{CaptureFn, LogFn, ResetFn, SetCallbacksFn, SETTER_SYMBOLS};
