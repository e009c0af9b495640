//! gcap engine - host module attach and the capture dispatch table
//!
//! This crate handles:
//! - Finding the already-loaded capture consumer module and its exports
//! - Holding one (capture, reset) callback pair per graphics backend
//! - Binding those pairs into the consumer through its setter exports
//!
//! # Architecture
//!
//! A [`HookInstaller`] owns the cached host module handle. The plugin builds a
//! [`DispatchTable`] once and polls [`HookInstaller::try_attach`] until the
//! consumer module is present.
//!
//! # Thread Safety
//!
//! The dispatch table is written before attach and read-only afterwards. The
//! installer serializes host lookup behind its own lock.

pub mod dispatch;
pub mod error;
pub mod installer;
pub mod loader;

pub use dispatch::{CaptureSlot, DispatchTable};
pub use error::AttachError;
pub use installer::HookInstaller;
pub use loader::{HostModule, ModuleHandle, ModuleResolver, SystemResolver};
