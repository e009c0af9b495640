//! gcap core - capture backends and event forwarding
//!
//! This crate holds everything that runs when the host presents a frame:
//! the per-API capture backends, the Vulkan layer and its state tracker, and
//! the forwarder that hands frames and resets to the consumer.
//!
//! # Re-exports
//!
//! This crate re-exports the SDK and engine crates for convenience:
//! - [`sdk`] - native type definitions and host symbol names
//! - [`engine`] - host module resolution and the dispatch table

pub use gcap_engine as engine;
pub use gcap_sdk as sdk;

pub mod backends;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod frame;
pub mod runtime;
pub mod vulkan;

pub use backends::{SurfaceCapture, SurfaceReader};
pub use config::{ConfigError, ConfigResult, FeatureFlags, HookConfig};
pub use error::{CaptureResult, CaptureSkip};
pub use forwarder::{CaptureForwarder, FrameSink, HostSink, TracingSink};
pub use frame::{FrameKey, FrameRegistry, NativeHandle, SurfaceDesc};
pub use runtime::{init_runtime, runtime, try_runtime, HookRuntime};
pub use vulkan::VulkanTracker;
