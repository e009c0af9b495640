//! Vulkan capture
//!
//! Vulkan has no swap chain object the host could hand over, so capture
//! works as an implicit layer: device, queue and swapchain creation are
//! tracked, and presented images are copied into an exportable image that
//! the host can import.

pub mod chain;
pub mod layer;
pub mod native;
pub mod ops;
pub mod records;
pub mod tracker;

pub use layer::{negotiate, NegotiateLayerInterface, LAYER_INTERFACE_VERSION};
pub use ops::{CopySource, DeviceOps, ExportTarget};
pub use records::{select_graphics_family, DeviceRecord, ExternalMemoryCaps, QueueRecord, SwapchainRecord};
pub use tracker::{NewDevice, PresentSync, VulkanTracker};
