//! Device operations behind the tracker
//!
//! The tracker decides *when* to enumerate, export and copy. [`DeviceOps`]
//! does the actual Vulkan work, so the tracker can be driven without a driver.

use ash::vk;

use crate::error::CaptureResult;

/// Exportable copy destination for one swapchain
///
/// Every handle may be null, so a partially built target can be torn down
/// through the same path as a complete one.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExportTarget {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    /// Exported fd or NT handle
    pub handle: u64,
    pub size: u64,
    pub command_pool: vk::CommandPool,
    pub command_buffer: vk::CommandBuffer,
    /// Signaled when no copy is in flight
    pub fence: vk::Fence,
    /// One per swapchain image, signaled by the copy for the present to wait on
    pub semaphores: Vec<vk::Semaphore>,
}

/// One copy out of a presented swapchain image
#[derive(Debug, Clone, Copy)]
pub struct CopySource<'a> {
    pub queue: vk::Queue,
    pub image: vk::Image,
    /// Index of `image` in its swapchain
    pub index: usize,
    pub extent: vk::Extent2D,
    /// Semaphores the copy waits on. A successful wait consumes them.
    pub wait: &'a [vk::Semaphore],
    /// Signal the image's semaphore so the present can wait on the copy
    pub signal: bool,
}

/// Vulkan work a tracked device can do
pub trait DeviceOps: Send + Sync {
    /// Enumerate swapchain images, count then fill
    ///
    /// # Safety
    /// `swapchain` must be a live swapchain of this device
    unsafe fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> CaptureResult<Vec<vk::Image>>;

    /// Whether images of this format and usage can be exported
    ///
    /// # Safety
    /// The device must be live
    unsafe fn export_supported(&self, format: vk::Format, usage: vk::ImageUsageFlags) -> bool;

    /// Build the exportable destination image and its copy resources
    ///
    /// # Safety
    /// The device must be live
    unsafe fn create_export_target(
        &self,
        format: vk::Format,
        extent: vk::Extent2D,
        image_count: usize,
    ) -> CaptureResult<ExportTarget>;

    /// Destroy a target, waiting briefly for an in-flight copy
    ///
    /// # Safety
    /// `target` must have come from this device and not be used again
    unsafe fn destroy_export_target(&self, target: ExportTarget);

    /// Record and submit a copy of `source` into the target
    ///
    /// Does not wait for completion; a copy still in flight skips with
    /// [`CaptureSkip::Busy`](crate::error::CaptureSkip::Busy). A failed copy
    /// leaves the target ready for the next one.
    ///
    /// # Returns
    /// The semaphore signaled by the copy, if `source.signal` asked for one.
    /// Only then were `source.wait` consumed.
    ///
    /// # Safety
    /// `source.queue` must belong to this device and `source.image` be a
    /// presentable image
    unsafe fn copy_to_target(
        &self,
        source: &CopySource<'_>,
        target: &mut ExportTarget,
    ) -> CaptureResult<Option<vk::Semaphore>>;
}
