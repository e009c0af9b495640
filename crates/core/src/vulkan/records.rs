//! Per-device, per-queue and per-swapchain state

use std::collections::HashMap;
use std::ffi::{c_char, CStr};
use std::sync::Arc;

use ash::vk;
use bitflags::bitflags;

use super::chain::DeviceDispatch;
use super::ops::{DeviceOps, ExportTarget};
use crate::frame::{FrameKey, SurfaceDesc};

/// A queue handed out by vkGetDeviceQueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueRecord {
    pub queue: vk::Queue,
    pub device: vk::Device,
    pub family_index: u32,
    pub flags: vk::QueueFlags,
    pub timestamp_valid_bits: u32,
}

/// Lowest-indexed family with graphics capability
pub fn select_graphics_family(families: &[vk::QueueFamilyProperties]) -> Option<u32> {
    families
        .iter()
        .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|index| index as u32)
}

bitflags! {
    /// External memory extensions enabled on a device
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct ExternalMemoryCaps: u32 {
        const EXPORT_WIN32 = 1 << 0;
        const EXPORT_FD = 1 << 1;
    }
}

impl ExternalMemoryCaps {
    /// Capability for the extension name, if it is one we care about
    pub fn from_extension(name: &CStr) -> Self {
        match name.to_bytes() {
            b"VK_KHR_external_memory_win32" => Self::EXPORT_WIN32,
            b"VK_KHR_external_memory_fd" => Self::EXPORT_FD,
            _ => Self::empty(),
        }
    }

    pub fn from_extensions<'a>(names: impl IntoIterator<Item = &'a CStr>) -> Self {
        names
            .into_iter()
            .fold(Self::empty(), |caps, name| caps | Self::from_extension(name))
    }

    /// Read the enabled extension list of a device create info
    ///
    /// # Safety
    /// `names` must point at `count` valid C strings
    pub unsafe fn from_raw_extensions(names: *const *const c_char, count: u32) -> Self {
        if names.is_null() {
            return Self::empty();
        }
        let names = std::slice::from_raw_parts(names, count as usize);
        Self::from_extensions(names.iter().filter(|p| !p.is_null()).map(|p| CStr::from_ptr(*p)))
    }

    /// The export capability this platform uses
    pub fn native() -> Self {
        if cfg!(windows) {
            Self::EXPORT_WIN32
        } else {
            Self::EXPORT_FD
        }
    }

    pub fn can_export(&self) -> bool {
        self.contains(Self::native())
    }
}

/// A swapchain and what has been learned about it
#[derive(Debug, Clone)]
pub struct SwapchainRecord {
    pub handle: vk::SwapchainKHR,
    pub surface: vk::SurfaceKHR,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub usage: vk::ImageUsageFlags,
    /// Native window of the surface, 0 if unknown
    pub window: u64,
    pub images: Vec<vk::Image>,
    /// Images enumerated and export decided
    pub resolved: bool,
    pub exportable: bool,
    /// Last present reported SUBOPTIMAL
    pub suboptimal: bool,
    pub target: Option<ExportTarget>,
    pub frame: Option<FrameKey>,
}

impl SwapchainRecord {
    pub fn new(handle: vk::SwapchainKHR, info: &vk::SwapchainCreateInfoKHR, window: u64) -> Self {
        Self {
            handle,
            surface: info.surface,
            format: info.image_format,
            extent: info.image_extent,
            usage: info.image_usage,
            window,
            images: Vec::new(),
            resolved: false,
            exportable: false,
            suboptimal: false,
            target: None,
            frame: None,
        }
    }

    pub fn desc(&self) -> SurfaceDesc {
        SurfaceDesc::new(
            self.format.as_raw() as u32,
            self.extent.width,
            self.extent.height,
        )
    }

    /// Forget everything learned since creation
    ///
    /// Returns the export target and frame key for the caller to dispose of.
    pub fn invalidate(&mut self) -> (Option<ExportTarget>, Option<FrameKey>) {
        self.images.clear();
        self.resolved = false;
        self.exportable = false;
        (self.target.take(), self.frame.take())
    }
}

/// A logical device
pub struct DeviceRecord {
    pub device: vk::Device,
    pub physical_device: vk::PhysicalDevice,
    pub families: Vec<vk::QueueFamilyProperties>,
    pub graphics_family: Option<u32>,
    /// First queue retrieved from the graphics family
    pub graphics: Option<QueueRecord>,
    pub queues: Vec<QueueRecord>,
    pub caps: ExternalMemoryCaps,
    pub ops: Box<dyn DeviceOps>,
    /// None when tracked without a driver below
    pub next: Option<Arc<DeviceDispatch>>,
    pub swapchains: HashMap<vk::SwapchainKHR, SwapchainRecord>,
}

impl DeviceRecord {
    /// Whether frames from this device can ever be captured
    pub fn can_capture(&self) -> bool {
        self.graphics_family.is_some() && self.caps.can_export()
    }

    pub fn queue(&self, queue: vk::Queue) -> Option<&QueueRecord> {
        self.queues.iter().find(|record| record.queue == queue)
    }

    pub fn record_queue(&mut self, queue: vk::Queue, family_index: u32) -> QueueRecord {
        if let Some(existing) = self.queue(queue) {
            return *existing;
        }

        let family = self.families.get(family_index as usize).copied().unwrap_or_default();
        let record = QueueRecord {
            queue,
            device: self.device,
            family_index,
            flags: family.queue_flags,
            timestamp_valid_bits: family.timestamp_valid_bits,
        };
        self.queues.push(record);
        if self.graphics.is_none() && Some(family_index) == self.graphics_family {
            self.graphics = Some(record);
        }
        record
    }
}
