//! Vulkan state tracker
//!
//! Records are keyed by loader dispatch key, so any dispatchable child of a
//! device (queue, command buffer) finds its device record directly.
//!
//! A device entry may stay locked while calling into [`DeviceOps`]: the next
//! layer never calls back into this one. Calls forwarded for the application
//! take an `Arc` of the dispatch table and release the entry first.
//!
//! Any Vulkan reset invalidates every Vulkan frame key, while only the
//! affected swapchains drop their export targets. Swapchains left untouched
//! register a fresh key for their still-live target on their next present.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;
use dashmap::DashMap;

use gcap_sdk::Backend;

use super::chain::{dispatch_key, DeviceDispatch, InstanceDispatch};
use super::ops::{CopySource, DeviceOps};
use super::records::{select_graphics_family, DeviceRecord, ExternalMemoryCaps, QueueRecord, SwapchainRecord};
use crate::error::{CaptureResult, CaptureSkip, SkipLog};
use crate::forwarder::CaptureForwarder;
use crate::frame::{FrameKey, NativeHandle};

/// Semaphore hand-over between the layer's copies and the present
///
/// The first copy that signals one of its own semaphores waits on the
/// application's present semaphores, which consumes them. The present must
/// then wait on what the copies signaled instead.
#[derive(Debug, Default)]
pub struct PresentSync {
    waits: Vec<vk::Semaphore>,
    signals: Vec<vk::Semaphore>,
    /// Whether copies may take over the waits
    take_over: bool,
}

impl PresentSync {
    /// Take over the wait semaphores of a present made through the layer
    ///
    /// # Safety
    /// `present` must be a valid present info
    pub unsafe fn from_present(present: &vk::PresentInfoKHR) -> Self {
        let waits = if present.wait_semaphore_count == 0 || present.p_wait_semaphores.is_null() {
            Vec::new()
        } else {
            std::slice::from_raw_parts(present.p_wait_semaphores, present.wait_semaphore_count as usize).to_vec()
        };
        Self {
            waits,
            signals: Vec::new(),
            take_over: true,
        }
    }

    /// Semaphores the present has to wait on, or None if its own still apply
    pub fn present_waits(&self) -> Option<Vec<vk::Semaphore>> {
        if self.signals.is_empty() {
            return None;
        }
        Some(self.signals.iter().chain(&self.waits).copied().collect())
    }
}

/// A device about to be tracked
pub struct NewDevice {
    pub device: vk::Device,
    pub physical_device: vk::PhysicalDevice,
    pub families: Vec<vk::QueueFamilyProperties>,
    pub caps: ExternalMemoryCaps,
    pub ops: Box<dyn DeviceOps>,
    pub next: Option<Arc<DeviceDispatch>>,
}

pub struct VulkanTracker {
    enabled: bool,
    add_transfer_src: bool,
    instances: DashMap<usize, Arc<InstanceDispatch>>,
    devices: DashMap<usize, DeviceRecord>,
    /// Surface to native window
    surfaces: DashMap<vk::SurfaceKHR, u64>,
    /// Set once the host drives Vulkan capture itself
    host_driven: AtomicBool,
    skips: SkipLog,
}

impl VulkanTracker {
    pub fn new(enabled: bool, add_transfer_src: bool) -> Self {
        Self {
            enabled,
            add_transfer_src,
            instances: DashMap::new(),
            devices: DashMap::new(),
            surfaces: DashMap::new(),
            host_driven: AtomicBool::new(false),
            skips: SkipLog::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_host_driven(&self) -> bool {
        self.host_driven.load(Ordering::Acquire)
    }

    pub fn add_instance(&self, key: usize, dispatch: Arc<InstanceDispatch>) {
        self.instances.insert(key, dispatch);
    }

    pub fn remove_instance(&self, key: usize) -> Option<Arc<InstanceDispatch>> {
        self.instances.remove(&key).map(|(_, dispatch)| dispatch)
    }

    pub fn instance(&self, key: usize) -> Option<Arc<InstanceDispatch>> {
        self.instances.get(&key).map(|entry| entry.clone())
    }

    pub fn add_surface(&self, surface: vk::SurfaceKHR, window: u64) {
        self.surfaces.insert(surface, window);
    }

    pub fn remove_surface(&self, surface: vk::SurfaceKHR) {
        self.surfaces.remove(&surface);
    }

    pub fn add_device(&self, key: usize, new: NewDevice) {
        let graphics_family = select_graphics_family(&new.families);
        match graphics_family {
            Some(family) => tracing::debug!("Device {:#x}: graphics family {}", key, family),
            None => tracing::info!("Device {:#x} has no graphics queue family, capture disabled", key),
        }
        if !new.caps.can_export() {
            tracing::info!("Device {:#x} has no external memory export, capture disabled", key);
        }

        self.devices.insert(
            key,
            DeviceRecord {
                device: new.device,
                physical_device: new.physical_device,
                families: new.families,
                graphics_family,
                graphics: None,
                queues: Vec::new(),
                caps: new.caps,
                ops: new.ops,
                next: new.next,
                swapchains: Default::default(),
            },
        );
    }

    pub fn device_dispatch(&self, key: usize) -> Option<Arc<DeviceDispatch>> {
        self.devices.get(&key).and_then(|record| record.next.clone())
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Stop tracking a device, tearing down its export targets
    pub fn remove_device(&self, key: usize, forwarder: &CaptureForwarder) -> Option<DeviceRecord> {
        let (_, mut record) = self.devices.remove(&key)?;

        let mut had_frames = false;
        for swapchain in record.swapchains.values_mut() {
            had_frames |= Self::dispose(&*record.ops, swapchain, forwarder);
        }
        record.swapchains.clear();
        if had_frames {
            forwarder.on_reset(Backend::Vulkan);
        }
        Some(record)
    }

    pub fn on_queue(&self, key: usize, queue: vk::Queue, family_index: u32) -> Option<QueueRecord> {
        let mut record = self.devices.get_mut(&key)?;
        Some(record.record_queue(queue, family_index))
    }

    pub fn graphics_queue(&self, key: usize) -> Option<QueueRecord> {
        self.devices.get(&key).and_then(|record| record.graphics)
    }

    /// Create info as sent down the chain: TRANSFER_SRC is added so the
    /// images can be copied from
    pub fn swapchain_create_info(&self, info: &vk::SwapchainCreateInfoKHR) -> vk::SwapchainCreateInfoKHR {
        let mut info = *info;
        if self.enabled && self.add_transfer_src {
            info.image_usage |= vk::ImageUsageFlags::TRANSFER_SRC;
        }
        info
    }

    /// Track a new swapchain; a replaced `old_swapchain` stops resolving
    pub fn add_swapchain(
        &self,
        key: usize,
        swapchain: vk::SwapchainKHR,
        info: &vk::SwapchainCreateInfoKHR,
        forwarder: &CaptureForwarder,
    ) {
        let window = self.surfaces.get(&info.surface).map_or(0, |entry| *entry);
        let mut had_frames = false;
        {
            let Some(mut device) = self.devices.get_mut(&key) else {
                return;
            };
            let device = &mut *device;

            if info.old_swapchain != vk::SwapchainKHR::null() {
                if let Some(mut old) = device.swapchains.remove(&info.old_swapchain) {
                    had_frames = Self::dispose(&*device.ops, &mut old, forwarder);
                }
            }

            tracing::debug!(
                "Swapchain {:#x}: {}x{} {:?} usage {:?}",
                swapchain.as_raw(),
                info.image_extent.width,
                info.image_extent.height,
                info.image_format,
                info.image_usage
            );
            device
                .swapchains
                .insert(swapchain, SwapchainRecord::new(swapchain, info, window));
        }
        if had_frames {
            forwarder.on_reset(Backend::Vulkan);
        }
    }

    /// Stop tracking a swapchain; the sink is reset if it had been handed
    /// one of its frames
    pub fn remove_swapchain(&self, key: usize, swapchain: vk::SwapchainKHR, forwarder: &CaptureForwarder) {
        let had_frames = {
            let Some(mut device) = self.devices.get_mut(&key) else {
                return;
            };
            let device = &mut *device;
            match device.swapchains.remove(&swapchain) {
                Some(mut record) => Self::dispose(&*device.ops, &mut record, forwarder),
                None => false,
            }
        };
        if had_frames {
            forwarder.on_reset(Backend::Vulkan);
        }
    }

    /// Read one swapchain record
    pub fn with_swapchain<R>(
        &self,
        key: usize,
        swapchain: vk::SwapchainKHR,
        f: impl FnOnce(&SwapchainRecord) -> R,
    ) -> Option<R> {
        let device = self.devices.get(&key)?;
        device.swapchains.get(&swapchain).map(f)
    }

    /// Invalidate a record and free what it holds
    ///
    /// Returns true if a frame had been forwarded from it.
    fn dispose(ops: &dyn DeviceOps, record: &mut SwapchainRecord, forwarder: &CaptureForwarder) -> bool {
        let (target, frame) = record.invalidate();
        if let Some(target) = target {
            unsafe { ops.destroy_export_target(target) };
        }
        match frame {
            Some(key) => {
                forwarder.release(key);
                true
            }
            None => false,
        }
    }

    /// Enumerate images and build the export target, once per swapchain
    ///
    /// A target that cannot be built leaves the swapchain resolved but not
    /// exportable until the next reset or recreation.
    unsafe fn resolve(ops: &dyn DeviceOps, record: &mut SwapchainRecord) -> CaptureResult<()> {
        record.images = ops.swapchain_images(record.handle)?;
        record.exportable = ops.export_supported(record.format, record.usage);
        if let Some(old) = record.target.take() {
            ops.destroy_export_target(old);
        }
        record.resolved = true;
        if record.exportable {
            match ops.create_export_target(record.format, record.extent, record.images.len()) {
                Ok(target) => record.target = Some(target),
                Err(skip) => {
                    record.exportable = false;
                    return Err(skip);
                }
            }
        }
        tracing::debug!(
            "Swapchain {:#x} resolved: {} images, exportable={}",
            record.handle.as_raw(),
            record.images.len(),
            record.exportable
        );
        Ok(())
    }

    unsafe fn capture_swapchain(
        device: &mut DeviceRecord,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        sync: &mut PresentSync,
        forwarder: &CaptureForwarder,
    ) -> CaptureResult<FrameKey> {
        let ops = &*device.ops;
        let record = device
            .swapchains
            .get_mut(&swapchain)
            .ok_or(CaptureSkip::UnknownSwapchain)?;

        if !record.resolved {
            Self::resolve(ops, record)?;
        }
        if !record.exportable {
            return Err(CaptureSkip::ExportUnavailable);
        }
        let image = *record
            .images
            .get(image_index as usize)
            .ok_or(CaptureSkip::Unsupported("image index out of range"))?;
        let source = CopySource {
            queue,
            image,
            index: image_index as usize,
            extent: record.extent,
            wait: &sync.waits,
            signal: sync.take_over,
        };
        let target = record.target.as_mut().ok_or(CaptureSkip::ExportUnavailable)?;

        if let Some(signaled) = ops.copy_to_target(&source, target)? {
            sync.waits.clear();
            sync.signals.push(signaled);
        }
        let exported = NativeHandle::Exported {
            handle: target.handle,
            size: target.size,
        };

        let key = match record.frame {
            Some(key) if forwarder.is_live(key) => key,
            _ => {
                let key = forwarder.register(Backend::Vulkan, record.desc(), exported);
                record.frame = Some(key);
                key
            }
        };
        forwarder.on_frame(Backend::Vulkan, key);
        Ok(key)
    }

    /// Copy every swapchain of a present into its export target
    ///
    /// # Returns
    /// The number of frames forwarded, or the first skip if there were none
    ///
    /// # Safety
    /// `queue` must be a live queue and `present` a valid present info
    pub unsafe fn try_capture(
        &self,
        queue: vk::Queue,
        present: &vk::PresentInfoKHR,
        sync: &mut PresentSync,
        forwarder: &CaptureForwarder,
    ) -> CaptureResult<usize> {
        if !self.enabled {
            return Err(CaptureSkip::Disabled);
        }
        if queue == vk::Queue::null() {
            return Err(CaptureSkip::NullArgument("queue"));
        }
        if present.swapchain_count == 0 || present.p_swapchains.is_null() || present.p_image_indices.is_null() {
            return Err(CaptureSkip::NullArgument("present info"));
        }

        let key = dispatch_key(queue);
        let mut device = self.devices.get_mut(&key).ok_or(CaptureSkip::UnknownDevice)?;
        let device = &mut *device;

        let graphics_family = device.graphics_family.ok_or(CaptureSkip::NoGraphicsQueue)?;
        if !device.caps.can_export() {
            return Err(CaptureSkip::ExportUnavailable);
        }
        let queue_family = device.queue(queue).map_or(graphics_family, |q| q.family_index);
        if queue_family != graphics_family {
            return Err(CaptureSkip::Unsupported("present queue is not on the graphics family"));
        }

        let swapchains = std::slice::from_raw_parts(present.p_swapchains, present.swapchain_count as usize);
        let indices = std::slice::from_raw_parts(present.p_image_indices, present.swapchain_count as usize);

        let mut captured = 0;
        let mut first_skip = None;
        for (swapchain, index) in swapchains.iter().zip(indices) {
            match Self::capture_swapchain(device, queue, *swapchain, *index, sync, forwarder) {
                Ok(_) => captured += 1,
                Err(skip) => {
                    first_skip.get_or_insert(skip);
                }
            }
        }

        match first_skip {
            Some(skip) if captured == 0 => Err(skip),
            _ => Ok(captured),
        }
    }

    /// Capture on behalf of the host. From then on the layer's own present
    /// path stands down.
    ///
    /// The host presents with its own semaphores, so the copy never takes
    /// them over.
    ///
    /// # Safety
    /// See [`Self::try_capture`]
    pub unsafe fn host_capture(
        &self,
        queue: vk::Queue,
        present: *const vk::PresentInfoKHR,
        forwarder: &CaptureForwarder,
    ) -> bool {
        self.host_driven.store(true, Ordering::Release);
        if present.is_null() {
            self.skips.record(Backend::Vulkan, &CaptureSkip::NullArgument("present info"));
            return false;
        }
        self.capture(queue, &*present, &mut PresentSync::default(), forwarder)
    }

    /// Capture from the layer's own present hook, unless the host drives it
    ///
    /// # Safety
    /// See [`Self::try_capture`]
    pub unsafe fn layer_capture(
        &self,
        queue: vk::Queue,
        present: &vk::PresentInfoKHR,
        sync: &mut PresentSync,
        forwarder: &CaptureForwarder,
    ) -> bool {
        if self.is_host_driven() {
            return false;
        }
        self.capture(queue, present, sync, forwarder)
    }

    unsafe fn capture(
        &self,
        queue: vk::Queue,
        present: &vk::PresentInfoKHR,
        sync: &mut PresentSync,
        forwarder: &CaptureForwarder,
    ) -> bool {
        match self.try_capture(queue, present, sync, forwarder) {
            Ok(_) => {
                self.skips.clear();
                true
            }
            Err(skip) => {
                self.skips.record(Backend::Vulkan, &skip);
                false
            }
        }
    }

    /// Drop every resolved swapchain of a device
    ///
    /// The sink drops every Vulkan key. Swapchains of other devices keep their
    /// targets and register a fresh key on their next present.
    ///
    /// # Returns
    /// false for an unknown device or one that cannot capture, which is left
    /// untouched
    pub fn reset_key(&self, key: usize, forwarder: &CaptureForwarder) -> bool {
        {
            let Some(mut device) = self.devices.get_mut(&key) else {
                return false;
            };
            if !device.can_capture() {
                return false;
            }
            let device = &mut *device;
            for record in device.swapchains.values_mut() {
                Self::dispose(&*device.ops, record, forwarder);
            }
        }
        forwarder.on_reset(Backend::Vulkan);
        true
    }

    /// Reset by device handle
    ///
    /// # Safety
    /// `device` must be null or a live dispatchable device handle
    pub unsafe fn reset(&self, device: vk::Device, forwarder: &CaptureForwarder) -> bool {
        if device == vk::Device::null() {
            return false;
        }
        self.reset_key(dispatch_key(device), forwarder)
    }

    /// React to the result of a forwarded present
    ///
    /// Device loss resets the device. An out-of-date swapchain, or one that
    /// just turned suboptimal, is invalidated and re-resolved on next use.
    ///
    /// # Safety
    /// `present` must be the info that was just presented on `queue`
    pub unsafe fn after_present(
        &self,
        queue: vk::Queue,
        present: &vk::PresentInfoKHR,
        result: vk::Result,
        forwarder: &CaptureForwarder,
    ) {
        if queue == vk::Queue::null() || present.p_swapchains.is_null() {
            return;
        }
        let key = dispatch_key(queue);
        if result == vk::Result::ERROR_DEVICE_LOST {
            tracing::warn!("Device {:#x} lost", key);
            self.reset_key(key, forwarder);
            return;
        }

        let count = present.swapchain_count as usize;
        let swapchains = std::slice::from_raw_parts(present.p_swapchains, count);
        let results = (!present.p_results.is_null())
            .then(|| std::slice::from_raw_parts(present.p_results as *const vk::Result, count));

        let mut invalidated = false;
        {
            let Some(mut device) = self.devices.get_mut(&key) else {
                return;
            };
            let device = &mut *device;
            for (i, swapchain) in swapchains.iter().enumerate() {
                let status = results.map_or(result, |results| results[i]);
                let Some(record) = device.swapchains.get_mut(swapchain) else {
                    continue;
                };

                let invalidate = match status {
                    vk::Result::ERROR_OUT_OF_DATE_KHR => true,
                    vk::Result::SUBOPTIMAL_KHR => !std::mem::replace(&mut record.suboptimal, true),
                    vk::Result::SUCCESS => {
                        record.suboptimal = false;
                        false
                    }
                    _ => false,
                };
                if invalidate && record.resolved {
                    tracing::debug!("Swapchain {:#x} {:?}, invalidated", swapchain.as_raw(), status);
                    Self::dispose(&*device.ops, record, forwarder);
                    invalidated = true;
                }
            }
        }
        if invalidated {
            forwarder.on_reset(Backend::Vulkan);
        }
    }
}
