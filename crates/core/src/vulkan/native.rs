//! [`DeviceOps`] over the next layer's entry points

use std::ffi::c_void;
use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;

use super::chain::{DeviceDispatch, ExportFns, InstanceDispatch};
use super::ops::{CopySource, DeviceOps, ExportTarget};
use crate::error::{CaptureResult, CaptureSkip};

/// How long teardown waits for an in-flight copy
const TEARDOWN_WAIT_NS: u64 = 100_000_000;

#[cfg(windows)]
#[link(name = "kernel32")]
extern "system" {
    fn CloseHandle(handle: *mut c_void) -> i32;
}

/// Handle type of the exported memory on this platform
pub fn export_handle_type() -> vk::ExternalMemoryHandleTypeFlags {
    if cfg!(windows) {
        vk::ExternalMemoryHandleTypeFlags::OPAQUE_WIN32
    } else {
        vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD
    }
}

/// Index of the first memory type allowed by `type_bits` with all `flags`
pub fn find_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    let count = (properties.memory_type_count as usize).min(properties.memory_types.len());
    properties.memory_types[..count]
        .iter()
        .enumerate()
        .find(|(index, memory_type)| {
            type_bits & (1 << index) != 0 && memory_type.property_flags.contains(flags)
        })
        .map(|(index, _)| index as u32)
}

fn color_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn color_layers() -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn barrier(
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_access_mask: vk::AccessFlags,
    dst_access_mask: vk::AccessFlags,
) -> vk::ImageMemoryBarrier {
    vk::ImageMemoryBarrier {
        src_access_mask,
        dst_access_mask,
        old_layout,
        new_layout,
        src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        image,
        subresource_range: color_range(),
        ..Default::default()
    }
}

/// Device work done through the next layer
pub struct NativeDeviceOps {
    device: vk::Device,
    physical_device: vk::PhysicalDevice,
    next: Arc<DeviceDispatch>,
    instance: Option<Arc<InstanceDispatch>>,
    graphics_family: Option<u32>,
    memory: Option<vk::PhysicalDeviceMemoryProperties>,
}

impl NativeDeviceOps {
    /// # Safety
    /// `physical_device` must be the one `next.device` was created from
    pub unsafe fn new(
        physical_device: vk::PhysicalDevice,
        next: Arc<DeviceDispatch>,
        instance: Option<Arc<InstanceDispatch>>,
        graphics_family: Option<u32>,
    ) -> Self {
        let memory = instance
            .as_ref()
            .and_then(|instance| instance.memory_properties(physical_device));
        Self {
            device: next.device,
            physical_device,
            next,
            instance,
            graphics_family,
            memory,
        }
    }

    fn export_fns(&self) -> CaptureResult<&ExportFns> {
        self.next.export.as_ref().ok_or(CaptureSkip::ExportUnavailable)
    }

    unsafe fn export_memory(&self, fns: &ExportFns, memory: vk::DeviceMemory) -> CaptureResult<u64> {
        #[cfg(windows)]
        {
            let info = vk::MemoryGetWin32HandleInfoKHR {
                memory,
                handle_type: export_handle_type(),
                ..Default::default()
            };
            let mut handle: vk::HANDLE = std::ptr::null_mut();
            (fns.get_memory_win32_handle)(self.device, &info, &mut handle).result()?;
            Ok(handle as u64)
        }
        #[cfg(not(windows))]
        {
            let info = vk::MemoryGetFdInfoKHR {
                memory,
                handle_type: export_handle_type(),
                ..Default::default()
            };
            let mut fd = -1;
            (fns.get_memory_fd)(self.device, &info, &mut fd).result()?;
            Ok(fd as u64)
        }
    }

    #[cfg(windows)]
    unsafe fn close_exported(handle: u64) {
        CloseHandle(handle as *mut c_void);
    }

    #[cfg(not(windows))]
    unsafe fn close_exported(handle: u64) {
        libc::close(handle as i32);
    }


    /// Swap the target's fence for a fresh, signaled one
    ///
    /// Only for a fence with nothing queued against it.
    unsafe fn renew_fence(&self, fns: &ExportFns, target: &mut ExportTarget) -> CaptureResult<()> {
        if target.fence != vk::Fence::null() {
            (fns.destroy_fence)(self.device, target.fence, std::ptr::null());
            target.fence = vk::Fence::null();
        }
        let fence_info = vk::FenceCreateInfo {
            flags: vk::FenceCreateFlags::SIGNALED,
            ..Default::default()
        };
        (fns.create_fence)(self.device, &fence_info, std::ptr::null(), &mut target.fence).result()?;
        Ok(())
    }

    /// Fill `target` step by step; on error it holds whatever was created
    unsafe fn build_target(
        &self,
        fns: &ExportFns,
        format: vk::Format,
        extent: vk::Extent2D,
        image_count: usize,
        target: &mut ExportTarget,
    ) -> CaptureResult<()> {
        let memory_properties = self.memory.as_ref().ok_or(CaptureSkip::ExportUnavailable)?;
        let family = self.graphics_family.ok_or(CaptureSkip::NoGraphicsQueue)?;

        let external = vk::ExternalMemoryImageCreateInfo {
            handle_types: export_handle_type(),
            ..Default::default()
        };
        let image_info = vk::ImageCreateInfo {
            p_next: &external as *const _ as *const c_void,
            image_type: vk::ImageType::TYPE_2D,
            format,
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        };
        (fns.create_image)(self.device, &image_info, std::ptr::null(), &mut target.image).result()?;

        let mut requirements = vk::MemoryRequirements::default();
        (fns.get_image_memory_requirements)(self.device, target.image, &mut requirements);
        let memory_type = find_memory_type(
            memory_properties,
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .ok_or(CaptureSkip::ExportUnavailable)?;

        let dedicated = vk::MemoryDedicatedAllocateInfo {
            image: target.image,
            ..Default::default()
        };
        let export = vk::ExportMemoryAllocateInfo {
            p_next: &dedicated as *const _ as *const c_void,
            handle_types: export_handle_type(),
            ..Default::default()
        };
        let allocate_info = vk::MemoryAllocateInfo {
            p_next: &export as *const _ as *const c_void,
            allocation_size: requirements.size,
            memory_type_index: memory_type,
            ..Default::default()
        };
        (fns.allocate_memory)(self.device, &allocate_info, std::ptr::null(), &mut target.memory).result()?;
        (fns.bind_image_memory)(self.device, target.image, target.memory, 0).result()?;
        target.size = requirements.size;
        target.handle = self.export_memory(fns, target.memory)?;

        let pool_info = vk::CommandPoolCreateInfo {
            flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            queue_family_index: family,
            ..Default::default()
        };
        (fns.create_command_pool)(self.device, &pool_info, std::ptr::null(), &mut target.command_pool)
            .result()?;

        let buffer_info = vk::CommandBufferAllocateInfo {
            command_pool: target.command_pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };
        (fns.allocate_command_buffers)(self.device, &buffer_info, &mut target.command_buffer).result()?;
        // Layer-allocated command buffers need the loader's dispatch pointer
        if let Some(set_loader_data) = self.next.set_loader_data {
            set_loader_data(self.device, target.command_buffer.as_raw() as usize as *mut c_void).result()?;
        }

        self.renew_fence(fns, target)?;

        let semaphore_info = vk::SemaphoreCreateInfo::default();
        for _ in 0..image_count {
            let mut semaphore = vk::Semaphore::null();
            (fns.create_semaphore)(self.device, &semaphore_info, std::ptr::null(), &mut semaphore).result()?;
            target.semaphores.push(semaphore);
        }
        Ok(())
    }

    /// Record the copy into the target's command buffer
    unsafe fn record_copy(&self, fns: &ExportFns, source: &CopySource<'_>, target: &ExportTarget) -> CaptureResult<()> {
        let cmd = target.command_buffer;
        (fns.reset_command_buffer)(cmd, vk::CommandBufferResetFlags::empty()).result()?;
        let begin = vk::CommandBufferBeginInfo {
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        (fns.begin_command_buffer)(cmd, &begin).result()?;

        let to_transfer = [
            barrier(
                source.image,
                vk::ImageLayout::PRESENT_SRC_KHR,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::AccessFlags::MEMORY_READ,
                vk::AccessFlags::TRANSFER_READ,
            ),
            barrier(
                target.image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::AccessFlags::empty(),
                vk::AccessFlags::TRANSFER_WRITE,
            ),
        ];
        (fns.cmd_pipeline_barrier)(
            cmd,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            0,
            std::ptr::null(),
            0,
            std::ptr::null(),
            to_transfer.len() as u32,
            to_transfer.as_ptr(),
        );

        let region = vk::ImageCopy {
            src_subresource: color_layers(),
            src_offset: vk::Offset3D::default(),
            dst_subresource: color_layers(),
            dst_offset: vk::Offset3D::default(),
            extent: vk::Extent3D {
                width: source.extent.width,
                height: source.extent.height,
                depth: 1,
            },
        };
        (fns.cmd_copy_image)(
            cmd,
            source.image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            target.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            1,
            &region,
        );

        let to_present = [
            barrier(
                source.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
                vk::AccessFlags::TRANSFER_READ,
                vk::AccessFlags::MEMORY_READ,
            ),
            barrier(
                target.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::GENERAL,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::MEMORY_READ,
            ),
        ];
        (fns.cmd_pipeline_barrier)(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::DependencyFlags::empty(),
            0,
            std::ptr::null(),
            0,
            std::ptr::null(),
            to_present.len() as u32,
            to_present.as_ptr(),
        );
        (fns.end_command_buffer)(cmd).result()?;
        Ok(())
    }
}

impl DeviceOps for NativeDeviceOps {
    unsafe fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> CaptureResult<Vec<vk::Image>> {
        let fns = self.next.swapchain.ok_or(CaptureSkip::UnknownSwapchain)?;

        let mut count = 0u32;
        (fns.get_images)(self.device, swapchain, &mut count, std::ptr::null_mut()).result()?;
        let mut images = vec![vk::Image::null(); count as usize];
        (fns.get_images)(self.device, swapchain, &mut count, images.as_mut_ptr()).result()?;
        images.truncate(count as usize);
        Ok(images)
    }

    unsafe fn export_supported(&self, format: vk::Format, usage: vk::ImageUsageFlags) -> bool {
        if !usage.contains(vk::ImageUsageFlags::TRANSFER_SRC) || self.next.export.is_none() {
            return false;
        }
        let Some(query) = self
            .instance
            .as_ref()
            .and_then(|instance| instance.get_physical_device_image_format_properties2)
        else {
            return false;
        };

        let external_info = vk::PhysicalDeviceExternalImageFormatInfo {
            handle_type: export_handle_type(),
            ..Default::default()
        };
        let format_info = vk::PhysicalDeviceImageFormatInfo2 {
            p_next: &external_info as *const _ as *const c_void,
            format,
            ty: vk::ImageType::TYPE_2D,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            ..Default::default()
        };
        let mut external_properties = vk::ExternalImageFormatProperties::default();
        let mut properties = vk::ImageFormatProperties2 {
            p_next: &mut external_properties as *mut _ as *mut c_void,
            ..Default::default()
        };

        if query(self.physical_device, &format_info, &mut properties) != vk::Result::SUCCESS {
            return false;
        }
        external_properties
            .external_memory_properties
            .external_memory_features
            .contains(vk::ExternalMemoryFeatureFlags::EXPORTABLE)
    }

    #[tracing::instrument(skip_all)]
    unsafe fn create_export_target(
        &self,
        format: vk::Format,
        extent: vk::Extent2D,
        image_count: usize,
    ) -> CaptureResult<ExportTarget> {
        let fns = self.export_fns()?;
        let mut target = ExportTarget::default();

        match self.build_target(fns, format, extent, image_count, &mut target) {
            Ok(()) => {
                tracing::debug!(
                    "Export target {}x{} {:?}, {} bytes",
                    extent.width,
                    extent.height,
                    format,
                    target.size
                );
                Ok(target)
            }
            Err(skip) => {
                tracing::warn!("Failed to create export target: {}", skip);
                self.destroy_export_target(target);
                Err(skip)
            }
        }
    }

    unsafe fn destroy_export_target(&self, target: ExportTarget) {
        let Ok(fns) = self.export_fns() else {
            return;
        };

        if target.fence != vk::Fence::null() {
            let _ = (fns.wait_for_fences)(self.device, 1, &target.fence, vk::TRUE, TEARDOWN_WAIT_NS);
            (fns.destroy_fence)(self.device, target.fence, std::ptr::null());
        }
        for semaphore in &target.semaphores {
            if *semaphore != vk::Semaphore::null() {
                (fns.destroy_semaphore)(self.device, *semaphore, std::ptr::null());
            }
        }
        if target.command_pool != vk::CommandPool::null() {
            // Frees the command buffer with it
            (fns.destroy_command_pool)(self.device, target.command_pool, std::ptr::null());
        }
        if target.handle != 0 {
            Self::close_exported(target.handle);
        }
        if target.image != vk::Image::null() {
            (fns.destroy_image)(self.device, target.image, std::ptr::null());
        }
        if target.memory != vk::DeviceMemory::null() {
            (fns.free_memory)(self.device, target.memory, std::ptr::null());
        }
    }

    unsafe fn copy_to_target(
        &self,
        source: &CopySource<'_>,
        target: &mut ExportTarget,
    ) -> CaptureResult<Option<vk::Semaphore>> {
        let fns = self.export_fns()?;

        if target.fence == vk::Fence::null() {
            self.renew_fence(fns, target)?;
        }
        match (fns.get_fence_status)(self.device, target.fence) {
            vk::Result::SUCCESS => {}
            vk::Result::NOT_READY => return Err(CaptureSkip::Busy),
            error => return Err(error.into()),
        }

        self.record_copy(fns, source, target)?;

        // Waiting consumes the present's semaphores, so only wait when the
        // present gets one of ours back
        let signal = source
            .signal
            .then(|| target.semaphores.get(source.index).copied())
            .flatten();
        let wait: &[vk::Semaphore] = if signal.is_some() { source.wait } else { &[] };
        let wait_stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; wait.len()];
        let signals: Vec<vk::Semaphore> = signal.into_iter().collect();

        let submit = vk::SubmitInfo {
            wait_semaphore_count: wait.len() as u32,
            p_wait_semaphores: wait.as_ptr(),
            p_wait_dst_stage_mask: wait_stages.as_ptr(),
            command_buffer_count: 1,
            p_command_buffers: &target.command_buffer,
            signal_semaphore_count: signals.len() as u32,
            p_signal_semaphores: signals.as_ptr(),
            ..Default::default()
        };

        (fns.reset_fences)(self.device, 1, &target.fence).result()?;
        if let Err(error) = (fns.queue_submit)(source.queue, 1, &submit, target.fence).result() {
            // Nothing was queued: the fence would never signal again
            if let Err(skip) = self.renew_fence(fns, target) {
                tracing::warn!("Failed to renew copy fence: {}", skip);
            }
            return Err(error.into());
        }
        Ok(signal)
    }
}
