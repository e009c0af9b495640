//! Loader chain plumbing
//!
//! The loader passes each layer its link to the next layer through the
//! `pNext` chain of the create info. A layer must take its link and advance
//! it before calling down, so the next layer sees its own.

use std::ffi::{c_char, c_void, CStr};

use ash::vk;
use ash::vk::Handle;

const LOADER_INSTANCE_CREATE_INFO: vk::StructureType = vk::StructureType::from_raw(47);
const LOADER_DEVICE_CREATE_INFO: vk::StructureType = vk::StructureType::from_raw(48);

/// VkLayerFunction
const LAYER_LINK_INFO: u32 = 0;
const LOADER_DATA_CALLBACK: u32 = 1;

/// vkSetDeviceLoaderData, for dispatchable objects a layer creates itself
pub type PfnSetDeviceLoaderData =
    unsafe extern "system" fn(device: vk::Device, object: *mut c_void) -> vk::Result;

type PfnSetInstanceLoaderData =
    unsafe extern "system" fn(instance: vk::Instance, object: *mut c_void) -> vk::Result;

#[repr(C)]
struct LayerInstanceLink {
    p_next: *mut LayerInstanceLink,
    next_get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    next_get_physical_device_proc_addr: vk::PFN_vkVoidFunction,
}

#[repr(C)]
union LayerInstanceInfo {
    layer_info: *mut LayerInstanceLink,
    set_instance_loader_data: Option<PfnSetInstanceLoaderData>,
}

#[repr(C)]
struct LayerInstanceCreateInfo {
    s_type: vk::StructureType,
    p_next: *const c_void,
    function: u32,
    u: LayerInstanceInfo,
}

#[repr(C)]
struct LayerDeviceLink {
    p_next: *mut LayerDeviceLink,
    next_get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    next_get_device_proc_addr: vk::PFN_vkGetDeviceProcAddr,
}

#[repr(C)]
union LayerDeviceInfo {
    layer_info: *mut LayerDeviceLink,
    set_device_loader_data: Option<PfnSetDeviceLoaderData>,
}

#[repr(C)]
struct LayerDeviceCreateInfo {
    s_type: vk::StructureType,
    p_next: *const c_void,
    function: u32,
    u: LayerDeviceInfo,
}

/// What a layer needs from the device chain
#[derive(Clone, Copy)]
pub struct DeviceLink {
    pub next_gipa: vk::PFN_vkGetInstanceProcAddr,
    pub next_gdpa: vk::PFN_vkGetDeviceProcAddr,
    pub set_loader_data: Option<PfnSetDeviceLoaderData>,
}

/// Take this layer's instance link and advance the chain
///
/// # Safety
/// `create_info` must be the create info the loader passed to vkCreateInstance
pub unsafe fn take_instance_link(create_info: *const vk::InstanceCreateInfo) -> Option<vk::PFN_vkGetInstanceProcAddr> {
    let mut p = (*create_info).p_next as *mut c_void;
    while !p.is_null() {
        let base = &*(p as *const vk::BaseOutStructure);
        if base.s_type == LOADER_INSTANCE_CREATE_INFO {
            let info = &mut *(p as *mut LayerInstanceCreateInfo);
            if info.function == LAYER_LINK_INFO && !info.u.layer_info.is_null() {
                let link = info.u.layer_info;
                info.u.layer_info = (*link).p_next;
                return Some((*link).next_get_instance_proc_addr);
            }
        }
        p = base.p_next.cast();
    }
    None
}

/// Take this layer's device link and advance the chain
///
/// # Safety
/// `create_info` must be the create info the loader passed to vkCreateDevice
pub unsafe fn take_device_link(create_info: *const vk::DeviceCreateInfo) -> Option<DeviceLink> {
    let mut link = None;
    let mut set_loader_data = None;

    let mut p = (*create_info).p_next as *mut c_void;
    while !p.is_null() {
        let base = &*(p as *const vk::BaseOutStructure);
        if base.s_type == LOADER_DEVICE_CREATE_INFO {
            let info = &mut *(p as *mut LayerDeviceCreateInfo);
            match info.function {
                LAYER_LINK_INFO if link.is_none() && !info.u.layer_info.is_null() => {
                    let current = info.u.layer_info;
                    info.u.layer_info = (*current).p_next;
                    link = Some(current);
                }
                LOADER_DATA_CALLBACK => set_loader_data = info.u.set_device_loader_data,
                _ => {}
            }
        }
        p = base.p_next.cast();
    }

    link.map(|current| DeviceLink {
        next_gipa: (*current).next_get_instance_proc_addr,
        next_gdpa: (*current).next_get_device_proc_addr,
        set_loader_data,
    })
}

/// Loader dispatch key: the first word of a dispatchable handle
///
/// Queues and command buffers share their device's key, physical devices
/// their instance's.
///
/// # Safety
/// `handle` must be a live dispatchable handle
#[inline]
pub unsafe fn dispatch_key<H: Handle>(handle: H) -> usize {
    *(handle.as_raw() as usize as *const usize)
}

/// Resolve an entry point through a get-proc-addr function
///
/// # Safety
/// `F` must be the exact PFN type of `name`
pub unsafe fn load_proc<H, F: Copy>(
    get_proc_addr: unsafe extern "system" fn(H, *const c_char) -> vk::PFN_vkVoidFunction,
    handle: H,
    name: &CStr,
) -> Option<F> {
    let f = get_proc_addr(handle, name.as_ptr())?;
    Some(std::mem::transmute_copy::<unsafe extern "system" fn(), F>(&f))
}

/// Instance-level entry points of the next layer
pub struct InstanceDispatch {
    pub instance: vk::Instance,
    pub next_gipa: vk::PFN_vkGetInstanceProcAddr,
    pub destroy_instance: Option<vk::PFN_vkDestroyInstance>,
    pub get_physical_device_queue_family_properties: Option<vk::PFN_vkGetPhysicalDeviceQueueFamilyProperties>,
    pub get_physical_device_memory_properties: Option<vk::PFN_vkGetPhysicalDeviceMemoryProperties>,
    pub get_physical_device_image_format_properties2: Option<vk::PFN_vkGetPhysicalDeviceImageFormatProperties2>,
    pub create_win32_surface_khr: Option<vk::PFN_vkCreateWin32SurfaceKHR>,
    pub destroy_surface_khr: Option<vk::PFN_vkDestroySurfaceKHR>,
}

impl InstanceDispatch {
    /// # Safety
    /// `next_gipa` must be the next layer's vkGetInstanceProcAddr for `instance`
    pub unsafe fn load(instance: vk::Instance, next_gipa: vk::PFN_vkGetInstanceProcAddr) -> Self {
        Self {
            instance,
            next_gipa,
            destroy_instance: load_proc(next_gipa, instance, c"vkDestroyInstance"),
            get_physical_device_queue_family_properties: load_proc(
                next_gipa,
                instance,
                c"vkGetPhysicalDeviceQueueFamilyProperties",
            ),
            get_physical_device_memory_properties: load_proc(
                next_gipa,
                instance,
                c"vkGetPhysicalDeviceMemoryProperties",
            ),
            get_physical_device_image_format_properties2: load_proc(
                next_gipa,
                instance,
                c"vkGetPhysicalDeviceImageFormatProperties2",
            )
            .or_else(|| {
                load_proc(next_gipa, instance, c"vkGetPhysicalDeviceImageFormatProperties2KHR")
            }),
            create_win32_surface_khr: load_proc(next_gipa, instance, c"vkCreateWin32SurfaceKHR"),
            destroy_surface_khr: load_proc(next_gipa, instance, c"vkDestroySurfaceKHR"),
        }
    }

    /// Queue families of a physical device, in index order
    ///
    /// # Safety
    /// `physical_device` must belong to this instance
    pub unsafe fn queue_families(&self, physical_device: vk::PhysicalDevice) -> Vec<vk::QueueFamilyProperties> {
        let Some(get) = self.get_physical_device_queue_family_properties else {
            return Vec::new();
        };

        let mut count = 0u32;
        get(physical_device, &mut count, std::ptr::null_mut());
        let mut families = vec![vk::QueueFamilyProperties::default(); count as usize];
        get(physical_device, &mut count, families.as_mut_ptr());
        families.truncate(count as usize);
        families
    }

    /// # Safety
    /// `physical_device` must belong to this instance
    pub unsafe fn memory_properties(&self, physical_device: vk::PhysicalDevice) -> Option<vk::PhysicalDeviceMemoryProperties> {
        let get = self.get_physical_device_memory_properties?;
        let mut properties = vk::PhysicalDeviceMemoryProperties::default();
        get(physical_device, &mut properties);
        Some(properties)
    }
}

/// Swapchain entry points, present only when the app enabled VK_KHR_swapchain
#[derive(Clone, Copy)]
pub struct SwapchainFns {
    pub create: vk::PFN_vkCreateSwapchainKHR,
    pub destroy: vk::PFN_vkDestroySwapchainKHR,
    pub get_images: vk::PFN_vkGetSwapchainImagesKHR,
    pub queue_present: vk::PFN_vkQueuePresentKHR,
}

impl SwapchainFns {
    unsafe fn load(gdpa: vk::PFN_vkGetDeviceProcAddr, device: vk::Device) -> Option<Self> {
        Some(Self {
            create: load_proc(gdpa, device, c"vkCreateSwapchainKHR")?,
            destroy: load_proc(gdpa, device, c"vkDestroySwapchainKHR")?,
            get_images: load_proc(gdpa, device, c"vkGetSwapchainImagesKHR")?,
            queue_present: load_proc(gdpa, device, c"vkQueuePresentKHR")?,
        })
    }
}

/// Entry points used to build and fill the export target
#[derive(Clone, Copy)]
pub struct ExportFns {
    pub create_image: vk::PFN_vkCreateImage,
    pub destroy_image: vk::PFN_vkDestroyImage,
    pub get_image_memory_requirements: vk::PFN_vkGetImageMemoryRequirements,
    pub allocate_memory: vk::PFN_vkAllocateMemory,
    pub free_memory: vk::PFN_vkFreeMemory,
    pub bind_image_memory: vk::PFN_vkBindImageMemory,
    pub create_command_pool: vk::PFN_vkCreateCommandPool,
    pub destroy_command_pool: vk::PFN_vkDestroyCommandPool,
    pub allocate_command_buffers: vk::PFN_vkAllocateCommandBuffers,
    pub reset_command_buffer: vk::PFN_vkResetCommandBuffer,
    pub begin_command_buffer: vk::PFN_vkBeginCommandBuffer,
    pub end_command_buffer: vk::PFN_vkEndCommandBuffer,
    pub cmd_pipeline_barrier: vk::PFN_vkCmdPipelineBarrier,
    pub cmd_copy_image: vk::PFN_vkCmdCopyImage,
    pub queue_submit: vk::PFN_vkQueueSubmit,
    pub create_fence: vk::PFN_vkCreateFence,
    pub destroy_fence: vk::PFN_vkDestroyFence,
    pub get_fence_status: vk::PFN_vkGetFenceStatus,
    pub reset_fences: vk::PFN_vkResetFences,
    pub wait_for_fences: vk::PFN_vkWaitForFences,
    pub create_semaphore: vk::PFN_vkCreateSemaphore,
    pub destroy_semaphore: vk::PFN_vkDestroySemaphore,
    #[cfg(windows)]
    pub get_memory_win32_handle: vk::PFN_vkGetMemoryWin32HandleKHR,
    #[cfg(not(windows))]
    pub get_memory_fd: vk::PFN_vkGetMemoryFdKHR,
}

impl ExportFns {
    unsafe fn load(gdpa: vk::PFN_vkGetDeviceProcAddr, device: vk::Device) -> Option<Self> {
        Some(Self {
            create_image: load_proc(gdpa, device, c"vkCreateImage")?,
            destroy_image: load_proc(gdpa, device, c"vkDestroyImage")?,
            get_image_memory_requirements: load_proc(gdpa, device, c"vkGetImageMemoryRequirements")?,
            allocate_memory: load_proc(gdpa, device, c"vkAllocateMemory")?,
            free_memory: load_proc(gdpa, device, c"vkFreeMemory")?,
            bind_image_memory: load_proc(gdpa, device, c"vkBindImageMemory")?,
            create_command_pool: load_proc(gdpa, device, c"vkCreateCommandPool")?,
            destroy_command_pool: load_proc(gdpa, device, c"vkDestroyCommandPool")?,
            allocate_command_buffers: load_proc(gdpa, device, c"vkAllocateCommandBuffers")?,
            reset_command_buffer: load_proc(gdpa, device, c"vkResetCommandBuffer")?,
            begin_command_buffer: load_proc(gdpa, device, c"vkBeginCommandBuffer")?,
            end_command_buffer: load_proc(gdpa, device, c"vkEndCommandBuffer")?,
            cmd_pipeline_barrier: load_proc(gdpa, device, c"vkCmdPipelineBarrier")?,
            cmd_copy_image: load_proc(gdpa, device, c"vkCmdCopyImage")?,
            queue_submit: load_proc(gdpa, device, c"vkQueueSubmit")?,
            create_fence: load_proc(gdpa, device, c"vkCreateFence")?,
            destroy_fence: load_proc(gdpa, device, c"vkDestroyFence")?,
            get_fence_status: load_proc(gdpa, device, c"vkGetFenceStatus")?,
            reset_fences: load_proc(gdpa, device, c"vkResetFences")?,
            wait_for_fences: load_proc(gdpa, device, c"vkWaitForFences")?,
            create_semaphore: load_proc(gdpa, device, c"vkCreateSemaphore")?,
            destroy_semaphore: load_proc(gdpa, device, c"vkDestroySemaphore")?,
            #[cfg(windows)]
            get_memory_win32_handle: load_proc(gdpa, device, c"vkGetMemoryWin32HandleKHR")?,
            #[cfg(not(windows))]
            get_memory_fd: load_proc(gdpa, device, c"vkGetMemoryFdKHR")?,
        })
    }
}

/// Device-level entry points of the next layer
pub struct DeviceDispatch {
    pub device: vk::Device,
    pub next_gdpa: vk::PFN_vkGetDeviceProcAddr,
    pub set_loader_data: Option<PfnSetDeviceLoaderData>,
    pub destroy_device: Option<vk::PFN_vkDestroyDevice>,
    pub get_device_queue: Option<vk::PFN_vkGetDeviceQueue>,
    pub get_device_queue2: Option<vk::PFN_vkGetDeviceQueue2>,
    pub swapchain: Option<SwapchainFns>,
    pub export: Option<ExportFns>,
}

impl DeviceDispatch {
    /// # Safety
    /// `link` must be the link taken from this device's create info
    pub unsafe fn load(device: vk::Device, link: &DeviceLink) -> Self {
        let gdpa = link.next_gdpa;
        Self {
            device,
            next_gdpa: gdpa,
            set_loader_data: link.set_loader_data,
            destroy_device: load_proc(gdpa, device, c"vkDestroyDevice"),
            get_device_queue: load_proc(gdpa, device, c"vkGetDeviceQueue"),
            get_device_queue2: load_proc(gdpa, device, c"vkGetDeviceQueue2"),
            swapchain: SwapchainFns::load(gdpa, device),
            export: ExportFns::load(gdpa, device),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "system" fn next_gipa(_: vk::Instance, _: *const c_char) -> vk::PFN_vkVoidFunction {
        None
    }

    unsafe extern "system" fn next_gdpa(_: vk::Device, _: *const c_char) -> vk::PFN_vkVoidFunction {
        None
    }

    #[test]
    fn test_instance_link_is_taken_and_advanced() {
        let mut second = LayerInstanceLink {
            p_next: std::ptr::null_mut(),
            next_get_instance_proc_addr: next_gipa,
            next_get_physical_device_proc_addr: None,
        };
        let mut first = LayerInstanceLink {
            p_next: &mut second,
            next_get_instance_proc_addr: next_gipa,
            next_get_physical_device_proc_addr: None,
        };
        let mut layer_info = LayerInstanceCreateInfo {
            s_type: LOADER_INSTANCE_CREATE_INFO,
            p_next: std::ptr::null(),
            function: LAYER_LINK_INFO,
            u: LayerInstanceInfo {
                layer_info: &mut first,
            },
        };
        let create_info = vk::InstanceCreateInfo {
            p_next: &mut layer_info as *mut _ as *const c_void,
            ..Default::default()
        };

        let taken = unsafe { take_instance_link(&create_info) };
        assert!(taken.is_some());
        assert_eq!(unsafe { layer_info.u.layer_info }, &mut second as *mut _);
    }

    #[test]
    fn test_device_link_with_loader_data_callback() {
        unsafe extern "system" fn set_data(_: vk::Device, _: *mut c_void) -> vk::Result {
            vk::Result::SUCCESS
        }

        let mut link = LayerDeviceLink {
            p_next: std::ptr::null_mut(),
            next_get_instance_proc_addr: next_gipa,
            next_get_device_proc_addr: next_gdpa,
        };
        let callback = LayerDeviceCreateInfo {
            s_type: LOADER_DEVICE_CREATE_INFO,
            p_next: std::ptr::null(),
            function: LOADER_DATA_CALLBACK,
            u: LayerDeviceInfo {
                set_device_loader_data: Some(set_data),
            },
        };
        let mut layer_info = LayerDeviceCreateInfo {
            s_type: LOADER_DEVICE_CREATE_INFO,
            p_next: &callback as *const _ as *const c_void,
            function: LAYER_LINK_INFO,
            u: LayerDeviceInfo { layer_info: &mut link },
        };
        let create_info = vk::DeviceCreateInfo {
            p_next: &mut layer_info as *mut _ as *const c_void,
            ..Default::default()
        };

        let taken = unsafe { take_device_link(&create_info) }.unwrap();
        assert!(taken.set_loader_data.is_some());
        assert!(unsafe { layer_info.u.layer_info }.is_null());
    }

    #[test]
    fn test_missing_link() {
        let create_info = vk::InstanceCreateInfo::default();
        assert!(unsafe { take_instance_link(&create_info) }.is_none());
    }

    #[test]
    fn test_dispatch_key_reads_first_word() {
        let table = Box::new(0xfeed_usize);
        let device = vk::Device::from_raw(&*table as *const usize as u64);
        assert_eq!(unsafe { dispatch_key(device) }, 0xfeed);
    }
}
