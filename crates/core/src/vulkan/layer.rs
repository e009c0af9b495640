//! Implicit layer entry points
//!
//! The loader negotiates through [`negotiate`] and from then on resolves
//! every intercepted command through [`get_instance_proc_addr`] and
//! [`get_device_proc_addr`]. Commands not intercepted resolve straight to the
//! next layer.

use std::ffi::{c_char, c_void, CStr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;

use super::chain::{self, dispatch_key, DeviceDispatch, InstanceDispatch};
use super::native::NativeDeviceOps;
use super::records::{select_graphics_family, ExternalMemoryCaps};
use super::tracker::{NewDevice, PresentSync};
use crate::runtime::{runtime, HookRuntime};

/// VkNegotiateLayerStructType::LAYER_NEGOTIATE_INTERFACE_STRUCT
const LAYER_NEGOTIATE_INTERFACE_STRUCT: u32 = 1;
/// Loader-layer interface version this layer speaks
pub const LAYER_INTERFACE_VERSION: u32 = 2;

/// VkNegotiateLayerInterface
#[repr(C)]
pub struct NegotiateLayerInterface {
    pub s_type: u32,
    pub p_next: *mut c_void,
    pub loader_layer_interface_version: u32,
    pub pfn_get_instance_proc_addr: Option<vk::PFN_vkGetInstanceProcAddr>,
    pub pfn_get_device_proc_addr: Option<vk::PFN_vkGetDeviceProcAddr>,
    pub pfn_get_physical_device_proc_addr: vk::PFN_vkVoidFunction,
}

/// Run an entry point body, turning a panic into `fallback`
fn guarded<T>(name: &str, fallback: T, body: impl FnOnce() -> T) -> T {
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(value) => value,
        Err(_) => {
            tracing::error!("Panic in {}", name);
            fallback
        }
    }
}

/// Forward a present with the layer's work guarded on either side of it
///
/// A panic in `capture` or `after` is logged and swallowed; the present
/// itself always runs and its result is returned.
fn present_with_capture<S>(
    sync: &mut S,
    capture: impl FnOnce(&mut S),
    present: impl FnOnce(&S) -> vk::Result,
    after: impl FnOnce(vk::Result),
) -> vk::Result {
    guarded("vkQueuePresentKHR capture", (), || capture(sync));
    let result = present(sync);
    guarded("vkQueuePresentKHR after present", (), || after(result));
    result
}

/// Answer the loader's interface negotiation
///
/// # Safety
/// `interface` must be null or point to the loader's negotiation struct
pub unsafe fn negotiate(interface: *mut NegotiateLayerInterface) -> vk::Result {
    if interface.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    let interface = &mut *interface;
    if interface.s_type != LAYER_NEGOTIATE_INTERFACE_STRUCT || interface.loader_layer_interface_version < 2 {
        tracing::warn!(
            "Loader offered layer interface version {}, need 2",
            interface.loader_layer_interface_version
        );
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }

    interface.loader_layer_interface_version = LAYER_INTERFACE_VERSION;
    interface.pfn_get_instance_proc_addr = Some(get_instance_proc_addr);
    interface.pfn_get_device_proc_addr = Some(get_device_proc_addr);
    interface.pfn_get_physical_device_proc_addr = None;
    tracing::info!("Vulkan layer negotiated interface version {}", LAYER_INTERFACE_VERSION);
    vk::Result::SUCCESS
}

fn void_fn(f: *const ()) -> vk::PFN_vkVoidFunction {
    // SAFETY: every entry in the intercept tables is an extern "system" fn
    Some(unsafe { std::mem::transmute::<*const (), unsafe extern "system" fn()>(f) })
}

/// Device-level commands this layer intercepts
fn device_intercept(name: &[u8]) -> Option<*const ()> {
    let f = match name {
        b"vkGetDeviceProcAddr" => get_device_proc_addr as *const (),
        b"vkDestroyDevice" => destroy_device as *const (),
        b"vkGetDeviceQueue" => get_device_queue as *const (),
        b"vkGetDeviceQueue2" => get_device_queue2 as *const (),
        b"vkCreateSwapchainKHR" => create_swapchain as *const (),
        b"vkDestroySwapchainKHR" => destroy_swapchain as *const (),
        b"vkQueuePresentKHR" => queue_present as *const (),
        _ => return None,
    };
    Some(f)
}

/// Instance-level commands this layer intercepts
fn instance_intercept(name: &[u8]) -> Option<*const ()> {
    let f = match name {
        b"vkGetInstanceProcAddr" => get_instance_proc_addr as *const (),
        b"vkCreateInstance" => create_instance as *const (),
        b"vkDestroyInstance" => destroy_instance as *const (),
        b"vkCreateDevice" => create_device as *const (),
        b"vkCreateWin32SurfaceKHR" => create_win32_surface as *const (),
        b"vkDestroySurfaceKHR" => destroy_surface as *const (),
        _ => return device_intercept(name),
    };
    Some(f)
}

pub unsafe extern "system" fn get_instance_proc_addr(
    instance: vk::Instance,
    name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    if name.is_null() {
        return None;
    }
    let bytes = CStr::from_ptr(name).to_bytes();
    if let Some(f) = instance_intercept(bytes) {
        return void_fn(f);
    }
    if instance == vk::Instance::null() {
        return None;
    }

    let dispatch = runtime().vulkan().instance(dispatch_key(instance))?;
    (dispatch.next_gipa)(instance, name)
}

pub unsafe extern "system" fn get_device_proc_addr(device: vk::Device, name: *const c_char) -> vk::PFN_vkVoidFunction {
    if name.is_null() || device == vk::Device::null() {
        return None;
    }
    let next = runtime().vulkan().device_dispatch(dispatch_key(device))?;
    let bytes = CStr::from_ptr(name).to_bytes();

    if let Some(f) = device_intercept(bytes) {
        // Only claim swapchain commands the driver below actually has
        let is_swapchain = bytes.starts_with(b"vkCreateSwapchain")
            || bytes.starts_with(b"vkDestroySwapchain")
            || bytes == b"vkQueuePresentKHR";
        if !is_swapchain || next.swapchain.is_some() {
            return void_fn(f);
        }
    }
    (next.next_gdpa)(device, name)
}

unsafe extern "system" fn create_instance(
    create_info: *const vk::InstanceCreateInfo,
    allocator: *const vk::AllocationCallbacks,
    p_instance: *mut vk::Instance,
) -> vk::Result {
    guarded("vkCreateInstance", vk::Result::ERROR_INITIALIZATION_FAILED, || {
        let Some(next_gipa) = chain::take_instance_link(create_info) else {
            tracing::error!("vkCreateInstance: no layer link in the create info");
            return vk::Result::ERROR_INITIALIZATION_FAILED;
        };
        let Some(create) =
            chain::load_proc::<_, vk::PFN_vkCreateInstance>(next_gipa, vk::Instance::null(), c"vkCreateInstance")
        else {
            return vk::Result::ERROR_INITIALIZATION_FAILED;
        };

        let result = create(create_info, allocator, p_instance);
        if result != vk::Result::SUCCESS {
            return result;
        }

        let instance = *p_instance;
        let dispatch = Arc::new(InstanceDispatch::load(instance, next_gipa));
        runtime().vulkan().add_instance(dispatch_key(instance), dispatch);
        tracing::debug!("Instance created");
        result
    })
}

unsafe extern "system" fn destroy_instance(instance: vk::Instance, allocator: *const vk::AllocationCallbacks) {
    guarded("vkDestroyInstance", (), || {
        if instance == vk::Instance::null() {
            return;
        }
        let Some(dispatch) = runtime().vulkan().remove_instance(dispatch_key(instance)) else {
            return;
        };
        if let Some(destroy) = dispatch.destroy_instance {
            destroy(instance, allocator);
        }
    })
}

unsafe extern "system" fn create_win32_surface(
    instance: vk::Instance,
    create_info: *const vk::Win32SurfaceCreateInfoKHR,
    allocator: *const vk::AllocationCallbacks,
    p_surface: *mut vk::SurfaceKHR,
) -> vk::Result {
    guarded("vkCreateWin32SurfaceKHR", vk::Result::ERROR_INITIALIZATION_FAILED, || {
        let tracker = runtime().vulkan();
        let Some(create) = tracker
            .instance(dispatch_key(instance))
            .and_then(|dispatch| dispatch.create_win32_surface_khr)
        else {
            return vk::Result::ERROR_EXTENSION_NOT_PRESENT;
        };

        let result = create(instance, create_info, allocator, p_surface);
        if result == vk::Result::SUCCESS {
            tracker.add_surface(*p_surface, (*create_info).hwnd as u64);
        }
        result
    })
}

unsafe extern "system" fn destroy_surface(
    instance: vk::Instance,
    surface: vk::SurfaceKHR,
    allocator: *const vk::AllocationCallbacks,
) {
    guarded("vkDestroySurfaceKHR", (), || {
        let tracker = runtime().vulkan();
        tracker.remove_surface(surface);
        if let Some(destroy) = tracker
            .instance(dispatch_key(instance))
            .and_then(|dispatch| dispatch.destroy_surface_khr)
        {
            destroy(instance, surface, allocator);
        }
    })
}

unsafe extern "system" fn create_device(
    physical_device: vk::PhysicalDevice,
    create_info: *const vk::DeviceCreateInfo,
    allocator: *const vk::AllocationCallbacks,
    p_device: *mut vk::Device,
) -> vk::Result {
    guarded("vkCreateDevice", vk::Result::ERROR_INITIALIZATION_FAILED, || {
        let Some(link) = chain::take_device_link(create_info) else {
            tracing::error!("vkCreateDevice: no layer link in the create info");
            return vk::Result::ERROR_INITIALIZATION_FAILED;
        };

        let runtime = runtime();
        let instance = runtime.vulkan().instance(dispatch_key(physical_device));
        let instance_handle = instance.as_ref().map_or(vk::Instance::null(), |i| i.instance);
        let Some(create) =
            chain::load_proc::<_, vk::PFN_vkCreateDevice>(link.next_gipa, instance_handle, c"vkCreateDevice")
        else {
            return vk::Result::ERROR_INITIALIZATION_FAILED;
        };

        let result = create(physical_device, create_info, allocator, p_device);
        if result != vk::Result::SUCCESS {
            return result;
        }

        let device = *p_device;
        track_device(runtime, physical_device, device, &*create_info, &link, instance);
        result
    })
}

unsafe fn track_device(
    runtime: &HookRuntime,
    physical_device: vk::PhysicalDevice,
    device: vk::Device,
    create_info: &vk::DeviceCreateInfo,
    link: &chain::DeviceLink,
    instance: Option<Arc<InstanceDispatch>>,
) {
    let next = Arc::new(DeviceDispatch::load(device, link));
    let families = instance
        .as_ref()
        .map(|instance| instance.queue_families(physical_device))
        .unwrap_or_default();
    let caps = ExternalMemoryCaps::from_raw_extensions(
        create_info.pp_enabled_extension_names,
        create_info.enabled_extension_count,
    );
    let ops = NativeDeviceOps::new(
        physical_device,
        next.clone(),
        instance,
        select_graphics_family(&families),
    );

    runtime.vulkan().add_device(
        dispatch_key(device),
        NewDevice {
            device,
            physical_device,
            families,
            caps,
            ops: Box::new(ops),
            next: Some(next),
        },
    );
}

unsafe extern "system" fn destroy_device(device: vk::Device, allocator: *const vk::AllocationCallbacks) {
    guarded("vkDestroyDevice", (), || {
        if device == vk::Device::null() {
            return;
        }
        let runtime = runtime();
        let Some(record) = runtime.vulkan().remove_device(dispatch_key(device), runtime.forwarder()) else {
            return;
        };
        let destroy = record.next.as_ref().and_then(|next| next.destroy_device);
        drop(record);
        if let Some(destroy) = destroy {
            destroy(device, allocator);
        }
    })
}

unsafe extern "system" fn get_device_queue(
    device: vk::Device,
    family_index: u32,
    queue_index: u32,
    p_queue: *mut vk::Queue,
) {
    guarded("vkGetDeviceQueue", (), || {
        let tracker = runtime().vulkan();
        let key = dispatch_key(device);
        let Some(get) = tracker.device_dispatch(key).and_then(|next| next.get_device_queue) else {
            return;
        };

        get(device, family_index, queue_index, p_queue);
        if !p_queue.is_null() && *p_queue != vk::Queue::null() {
            tracker.on_queue(key, *p_queue, family_index);
        }
    })
}

unsafe extern "system" fn get_device_queue2(
    device: vk::Device,
    queue_info: *const vk::DeviceQueueInfo2,
    p_queue: *mut vk::Queue,
) {
    guarded("vkGetDeviceQueue2", (), || {
        let tracker = runtime().vulkan();
        let key = dispatch_key(device);
        let Some(get) = tracker.device_dispatch(key).and_then(|next| next.get_device_queue2) else {
            return;
        };

        get(device, queue_info, p_queue);
        if !queue_info.is_null() && !p_queue.is_null() && *p_queue != vk::Queue::null() {
            tracker.on_queue(key, *p_queue, (*queue_info).queue_family_index);
        }
    })
}

unsafe extern "system" fn create_swapchain(
    device: vk::Device,
    create_info: *const vk::SwapchainCreateInfoKHR,
    allocator: *const vk::AllocationCallbacks,
    p_swapchain: *mut vk::SwapchainKHR,
) -> vk::Result {
    if device == vk::Device::null() || create_info.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    let key = dispatch_key(device);
    let next = guarded("vkCreateSwapchainKHR", None, || {
        let tracker = runtime().vulkan();
        let fns = tracker.device_dispatch(key).and_then(|next| next.swapchain)?;
        Some((fns, tracker.swapchain_create_info(&*create_info)))
    });
    let Some((fns, modified)) = next else {
        tracing::error!("vkCreateSwapchainKHR on untracked device {:#x}", device.as_raw());
        return vk::Result::ERROR_EXTENSION_NOT_PRESENT;
    };

    let mut result = (fns.create)(device, &modified, allocator, p_swapchain);
    let mut used = modified;
    if result != vk::Result::SUCCESS && modified.image_usage != (*create_info).image_usage {
        tracing::warn!("Swapchain creation with TRANSFER_SRC failed ({:?}), retrying as requested", result);
        used = *create_info;
        result = (fns.create)(device, create_info, allocator, p_swapchain);
    }

    if result == vk::Result::SUCCESS {
        guarded("vkCreateSwapchainKHR tracking", (), || {
            let runtime = runtime();
            runtime.vulkan().add_swapchain(key, *p_swapchain, &used, runtime.forwarder());
        });
    }
    result
}

unsafe extern "system" fn destroy_swapchain(
    device: vk::Device,
    swapchain: vk::SwapchainKHR,
    allocator: *const vk::AllocationCallbacks,
) {
    guarded("vkDestroySwapchainKHR", (), || {
        let runtime = runtime();
        let tracker = runtime.vulkan();
        let key = dispatch_key(device);
        tracker.remove_swapchain(key, swapchain, runtime.forwarder());
        if let Some(fns) = tracker.device_dispatch(key).and_then(|next| next.swapchain) {
            (fns.destroy)(device, swapchain, allocator);
        }
    })
}

unsafe extern "system" fn queue_present(queue: vk::Queue, present_info: *const vk::PresentInfoKHR) -> vk::Result {
    if queue == vk::Queue::null() {
        return vk::Result::ERROR_DEVICE_LOST;
    }
    let next = guarded("vkQueuePresentKHR", None, || {
        runtime()
            .vulkan()
            .device_dispatch(dispatch_key(queue))
            .and_then(|next| next.swapchain)
    });
    let Some(fns) = next else {
        tracing::error!("vkQueuePresentKHR on untracked queue {:#x}", queue.as_raw());
        return vk::Result::ERROR_DEVICE_LOST;
    };
    if present_info.is_null() {
        return (fns.queue_present)(queue, present_info);
    }

    let runtime = runtime();
    let tracker = runtime.vulkan();
    let mut sync = PresentSync::from_present(&*present_info);
    present_with_capture(
        &mut sync,
        |sync| {
            tracker.layer_capture(queue, &*present_info, sync, runtime.forwarder());
        },
        |sync| match sync.present_waits() {
            Some(waits) => {
                let mut info = *present_info;
                info.wait_semaphore_count = waits.len() as u32;
                info.p_wait_semaphores = waits.as_ptr();
                (fns.queue_present)(queue, &info)
            }
            None => (fns.queue_present)(queue, present_info),
        },
        |result| tracker.after_present(queue, &*present_info, result, runtime.forwarder()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate_fills_entry_points() {
        let mut interface = NegotiateLayerInterface {
            s_type: LAYER_NEGOTIATE_INTERFACE_STRUCT,
            p_next: std::ptr::null_mut(),
            loader_layer_interface_version: 5,
            pfn_get_instance_proc_addr: None,
            pfn_get_device_proc_addr: None,
            pfn_get_physical_device_proc_addr: None,
        };

        assert_eq!(unsafe { negotiate(&mut interface) }, vk::Result::SUCCESS);
        assert_eq!(interface.loader_layer_interface_version, LAYER_INTERFACE_VERSION);
        assert!(interface.pfn_get_instance_proc_addr.is_some());
        assert!(interface.pfn_get_device_proc_addr.is_some());
    }

    #[test]
    fn test_negotiate_rejects_old_loader() {
        let mut interface = NegotiateLayerInterface {
            s_type: LAYER_NEGOTIATE_INTERFACE_STRUCT,
            p_next: std::ptr::null_mut(),
            loader_layer_interface_version: 1,
            pfn_get_instance_proc_addr: None,
            pfn_get_device_proc_addr: None,
            pfn_get_physical_device_proc_addr: None,
        };

        assert_eq!(
            unsafe { negotiate(&mut interface) },
            vk::Result::ERROR_INITIALIZATION_FAILED
        );
        assert!(interface.pfn_get_instance_proc_addr.is_none());
        assert_eq!(
            unsafe { negotiate(std::ptr::null_mut()) },
            vk::Result::ERROR_INITIALIZATION_FAILED
        );
    }

    #[test]
    fn test_intercept_tables() {
        assert!(instance_intercept(b"vkCreateInstance").is_some());
        assert!(instance_intercept(b"vkQueuePresentKHR").is_some());
        assert!(device_intercept(b"vkCreateInstance").is_none());
        assert!(device_intercept(b"vkCmdDraw").is_none());
        // The export target's own image and memory calls go straight to the next layer
        assert!(device_intercept(b"vkCreateImage").is_none());
        assert!(device_intercept(b"vkAllocateMemory").is_none());
        assert!(instance_intercept(b"vkAllocateMemory").is_none());
        assert_eq!(
            instance_intercept(b"vkQueuePresentKHR"),
            device_intercept(b"vkQueuePresentKHR")
        );
    }

    #[test]
    fn test_panicking_capture_still_presents() {
        let mut presented = 0;
        let result = present_with_capture(
            &mut presented,
            |_| panic!("capture failed"),
            |_| vk::Result::SUBOPTIMAL_KHR,
            |_| (),
        );
        assert_eq!(result, vk::Result::SUBOPTIMAL_KHR);

        let result = present_with_capture(
            &mut presented,
            |count| *count += 1,
            |count| {
                assert_eq!(*count, 1);
                vk::Result::SUCCESS
            },
            |_| panic!("after present failed"),
        );
        assert_eq!(result, vk::Result::SUCCESS);
    }

    #[test]
    fn test_present_sees_capture_state_after_panic() {
        let mut waits = vec![1u64];
        let result = present_with_capture(
            &mut waits,
            |waits| {
                waits.push(2);
                panic!("capture failed after the copy");
            },
            |waits| {
                assert_eq!(*waits, vec![1, 2]);
                vk::Result::SUCCESS
            },
            |_| (),
        );
        assert_eq!(result, vk::Result::SUCCESS);
    }

    #[test]
    fn test_null_name_resolves_nothing() {
        assert!(unsafe { get_instance_proc_addr(vk::Instance::null(), std::ptr::null()) }.is_none());
        assert!(unsafe { get_device_proc_addr(vk::Device::null(), c"vkQueuePresentKHR".as_ptr()) }.is_none());
    }

    #[test]
    fn test_global_commands_resolve_without_instance() {
        let f = unsafe { get_instance_proc_addr(vk::Instance::null(), c"vkCreateInstance".as_ptr()) };
        assert!(f.is_some());
        let unknown = unsafe { get_instance_proc_addr(vk::Instance::null(), c"vkCmdDraw".as_ptr()) };
        assert!(unknown.is_none());
    }
}
