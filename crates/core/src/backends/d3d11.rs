//! Direct3D 10/11 capture
//!
//! Both versions present through a DXGI swap chain. The host calls
//! `capture(swap_chain, backbuffer)`; the frame is exposed through the back
//! buffer's DXGI shared handle.

use std::ffi::c_void;

use gcap_sdk::{vtable, Backend, DxgiGetDescFn, DxgiGetSharedHandleFn, DxgiSwapChainDesc, IID_IDXGI_RESOURCE};

use super::com;
use super::{SurfaceFrame, SurfaceReader};
use crate::error::{CaptureResult, CaptureSkip};
use crate::frame::{NativeHandle, SurfaceDesc};

/// Read the swap chain description
///
/// # Safety
/// `swap_chain` must be a valid IDXGISwapChain
pub(crate) unsafe fn swap_chain_desc(swap_chain: *mut c_void) -> CaptureResult<DxgiSwapChainDesc> {
    let get_desc: DxgiGetDescFn = com::method(swap_chain, vtable::DXGI_SWAP_CHAIN_GET_DESC);
    let mut desc = DxgiSwapChainDesc::default();
    com::check("IDXGISwapChain::GetDesc", get_desc(swap_chain.cast(), &mut desc))?;
    Ok(desc)
}

pub(crate) fn surface_desc(desc: &DxgiSwapChainDesc) -> SurfaceDesc {
    SurfaceDesc::new(
        desc.buffer_desc.format,
        desc.buffer_desc.width,
        desc.buffer_desc.height,
    )
}

#[derive(Debug, Default, Clone, Copy)]
pub struct D3d11Reader;

impl SurfaceReader for D3d11Reader {
    const BACKEND: Backend = Backend::D3D11;

    unsafe fn describe(&self, swap_chain: *mut c_void, backbuffer: *mut c_void) -> CaptureResult<SurfaceFrame> {
        if backbuffer.is_null() {
            return Err(CaptureSkip::NullArgument("backbuffer"));
        }
        let desc = swap_chain_desc(swap_chain)?;

        Ok(SurfaceFrame {
            desc: surface_desc(&desc),
            resource: backbuffer as u64,
        })
    }

    unsafe fn share(&self, _swap_chain: *mut c_void, backbuffer: *mut c_void, _frame: &SurfaceFrame) -> CaptureResult<NativeHandle> {
        let resource = com::query_interface(backbuffer, &IID_IDXGI_RESOURCE, "QueryInterface(IDXGIResource)")?;

        let get_shared_handle: DxgiGetSharedHandleFn =
            com::method(resource, vtable::DXGI_RESOURCE_GET_SHARED_HANDLE);
        let mut handle = std::ptr::null_mut();
        let hr = get_shared_handle(resource.cast(), &mut handle);
        com::release(resource);

        com::check("IDXGIResource::GetSharedHandle", hr)?;
        if handle.is_null() {
            return Err(CaptureSkip::Unsupported("back buffer was not created shareable"));
        }
        Ok(NativeHandle::Shared(handle as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::com::fake::FakeObject;
    use crate::backends::SurfaceCapture;
    use crate::forwarder::testing::recording_forwarder;
    use gcap_sdk::{DxgiModeDesc, Guid, HandleKind, IDXGIResource, IDXGISwapChain, HRESULT};

    /// DXGI_FORMAT_R8G8B8A8_UNORM
    const FORMAT_RGBA8: u32 = 28;

    unsafe extern "system" fn get_desc(this: *mut IDXGISwapChain, desc: *mut DxgiSwapChainDesc) -> HRESULT {
        let (width, height) = FakeObject::<(u32, u32)>::from_ptr(this.cast()).state;
        *desc = DxgiSwapChainDesc {
            buffer_desc: DxgiModeDesc {
                width,
                height,
                format: FORMAT_RGBA8,
                ..Default::default()
            },
            buffer_count: 2,
            ..Default::default()
        };
        0
    }

    /// Back buffer state: the resource object its QueryInterface returns
    unsafe extern "system" fn query_resource(this: *mut c_void, riid: *const Guid, out: *mut *mut c_void) -> HRESULT {
        if *riid != IID_IDXGI_RESOURCE {
            return 0x8000_4002u32 as i32;
        }
        let resource = FakeObject::<*mut c_void>::from_ptr(this).state;
        FakeObject::<usize>::from_ptr(resource)
            .refs
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        *out = resource;
        0
    }

    unsafe extern "system" fn get_shared_handle(this: *mut IDXGIResource, out: *mut *mut c_void) -> HRESULT {
        *out = FakeObject::<usize>::from_ptr(this.cast()).state as *mut c_void;
        0
    }

    fn swap_chain(width: u32, height: u32) -> Box<FakeObject<(u32, u32)>> {
        FakeObject::new(
            (width, height),
            &[(vtable::DXGI_SWAP_CHAIN_GET_DESC, get_desc as *const c_void)],
        )
    }

    fn resource(shared: usize) -> Box<FakeObject<usize>> {
        FakeObject::new(
            shared,
            &[(vtable::DXGI_RESOURCE_GET_SHARED_HANDLE, get_shared_handle as *const c_void)],
        )
    }

    fn backbuffer(resource: &FakeObject<usize>) -> Box<FakeObject<*mut c_void>> {
        FakeObject::new(
            resource.as_ptr(),
            &[(vtable::QUERY_INTERFACE, query_resource as *const c_void)],
        )
    }

    #[test]
    fn test_shared_handle_is_forwarded_once_per_buffer() {
        let (forwarder, sink) = recording_forwarder();
        let capture = SurfaceCapture::new(D3d11Reader, true);
        let swap_chain = swap_chain(1920, 1080);
        let resource = resource(0x7700);
        let backbuffer = backbuffer(&resource);

        for _ in 0..3 {
            assert!(unsafe { capture.capture(&forwarder, swap_chain.as_ptr(), backbuffer.as_ptr()) });
        }

        let frames = sink.frames.lock();
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.handle == 0x7700));
        assert_eq!(frames[0].handle_kind, HandleKind::SharedHandle as u32);
        assert_eq!((frames[0].width, frames[0].height, frames[0].format), (1920, 1080, FORMAT_RGBA8));
        // QueryInterface reference released after the single share
        assert_eq!(resource.refs(), 1);
    }

    #[test]
    fn test_unshareable_back_buffer_is_skipped() {
        let (forwarder, sink) = recording_forwarder();
        let capture = SurfaceCapture::new(D3d11Reader, true);
        let swap_chain = swap_chain(800, 600);
        let resource = resource(0);
        let backbuffer = backbuffer(&resource);

        let result = unsafe { capture.try_capture(&forwarder, swap_chain.as_ptr(), backbuffer.as_ptr()) };
        assert!(matches!(result, Err(CaptureSkip::Unsupported(_))));
        assert!(sink.frames.lock().is_empty());
    }

    #[test]
    fn test_null_backbuffer() {
        let (forwarder, _sink) = recording_forwarder();
        let capture = SurfaceCapture::new(D3d11Reader, true);
        let swap_chain = swap_chain(800, 600);

        let result = unsafe { capture.try_capture(&forwarder, swap_chain.as_ptr(), std::ptr::null_mut()) };
        assert_eq!(result, Err(CaptureSkip::NullArgument("backbuffer")));
    }
}
