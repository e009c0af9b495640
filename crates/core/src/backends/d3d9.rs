//! Direct3D 9 capture
//!
//! The host calls `capture(device, surface)`. The surface is handed on as an
//! in-process pointer; when the host passes none the device's first back
//! buffer is used.

use std::ffi::c_void;

use gcap_sdk::{vtable, Backend, D3d9GetBackBufferFn, D3d9SurfaceGetDescFn, D3dSurfaceDesc};

use super::com;
use super::{SurfaceFrame, SurfaceReader};
use crate::error::{CaptureResult, CaptureSkip};
use crate::frame::{NativeHandle, SurfaceDesc};

/// D3DBACKBUFFER_TYPE_MONO
const BACKBUFFER_TYPE_MONO: u32 = 0;

#[derive(Debug, Default, Clone, Copy)]
pub struct D3d9Reader;

impl D3d9Reader {
    unsafe fn surface_desc(surface: *mut c_void) -> CaptureResult<D3dSurfaceDesc> {
        let get_desc: D3d9SurfaceGetDescFn = com::method(surface, vtable::D3D9_SURFACE_GET_DESC);
        let mut desc = D3dSurfaceDesc::default();
        com::check("IDirect3DSurface9::GetDesc", get_desc(surface.cast(), &mut desc))?;
        Ok(desc)
    }

    /// Fetch back buffer 0, returning an owned reference
    unsafe fn back_buffer(device: *mut c_void) -> CaptureResult<*mut c_void> {
        let get_back_buffer: D3d9GetBackBufferFn =
            com::method(device, vtable::D3D9_DEVICE_GET_BACK_BUFFER);
        let mut surface = std::ptr::null_mut();
        com::check(
            "IDirect3DDevice9::GetBackBuffer",
            get_back_buffer(device.cast(), 0, 0, BACKBUFFER_TYPE_MONO, &mut surface),
        )?;
        if surface.is_null() {
            return Err(CaptureSkip::NullArgument("back buffer"));
        }
        Ok(surface.cast())
    }
}

impl SurfaceReader for D3d9Reader {
    const BACKEND: Backend = Backend::D3D9;

    unsafe fn describe(&self, device: *mut c_void, surface: *mut c_void) -> CaptureResult<SurfaceFrame> {
        let (surface, owned) = if surface.is_null() {
            (Self::back_buffer(device)?, true)
        } else {
            (surface, false)
        };

        let desc = Self::surface_desc(surface);
        if owned {
            // The device keeps the back buffer alive; only our reference goes
            com::release(surface);
        }
        let desc = desc?;

        Ok(SurfaceFrame {
            desc: SurfaceDesc::new(desc.format, desc.width, desc.height),
            resource: surface as u64,
        })
    }

    unsafe fn share(&self, _device: *mut c_void, _surface: *mut c_void, frame: &SurfaceFrame) -> CaptureResult<NativeHandle> {
        Ok(NativeHandle::Resource(frame.resource))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::com::fake::FakeObject;
    use crate::backends::SurfaceCapture;
    use crate::forwarder::testing::recording_forwarder;
    use gcap_sdk::{HandleKind, IDirect3DDevice9, IDirect3DSurface9, HRESULT};

    /// D3DFMT_X8R8G8B8
    const FMT_X8R8G8B8: u32 = 22;

    unsafe extern "system" fn get_desc(this: *mut IDirect3DSurface9, desc: *mut D3dSurfaceDesc) -> HRESULT {
        *desc = FakeObject::<D3dSurfaceDesc>::from_ptr(this.cast()).state;
        0
    }

    unsafe extern "system" fn get_back_buffer(
        this: *mut IDirect3DDevice9,
        _swap_chain: u32,
        _index: u32,
        _kind: u32,
        out: *mut *mut IDirect3DSurface9,
    ) -> HRESULT {
        let surface = FakeObject::<*mut c_void>::from_ptr(this.cast()).state;
        let object = FakeObject::<D3dSurfaceDesc>::from_ptr(surface);
        object.refs.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        *out = surface.cast();
        0
    }

    fn surface(width: u32, height: u32) -> Box<FakeObject<D3dSurfaceDesc>> {
        let desc = D3dSurfaceDesc {
            format: FMT_X8R8G8B8,
            width,
            height,
            ..Default::default()
        };
        FakeObject::new(desc, &[(vtable::D3D9_SURFACE_GET_DESC, get_desc as *const c_void)])
    }

    #[test]
    fn test_explicit_surface() {
        let (forwarder, sink) = recording_forwarder();
        let capture = SurfaceCapture::new(D3d9Reader, true);
        let device = FakeObject::new(std::ptr::null_mut::<c_void>(), &[]);
        let surface = surface(1024, 768);

        assert!(unsafe { capture.capture(&forwarder, device.as_ptr(), surface.as_ptr()) });

        let frames = sink.frames.lock();
        assert_eq!(frames[0].handle, surface.as_ptr() as u64);
        assert_eq!(frames[0].handle_kind, HandleKind::ResourcePointer as u32);
        assert_eq!((frames[0].width, frames[0].height, frames[0].format), (1024, 768, FMT_X8R8G8B8));
        assert_eq!(surface.refs(), 1);
    }

    #[test]
    fn test_back_buffer_fallback_releases() {
        let (forwarder, sink) = recording_forwarder();
        let capture = SurfaceCapture::new(D3d9Reader, true);
        let back_buffer = surface(640, 480);
        let device = FakeObject::new(
            back_buffer.as_ptr(),
            &[(vtable::D3D9_DEVICE_GET_BACK_BUFFER, get_back_buffer as *const c_void)],
        );

        assert!(unsafe { capture.capture(&forwarder, device.as_ptr(), std::ptr::null_mut()) });
        assert_eq!(back_buffer.refs(), 1);
        assert_eq!(sink.frames.lock()[0].handle, back_buffer.as_ptr() as u64);
    }
}
