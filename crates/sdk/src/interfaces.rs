//! Native graphics interface type definitions
//!
//! These are opaque types representing COM interfaces and GL handles.
//! We don't need their internal structure - just pointers.
//! Methods are called through raw vtable indices, the layouts of which are
//! fixed by the published Direct3D/DXGI headers.

use std::ffi::c_void;

/// COM result code
pub type HRESULT = i32;

/// Returns true for a successful HRESULT (non-negative)
#[inline]
pub const fn succeeded(hr: HRESULT) -> bool {
    hr >= 0
}

/// Opaque type for IDirect3DDevice9
#[repr(C)]
pub struct IDirect3DDevice9 {
    _opaque: [u8; 0],
}

/// Opaque type for IDirect3DSurface9
#[repr(C)]
pub struct IDirect3DSurface9 {
    _opaque: [u8; 0],
}

/// Opaque type for IDXGISwapChain (and its later revisions)
#[repr(C)]
pub struct IDXGISwapChain {
    _opaque: [u8; 0],
}

/// Opaque type for IDXGIResource
#[repr(C)]
pub struct IDXGIResource {
    _opaque: [u8; 0],
}

/// Opaque type for ID3D11Texture2D / ID3D10Texture2D back buffers
#[repr(C)]
pub struct ID3D11Texture2D {
    _opaque: [u8; 0],
}

/// Opaque type for ID3D12CommandQueue
#[repr(C)]
pub struct ID3D12CommandQueue {
    _opaque: [u8; 0],
}

/// Opaque type for ID3D12Resource
#[repr(C)]
pub struct ID3D12Resource {
    _opaque: [u8; 0],
}

/// Opaque GDI device context (HDC)
#[repr(C)]
pub struct Hdc {
    _opaque: [u8; 0],
}

/// Opaque WGL rendering context (HGLRC)
#[repr(C)]
pub struct Hglrc {
    _opaque: [u8; 0],
}

/// COM interface identifier
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

/// {035f3ab4-482e-4e50-b41f-8a7f8bd8960b}
pub const IID_IDXGI_RESOURCE: Guid = Guid {
    data1: 0x035f_3ab4,
    data2: 0x482e,
    data3: 0x4e50,
    data4: [0xb4, 0x1f, 0x8a, 0x7f, 0x8b, 0xd8, 0x96, 0x0b],
};

/// {94d99bdb-f1f8-4ab0-b236-7da0170edab1}
pub const IID_IDXGI_SWAP_CHAIN3: Guid = Guid {
    data1: 0x94d9_9bdb,
    data2: 0xf1f8,
    data3: 0x4ab0,
    data4: [0xb2, 0x36, 0x7d, 0xa0, 0x17, 0x0e, 0xda, 0xb1],
};

/// {696442be-a72e-4059-bc79-5b5c98040fad}
pub const IID_ID3D12_RESOURCE: Guid = Guid {
    data1: 0x6964_42be,
    data2: 0xa72e,
    data3: 0x4059,
    data4: [0xbc, 0x79, 0x5b, 0x5c, 0x98, 0x04, 0x0f, 0xad],
};

/// VTable indices for the COM methods the backends call
pub mod vtable {
    /// IUnknown::QueryInterface
    pub const QUERY_INTERFACE: usize = 0;
    /// IUnknown::Release
    pub const RELEASE: usize = 2;

    /// IDirect3DDevice9::GetBackBuffer
    pub const D3D9_DEVICE_GET_BACK_BUFFER: usize = 18;
    /// IDirect3DSurface9::GetDesc (after IDirect3DResource9 and GetContainer)
    pub const D3D9_SURFACE_GET_DESC: usize = 12;

    /// IDXGISwapChain::GetBuffer
    pub const DXGI_SWAP_CHAIN_GET_BUFFER: usize = 9;
    /// IDXGISwapChain::GetDesc
    pub const DXGI_SWAP_CHAIN_GET_DESC: usize = 12;
    /// IDXGISwapChain3::GetCurrentBackBufferIndex
    pub const DXGI_SWAP_CHAIN3_GET_CURRENT_BACK_BUFFER_INDEX: usize = 36;

    /// IDXGIResource::GetSharedHandle
    pub const DXGI_RESOURCE_GET_SHARED_HANDLE: usize = 8;
}

/// D3DSURFACE_DESC
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct D3dSurfaceDesc {
    pub format: u32,
    pub resource_type: u32,
    pub usage: u32,
    pub pool: u32,
    pub multi_sample_type: u32,
    pub multi_sample_quality: u32,
    pub width: u32,
    pub height: u32,
}

/// DXGI_RATIONAL
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DxgiRational {
    pub numerator: u32,
    pub denominator: u32,
}

/// DXGI_MODE_DESC
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DxgiModeDesc {
    pub width: u32,
    pub height: u32,
    pub refresh_rate: DxgiRational,
    pub format: u32,
    pub scanline_ordering: u32,
    pub scaling: u32,
}

/// DXGI_SAMPLE_DESC
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DxgiSampleDesc {
    pub count: u32,
    pub quality: u32,
}

/// DXGI_SWAP_CHAIN_DESC
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DxgiSwapChainDesc {
    pub buffer_desc: DxgiModeDesc,
    pub sample_desc: DxgiSampleDesc,
    pub buffer_usage: u32,
    pub buffer_count: u32,
    pub output_window: *mut c_void,
    pub windowed: i32,
    pub swap_effect: u32,
    pub flags: u32,
}

impl Default for DxgiSwapChainDesc {
    fn default() -> Self {
        Self {
            buffer_desc: DxgiModeDesc::default(),
            sample_desc: DxgiSampleDesc::default(),
            buffer_usage: 0,
            buffer_count: 0,
            output_window: std::ptr::null_mut(),
            windowed: 0,
            swap_effect: 0,
            flags: 0,
        }
    }
}

/// IUnknown::QueryInterface
pub type QueryInterfaceFn =
    unsafe extern "system" fn(this: *mut c_void, riid: *const Guid, out: *mut *mut c_void) -> HRESULT;

/// IUnknown::Release
pub type ReleaseFn = unsafe extern "system" fn(this: *mut c_void) -> u32;

/// IDirect3DDevice9::GetBackBuffer
pub type D3d9GetBackBufferFn = unsafe extern "system" fn(
    this: *mut IDirect3DDevice9,
    swap_chain: u32,
    back_buffer: u32,
    kind: u32,
    out: *mut *mut IDirect3DSurface9,
) -> HRESULT;

/// IDirect3DSurface9::GetDesc
pub type D3d9SurfaceGetDescFn =
    unsafe extern "system" fn(this: *mut IDirect3DSurface9, desc: *mut D3dSurfaceDesc) -> HRESULT;

/// IDXGISwapChain::GetDesc
pub type DxgiGetDescFn =
    unsafe extern "system" fn(this: *mut IDXGISwapChain, desc: *mut DxgiSwapChainDesc) -> HRESULT;

/// IDXGISwapChain::GetBuffer
pub type DxgiGetBufferFn = unsafe extern "system" fn(
    this: *mut IDXGISwapChain,
    buffer: u32,
    riid: *const Guid,
    out: *mut *mut c_void,
) -> HRESULT;

/// IDXGISwapChain3::GetCurrentBackBufferIndex
pub type DxgiGetCurrentBackBufferIndexFn = unsafe extern "system" fn(this: *mut c_void) -> u32;

/// IDXGIResource::GetSharedHandle
pub type DxgiGetSharedHandleFn =
    unsafe extern "system" fn(this: *mut IDXGIResource, out: *mut *mut c_void) -> HRESULT;

/// OpenGL enums used by the GL read-back path
pub mod gl {
    pub const VIEWPORT: u32 = 0x0BA2;
    pub const PACK_ALIGNMENT: u32 = 0x0D05;
    pub const RGBA: u32 = 0x1908;
    pub const UNSIGNED_BYTE: u32 = 0x1401;

    /// glGetIntegerv
    pub type GetIntegervFn = unsafe extern "system" fn(pname: u32, data: *mut i32);
    /// glPixelStorei
    pub type PixelStoreiFn = unsafe extern "system" fn(pname: u32, param: i32);
    /// glReadPixels
    pub type ReadPixelsFn = unsafe extern "system" fn(
        x: i32,
        y: i32,
        width: i32,
        height: i32,
        format: u32,
        kind: u32,
        pixels: *mut std::ffi::c_void,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn test_surface_desc_size() {
        // Eight 32-bit fields, matching D3DSURFACE_DESC
        assert_eq!(mem::size_of::<D3dSurfaceDesc>(), 32);
    }

    #[test]
    fn test_swap_chain_desc_layout() {
        // BufferDesc is 28 bytes, SampleDesc 8, usage + count 8, then the HWND
        assert_eq!(mem::size_of::<DxgiModeDesc>(), 28);
        let window_offset = mem::offset_of!(DxgiSwapChainDesc, output_window);
        assert_eq!(window_offset % mem::align_of::<*mut c_void>(), 0);
        assert!(window_offset >= 44);
    }

    #[test]
    fn test_hresult() {
        assert!(succeeded(0));
        assert!(succeeded(1));
        assert!(!succeeded(0x8000_4005u32 as i32));
    }
}
