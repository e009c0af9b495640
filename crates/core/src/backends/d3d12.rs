//! Direct3D 12 capture
//!
//! The host calls `capture(swap_chain, queue)`. The current back buffer is
//! looked up through IDXGISwapChain3 and handed on as an ID3D12Resource
//! pointer that stays owned by the swap chain.

use std::ffi::c_void;

use gcap_sdk::{
    vtable, Backend, DxgiGetBufferFn, DxgiGetCurrentBackBufferIndexFn, IID_ID3D12_RESOURCE,
    IID_IDXGI_SWAP_CHAIN3,
};

use super::com;
use super::d3d11::{surface_desc, swap_chain_desc};
use super::{SurfaceFrame, SurfaceReader};
use crate::error::{CaptureResult, CaptureSkip};
use crate::frame::NativeHandle;

#[derive(Debug, Default, Clone, Copy)]
pub struct D3d12Reader;

impl D3d12Reader {
    unsafe fn current_index(swap_chain: *mut c_void) -> CaptureResult<u32> {
        let swap_chain3 =
            com::query_interface(swap_chain, &IID_IDXGI_SWAP_CHAIN3, "QueryInterface(IDXGISwapChain3)")?;
        let get_index: DxgiGetCurrentBackBufferIndexFn =
            com::method(swap_chain3, vtable::DXGI_SWAP_CHAIN3_GET_CURRENT_BACK_BUFFER_INDEX);
        let index = get_index(swap_chain3);
        com::release(swap_chain3);
        Ok(index)
    }

    /// Borrow back buffer `index` as an ID3D12Resource
    unsafe fn buffer(swap_chain: *mut c_void, index: u32) -> CaptureResult<*mut c_void> {
        let get_buffer: DxgiGetBufferFn = com::method(swap_chain, vtable::DXGI_SWAP_CHAIN_GET_BUFFER);
        let mut resource = std::ptr::null_mut();
        com::check(
            "IDXGISwapChain::GetBuffer",
            get_buffer(swap_chain.cast(), index, &IID_ID3D12_RESOURCE, &mut resource),
        )?;
        if resource.is_null() {
            return Err(CaptureSkip::NullArgument("back buffer"));
        }
        // The swap chain holds its own reference for as long as the buffer exists
        com::release(resource);
        Ok(resource)
    }
}

impl SurfaceReader for D3d12Reader {
    const BACKEND: Backend = Backend::D3D12;

    unsafe fn describe(&self, swap_chain: *mut c_void, queue: *mut c_void) -> CaptureResult<SurfaceFrame> {
        if queue.is_null() {
            return Err(CaptureSkip::NullArgument("queue"));
        }
        let desc = swap_chain_desc(swap_chain)?;
        let index = Self::current_index(swap_chain)?;
        if desc.buffer_count != 0 && index >= desc.buffer_count {
            return Err(CaptureSkip::Unsupported("back buffer index out of range"));
        }
        let resource = Self::buffer(swap_chain, index)?;

        Ok(SurfaceFrame {
            desc: surface_desc(&desc),
            resource: resource as u64,
        })
    }

    unsafe fn share(&self, _swap_chain: *mut c_void, _queue: *mut c_void, frame: &SurfaceFrame) -> CaptureResult<NativeHandle> {
        Ok(NativeHandle::Resource(frame.resource))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::backends::com::fake::FakeObject;
    use crate::backends::SurfaceCapture;
    use crate::forwarder::testing::recording_forwarder;
    use gcap_sdk::{DxgiModeDesc, DxgiSwapChainDesc, Guid, HandleKind, IDXGISwapChain, HRESULT};

    /// Swap chain state: current index and one fake resource per buffer
    struct Chain {
        index: AtomicU32,
        buffers: Vec<Box<FakeObject<()>>>,
    }

    unsafe extern "system" fn get_desc(this: *mut IDXGISwapChain, desc: *mut DxgiSwapChainDesc) -> HRESULT {
        let chain = &FakeObject::<Chain>::from_ptr(this.cast()).state;
        *desc = DxgiSwapChainDesc {
            buffer_desc: DxgiModeDesc {
                width: 2560,
                height: 1440,
                format: 24,
                ..Default::default()
            },
            buffer_count: chain.buffers.len() as u32,
            ..Default::default()
        };
        0
    }

    /// The fake chain answers for IDXGISwapChain3 itself
    unsafe extern "system" fn query(this: *mut c_void, riid: *const Guid, out: *mut *mut c_void) -> HRESULT {
        if *riid != IID_IDXGI_SWAP_CHAIN3 {
            return 0x8000_4002u32 as i32;
        }
        FakeObject::<Chain>::from_ptr(this).refs.fetch_add(1, Ordering::Relaxed);
        *out = this;
        0
    }

    unsafe extern "system" fn current_index(this: *mut c_void) -> u32 {
        FakeObject::<Chain>::from_ptr(this).state.index.load(Ordering::Relaxed)
    }

    unsafe extern "system" fn get_buffer(
        this: *mut IDXGISwapChain,
        buffer: u32,
        riid: *const Guid,
        out: *mut *mut c_void,
    ) -> HRESULT {
        if *riid != IID_ID3D12_RESOURCE {
            return 0x8000_4002u32 as i32;
        }
        let chain = &FakeObject::<Chain>::from_ptr(this.cast()).state;
        let resource = &chain.buffers[buffer as usize];
        resource.refs.fetch_add(1, Ordering::Relaxed);
        *out = resource.as_ptr();
        0
    }

    fn chain() -> Box<FakeObject<Chain>> {
        let state = Chain {
            index: AtomicU32::new(0),
            buffers: (0..3).map(|_| FakeObject::new((), &[])).collect(),
        };
        FakeObject::new(
            state,
            &[
                (vtable::QUERY_INTERFACE, query as *const c_void),
                (vtable::DXGI_SWAP_CHAIN_GET_DESC, get_desc as *const c_void),
                (vtable::DXGI_SWAP_CHAIN_GET_BUFFER, get_buffer as *const c_void),
                (
                    vtable::DXGI_SWAP_CHAIN3_GET_CURRENT_BACK_BUFFER_INDEX,
                    current_index as *const c_void,
                ),
            ],
        )
    }

    #[test]
    fn test_current_back_buffer_is_forwarded() {
        let (forwarder, sink) = recording_forwarder();
        let capture = SurfaceCapture::new(D3d12Reader, true);
        let chain = chain();
        let queue = 0x9000 as *mut c_void;

        for index in [0u32, 1, 2, 0] {
            chain.state.index.store(index, Ordering::Relaxed);
            assert!(unsafe { capture.capture(&forwarder, chain.as_ptr(), queue) });
        }

        let frames = sink.frames.lock();
        let handles: Vec<u64> = frames.iter().map(|f| f.handle).collect();
        let expected: Vec<u64> = [0usize, 1, 2, 0]
            .iter()
            .map(|i| chain.state.buffers[*i].as_ptr() as u64)
            .collect();
        assert_eq!(handles, expected);
        assert_eq!(frames[0].handle_kind, HandleKind::ResourcePointer as u32);

        // Every borrowed reference was given back
        assert_eq!(chain.refs(), 1);
        assert!(chain.state.buffers.iter().all(|b| b.refs() == 1));
    }

    #[test]
    fn test_null_queue() {
        let (forwarder, _sink) = recording_forwarder();
        let capture = SurfaceCapture::new(D3d12Reader, true);
        let chain = chain();

        let result = unsafe { capture.try_capture(&forwarder, chain.as_ptr(), std::ptr::null_mut()) };
        assert_eq!(result, Err(CaptureSkip::NullArgument("queue")));
    }
}
