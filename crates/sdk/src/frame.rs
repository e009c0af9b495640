//! Frame descriptor handed to the capture sink
//!
//! The descriptor is a borrowed view: the native resource it names stays owned
//! by the backend and is only valid until the next reset of that backend.

use crate::backend::Backend;

/// How to interpret [`FrameDescriptor::handle`]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// OS shared handle (DXGI shared resource) importable by another device
    SharedHandle = 0,
    /// In-process interface pointer (IDirect3DSurface9*, ID3D12Resource*)
    ResourcePointer = 1,
    /// Pointer to CPU-visible pixel rows, `stride` bytes apart
    CpuMapped = 2,
    /// Exported device memory (Win32 HANDLE or POSIX fd), `size` bytes
    ExportedMemory = 3,
}

/// C-layout description of one captured frame resource
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDescriptor {
    /// [`Backend`] discriminant
    pub backend: u32,
    /// Native pixel format value of the owning API (D3DFORMAT, DXGI_FORMAT, VkFormat, GL enum)
    pub format: u32,
    pub width: u32,
    pub height: u32,
    /// [`HandleKind`] discriminant
    pub handle_kind: u32,
    /// Row pitch for CPU-mapped frames, zero otherwise
    pub stride: u32,
    /// The native handle or pointer
    pub handle: u64,
    /// Allocation size for exported memory, zero otherwise
    pub size: u64,
    /// Number of resets the backend had seen when this resource was registered
    pub epoch: u64,
}

impl FrameDescriptor {
    /// Backend of this frame, if the raw value is known
    pub fn backend(&self) -> Option<Backend> {
        Backend::from_raw(self.backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn test_descriptor_size() {
        // 6 x u32 + 3 x u64, no padding
        assert_eq!(mem::size_of::<FrameDescriptor>(), 48);
        assert_eq!(mem::align_of::<FrameDescriptor>(), 8);
    }
}
