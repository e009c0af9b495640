//! Frame registry
//!
//! Every distinct backend resource that has been forwarded gets a generational
//! [`FrameKey`]. A key is a weak reference: it resolves until the owning
//! backend is reset, after which it is dead forever and the resource must be
//! registered again.

use slotmap::{new_key_type, SlotMap};

use gcap_sdk::{Backend, FrameDescriptor, HandleKind};

new_key_type! {
    /// Handle for a registered frame resource
    pub struct FrameKey;
}

/// Native handle of a frame resource, borrowed from the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeHandle {
    /// DXGI shared handle
    Shared(u64),
    /// In-process interface pointer
    Resource(u64),
    /// CPU-visible pixel rows
    CpuMapped { ptr: u64, stride: u32, len: u64 },
    /// Exported device memory
    Exported { handle: u64, size: u64 },
}

impl NativeHandle {
    pub fn kind(&self) -> HandleKind {
        match self {
            NativeHandle::Shared(_) => HandleKind::SharedHandle,
            NativeHandle::Resource(_) => HandleKind::ResourcePointer,
            NativeHandle::CpuMapped { .. } => HandleKind::CpuMapped,
            NativeHandle::Exported { .. } => HandleKind::ExportedMemory,
        }
    }

    /// The raw handle or pointer value
    pub fn raw(&self) -> u64 {
        match *self {
            NativeHandle::Shared(h) | NativeHandle::Resource(h) => h,
            NativeHandle::CpuMapped { ptr, .. } => ptr,
            NativeHandle::Exported { handle, .. } => handle,
        }
    }

    fn stride(&self) -> u32 {
        match *self {
            NativeHandle::CpuMapped { stride, .. } => stride,
            _ => 0,
        }
    }

    fn size(&self) -> u64 {
        match *self {
            NativeHandle::CpuMapped { len, .. } => len,
            NativeHandle::Exported { size, .. } => size,
            _ => 0,
        }
    }
}

/// Format and extent of a captured surface
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SurfaceDesc {
    /// Native format value of the owning API
    pub format: u32,
    pub width: u32,
    pub height: u32,
}

impl SurfaceDesc {
    pub fn new(format: u32, width: u32, height: u32) -> Self {
        Self {
            format,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

struct FrameEntry {
    backend: Backend,
    desc: SurfaceDesc,
    handle: NativeHandle,
    epoch: u64,
}

/// Generational store of registered frame resources
pub struct FrameRegistry {
    entries: SlotMap<FrameKey, FrameEntry>,
    /// Reset count per backend
    epochs: [u64; Backend::COUNT],
}

impl Default for FrameRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameRegistry {
    pub fn new() -> Self {
        Self {
            entries: SlotMap::with_key(),
            epochs: [0; Backend::COUNT],
        }
    }

    /// Register a resource for the current epoch of its backend
    pub fn register(&mut self, backend: Backend, desc: SurfaceDesc, handle: NativeHandle) -> FrameKey {
        let epoch = self.epochs[backend.index()];
        self.entries.insert(FrameEntry {
            backend,
            desc,
            handle,
            epoch,
        })
    }

    /// Build the wire descriptor for a live key
    pub fn descriptor(&self, key: FrameKey) -> Option<FrameDescriptor> {
        self.entries.get(key).map(|entry| FrameDescriptor {
            backend: entry.backend as u32,
            format: entry.desc.format,
            width: entry.desc.width,
            height: entry.desc.height,
            handle_kind: entry.handle.kind() as u32,
            stride: entry.handle.stride(),
            handle: entry.handle.raw(),
            size: entry.handle.size(),
            epoch: entry.epoch,
        })
    }

    /// Backend that owns a live key
    pub fn backend_of(&self, key: FrameKey) -> Option<Backend> {
        self.entries.get(key).map(|entry| entry.backend)
    }

    pub fn is_live(&self, key: FrameKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Drop a single resource without a backend reset
    pub fn release(&mut self, key: FrameKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Kill every key of a backend and start a new epoch
    ///
    /// # Returns
    /// The number of keys invalidated
    pub fn invalidate(&mut self, backend: Backend) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.backend != backend);
        self.epochs[backend.index()] += 1;
        before - self.entries.len()
    }

    /// Number of resets seen by a backend
    pub fn epoch(&self, backend: Backend) -> u64 {
        self.epochs[backend.index()]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc() -> SurfaceDesc {
        SurfaceDesc::new(87, 1920, 1080)
    }

    #[test]
    fn test_descriptor_carries_metadata() {
        let mut registry = FrameRegistry::new();
        let key = registry.register(
            Backend::OpenGL,
            desc(),
            NativeHandle::CpuMapped {
                ptr: 0x1000,
                stride: 7680,
                len: 7680 * 1080,
            },
        );

        let frame = registry.descriptor(key).unwrap();
        assert_eq!(frame.backend(), Some(Backend::OpenGL));
        assert_eq!(frame.handle_kind, HandleKind::CpuMapped as u32);
        assert_eq!(frame.stride, 7680);
        assert_eq!(frame.size, 7680 * 1080);
        assert_eq!((frame.width, frame.height), (1920, 1080));
        assert_eq!(frame.epoch, 0);
    }

    #[test]
    fn test_invalidate_is_per_backend() {
        let mut registry = FrameRegistry::new();
        let d3d = registry.register(Backend::D3D11, desc(), NativeHandle::Shared(0x40));
        let vk = registry.register(Backend::Vulkan, desc(), NativeHandle::Exported { handle: 3, size: 64 });

        assert_eq!(registry.invalidate(Backend::D3D11), 1);
        assert!(!registry.is_live(d3d));
        assert!(registry.is_live(vk));
        assert_eq!(registry.epoch(Backend::D3D11), 1);
        assert_eq!(registry.epoch(Backend::Vulkan), 0);
    }

    #[test]
    fn test_keys_are_not_reused_after_invalidate() {
        let mut registry = FrameRegistry::new();
        let old = registry.register(Backend::D3D9, desc(), NativeHandle::Resource(0x10));
        registry.invalidate(Backend::D3D9);

        let new = registry.register(Backend::D3D9, desc(), NativeHandle::Resource(0x10));
        assert_ne!(old, new);
        assert!(registry.descriptor(old).is_none());
        assert_eq!(registry.descriptor(new).unwrap().epoch, 1);
    }

    #[test]
    fn test_release() {
        let mut registry = FrameRegistry::new();
        let key = registry.register(Backend::D3D12, desc(), NativeHandle::Resource(0x20));
        assert!(registry.release(key));
        assert!(!registry.release(key));
        assert!(registry.is_empty());
    }
}
