//! Capture callback dispatch table
//!
//! Holds at most one (capture, reset) pair per backend. The table is filled
//! once before attach and read-only afterwards.

use std::ffi::c_void;
use std::fmt;

use gcap_sdk::{Backend, CaptureFn, ResetFn};

/// One bound (capture, reset) pair for a backend
#[derive(Clone, Copy)]
pub struct CaptureSlot {
    pub backend: Backend,
    pub capture: CaptureFn,
    pub reset: ResetFn,
}

impl CaptureSlot {
    /// Create a slot
    pub fn new(backend: Backend, capture: CaptureFn, reset: ResetFn) -> Self {
        Self {
            backend,
            capture,
            reset,
        }
    }

    /// Capture pointer in the shape the host setters take
    pub fn capture_ptr(&self) -> *const c_void {
        self.capture as *const c_void
    }

    /// Reset pointer in the shape the host setters take
    pub fn reset_ptr(&self) -> *const c_void {
        self.reset as *const c_void
    }
}

impl fmt::Debug for CaptureSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureSlot")
            .field("backend", &self.backend)
            .field("capture", &self.capture_ptr())
            .field("reset", &self.reset_ptr())
            .finish()
    }
}

/// Backend-agnostic table of capture slots
#[derive(Debug, Default, Clone)]
pub struct DispatchTable {
    slots: [Option<CaptureSlot>; Backend::COUNT],
}

impl DispatchTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a slot, replacing any existing pair for the same backend
    ///
    /// # Returns
    /// The previously bound slot, if any
    pub fn bind(&mut self, slot: CaptureSlot) -> Option<CaptureSlot> {
        self.slots[slot.backend.index()].replace(slot)
    }

    /// Builder-style [`DispatchTable::bind`]
    pub fn with(mut self, slot: CaptureSlot) -> Self {
        self.bind(slot);
        self
    }

    /// Remove the pair for a backend
    pub fn unbind(&mut self, backend: Backend) -> Option<CaptureSlot> {
        self.slots[backend.index()].take()
    }

    /// Get the pair bound for a backend
    pub fn get(&self, backend: Backend) -> Option<&CaptureSlot> {
        self.slots[backend.index()].as_ref()
    }

    /// Iterate bound slots in backend order
    pub fn iter(&self) -> impl Iterator<Item = &CaptureSlot> {
        self.slots.iter().flatten()
    }

    /// Number of bound backends
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Whether nothing is bound
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "C" fn capture_a(_: *mut c_void, _: *mut c_void, _: *mut c_void) -> bool {
        true
    }

    unsafe extern "C" fn capture_b(_: *mut c_void, _: *mut c_void, _: *mut c_void) -> bool {
        false
    }

    unsafe extern "C" fn reset(_: *mut c_void) -> bool {
        true
    }

    #[test]
    fn test_rebind_replaces() {
        let mut table = DispatchTable::new();
        assert!(table.bind(CaptureSlot::new(Backend::D3D11, capture_a, reset)).is_none());

        let previous = table.bind(CaptureSlot::new(Backend::D3D11, capture_b, reset));
        assert_eq!(previous.unwrap().capture_ptr(), capture_a as *const c_void);

        assert_eq!(table.len(), 1);
        assert_eq!(
            table.get(Backend::D3D11).unwrap().capture_ptr(),
            capture_b as *const c_void
        );
    }

    #[test]
    fn test_iteration_order() {
        let table = DispatchTable::new()
            .with(CaptureSlot::new(Backend::Vulkan, capture_a, reset))
            .with(CaptureSlot::new(Backend::D3D9, capture_a, reset));

        let order: Vec<Backend> = table.iter().map(|s| s.backend).collect();
        assert_eq!(order, vec![Backend::D3D9, Backend::Vulkan]);
    }

    #[test]
    fn test_unbind() {
        let mut table = DispatchTable::new().with(CaptureSlot::new(Backend::OpenGL, capture_a, reset));
        assert!(table.unbind(Backend::OpenGL).is_some());
        assert!(table.is_empty());
        assert!(table.get(Backend::OpenGL).is_none());
    }
}
