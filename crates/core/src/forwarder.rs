//! Capture event forwarder
//!
//! The single point where backends report frames and resets. Nothing above
//! this layer knows which backend produced an event.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use gcap_engine::HostModule;
use gcap_sdk::symbols::{self, FrameReadyFn, ResetNotifyFn};
use gcap_sdk::{Backend, FrameDescriptor};

use crate::frame::{FrameKey, FrameRegistry, NativeHandle, SurfaceDesc};

/// Consumer of forwarded events
///
/// Called inline on the host's render thread, so implementations must not
/// block.
pub trait FrameSink: Send + Sync {
    fn on_frame(&self, frame: &FrameDescriptor);
    fn on_reset(&self, backend: Backend);
}

/// Sink that only traces events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl FrameSink for TracingSink {
    fn on_frame(&self, frame: &FrameDescriptor) {
        tracing::trace!(
            "Frame backend={} {}x{} format={} handle={:#x}",
            frame.backend,
            frame.width,
            frame.height,
            frame.format,
            frame.handle
        );
    }

    fn on_reset(&self, backend: Backend) {
        tracing::trace!("Reset {}", backend);
    }
}

/// Sink calling the optional notification exports of the host module
pub struct HostSink {
    frame_ready: Option<FrameReadyFn>,
    reset_notify: Option<ResetNotifyFn>,
}

impl HostSink {
    /// Resolve the host's notification exports
    ///
    /// # Returns
    /// None when the host exports neither
    pub fn from_host(host: &HostModule<'_>) -> Option<Self> {
        // SAFETY: both signatures are fixed by the host module contract
        let frame_ready = unsafe { host.try_get::<FrameReadyFn>(symbols::CAPTURE_FRAME_READY) };
        let reset_notify = unsafe { host.try_get::<ResetNotifyFn>(symbols::CAPTURE_RESET_NOTIFY) };

        if frame_ready.is_none() && reset_notify.is_none() {
            return None;
        }

        Some(Self {
            frame_ready,
            reset_notify,
        })
    }
}

impl FrameSink for HostSink {
    fn on_frame(&self, frame: &FrameDescriptor) {
        if let Some(notify) = self.frame_ready {
            unsafe { notify(frame) };
        }
    }

    fn on_reset(&self, backend: Backend) {
        if let Some(notify) = self.reset_notify {
            unsafe { notify(backend as u32) };
        }
    }
}

/// Relays frame and reset events to the bound sink
pub struct CaptureForwarder {
    sink: RwLock<Arc<dyn FrameSink>>,
    registry: Mutex<FrameRegistry>,
}

impl Default for CaptureForwarder {
    fn default() -> Self {
        Self::new(Arc::new(TracingSink))
    }
}

impl CaptureForwarder {
    pub fn new(sink: Arc<dyn FrameSink>) -> Self {
        Self {
            sink: RwLock::new(sink),
            registry: Mutex::new(FrameRegistry::new()),
        }
    }

    /// Replace the sink
    pub fn set_sink(&self, sink: Arc<dyn FrameSink>) {
        *self.sink.write() = sink;
    }

    /// Register a backend resource, returning its frame key
    pub fn register(&self, backend: Backend, desc: SurfaceDesc, handle: NativeHandle) -> FrameKey {
        let key = self.registry.lock().register(backend, desc, handle);
        tracing::debug!(
            "Registered {} frame {}x{} format={} as {:?}",
            backend,
            desc.width,
            desc.height,
            desc.format,
            handle.kind()
        );
        key
    }

    /// Forward a frame
    ///
    /// # Returns
    /// false if the key is dead or belongs to another backend
    pub fn on_frame(&self, backend: Backend, key: FrameKey) -> bool {
        let frame = {
            let registry = self.registry.lock();
            match registry.descriptor(key) {
                Some(frame) if frame.backend == backend as u32 => frame,
                _ => return false,
            }
        };

        let sink = self.sink.read().clone();
        sink.on_frame(&frame);
        true
    }

    /// Invalidate every frame of a backend, then notify the sink
    pub fn on_reset(&self, backend: Backend) {
        let dropped = self.registry.lock().invalidate(backend);
        tracing::debug!("{} reset, {} frame handles invalidated", backend, dropped);

        let sink = self.sink.read().clone();
        sink.on_reset(backend);
    }

    /// Drop one resource, e.g. a destroyed swapchain's target
    pub fn release(&self, key: FrameKey) -> bool {
        self.registry.lock().release(key)
    }

    pub fn is_live(&self, key: FrameKey) -> bool {
        self.registry.lock().is_live(key)
    }

    /// Wire descriptor of a live key
    pub fn descriptor(&self, key: FrameKey) -> Option<FrameDescriptor> {
        self.registry.lock().descriptor(key)
    }

    /// Number of resets seen by a backend
    pub fn epoch(&self, backend: Backend) -> u64 {
        self.registry.lock().epoch(backend)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::recording_forwarder;
    use super::*;

    #[test]
    fn test_frame_then_reset() {
        let (forwarder, sink) = recording_forwarder();
        let key = forwarder.register(
            Backend::D3D11,
            SurfaceDesc::new(28, 800, 600),
            NativeHandle::Shared(0xabc),
        );

        assert!(forwarder.on_frame(Backend::D3D11, key));
        forwarder.on_reset(Backend::D3D11);
        assert!(!forwarder.on_frame(Backend::D3D11, key));

        assert_eq!(sink.frames.lock().len(), 1);
        assert_eq!(sink.frames.lock()[0].handle, 0xabc);
        assert_eq!(*sink.resets.lock(), vec![Backend::D3D11]);
    }

    #[test]
    fn test_key_of_other_backend_is_rejected() {
        let (forwarder, sink) = recording_forwarder();
        let key = forwarder.register(
            Backend::D3D9,
            SurfaceDesc::new(21, 640, 480),
            NativeHandle::Resource(0x1),
        );

        assert!(!forwarder.on_frame(Backend::D3D12, key));
        assert!(sink.frames.lock().is_empty());
    }

    #[test]
    fn test_set_sink() {
        let (forwarder, first) = recording_forwarder();
        let (_, second) = recording_forwarder();
        forwarder.set_sink(second.clone());

        forwarder.on_reset(Backend::OpenGL);
        assert!(first.resets.lock().is_empty());
        assert_eq!(second.resets.lock().len(), 1);
    }
}
