//! Surface capture backends (D3D9, D3D10/11, D3D12, OpenGL)
//!
//! Each backend is a [`SurfaceReader`] that knows how to describe the host's
//! current back buffer and turn it into a shareable handle. The common
//! [`SurfaceCapture`] engine owns the per-backend cache and the reset rules,
//! so the readers stay free of state handling.

pub(crate) mod com;
pub mod d3d11;
pub mod d3d12;
pub mod d3d9;
pub mod opengl;

use std::collections::HashMap;
use std::ffi::c_void;

use parking_lot::Mutex;

use gcap_sdk::Backend;

use crate::error::{CaptureResult, CaptureSkip, SkipLog};
use crate::forwarder::CaptureForwarder;
use crate::frame::{FrameKey, NativeHandle, SurfaceDesc};

pub use d3d11::D3d11Reader;
pub use d3d12::D3d12Reader;
pub use d3d9::D3d9Reader;
pub use opengl::{GlFunctions, GlReader};

/// What a reader sees on the current present
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceFrame {
    pub desc: SurfaceDesc,
    /// Identity of the presented resource (back buffer pointer or index)
    pub resource: u64,
}

/// Backend-specific access to the presented surface
///
/// `source` and `target` are the raw arguments of the host's capture call;
/// their meaning is per backend.
pub trait SurfaceReader: Send + Sync {
    const BACKEND: Backend;

    /// Describe the presented surface. Called on every capture.
    ///
    /// # Safety
    /// `source` and `target` must be the live objects the host passed in.
    unsafe fn describe(&self, source: *mut c_void, target: *mut c_void) -> CaptureResult<SurfaceFrame>;

    /// Produce the handle for a resource not seen since the last reset
    ///
    /// # Safety
    /// Same as [`SurfaceReader::describe`]
    unsafe fn share(
        &self,
        source: *mut c_void,
        target: *mut c_void,
        frame: &SurfaceFrame,
    ) -> CaptureResult<NativeHandle>;

    /// Update the contents behind an already shared handle
    ///
    /// # Safety
    /// Same as [`SurfaceReader::describe`]
    unsafe fn refresh(
        &self,
        _source: *mut c_void,
        _target: *mut c_void,
        _frame: &SurfaceFrame,
    ) -> CaptureResult<()> {
        Ok(())
    }

    /// Drop reader-owned resources after a reset
    fn reset(&self) {}
}

/// Cached state for one presenting object
struct SurfaceCache {
    source: usize,
    desc: SurfaceDesc,
    /// Frame key per presented resource
    keys: HashMap<u64, FrameKey>,
}

/// Capture engine shared by the surface backends
pub struct SurfaceCapture<P: SurfaceReader> {
    reader: P,
    enabled: bool,
    cache: Mutex<Option<SurfaceCache>>,
    skips: SkipLog,
}

impl<P: SurfaceReader> SurfaceCapture<P> {
    pub fn new(reader: P, enabled: bool) -> Self {
        Self {
            reader,
            enabled,
            cache: Mutex::new(None),
            skips: SkipLog::new(),
        }
    }

    pub fn backend(&self) -> Backend {
        P::BACKEND
    }

    pub fn reader(&self) -> &P {
        &self.reader
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Capture the presented surface and forward it
    ///
    /// # Safety
    /// `source` and `target` must be the live objects the host passed in.
    pub unsafe fn capture(
        &self,
        forwarder: &CaptureForwarder,
        source: *mut c_void,
        target: *mut c_void,
    ) -> bool {
        match self.try_capture(forwarder, source, target) {
            Ok(_) => {
                self.skips.clear();
                true
            }
            Err(skip) => {
                self.skips.record(P::BACKEND, &skip);
                false
            }
        }
    }

    /// Capture, reporting why nothing was forwarded
    ///
    /// # Safety
    /// Same as [`SurfaceCapture::capture`]
    pub unsafe fn try_capture(
        &self,
        forwarder: &CaptureForwarder,
        source: *mut c_void,
        target: *mut c_void,
    ) -> CaptureResult<FrameKey> {
        if !self.enabled {
            return Err(CaptureSkip::Disabled);
        }
        if source.is_null() {
            return Err(CaptureSkip::NullArgument("source"));
        }

        let frame = self.reader.describe(source, target)?;
        if frame.desc.is_empty() {
            return Err(CaptureSkip::EmptySurface);
        }

        let key = {
            let mut cache = self.cache.lock();

            let stale = cache
                .as_ref()
                .is_some_and(|c| c.source != source as usize || c.desc != frame.desc);
            if stale {
                if let Some(old) = cache.take() {
                    tracing::debug!(
                        "{} surface changed to {}x{}, dropping {} cached frames",
                        P::BACKEND,
                        frame.desc.width,
                        frame.desc.height,
                        old.keys.len()
                    );
                    for key in old.keys.into_values() {
                        forwarder.release(key);
                    }
                }
            }

            let entry = cache.get_or_insert_with(|| SurfaceCache {
                source: source as usize,
                desc: frame.desc,
                keys: HashMap::new(),
            });

            let cached = entry
                .keys
                .get(&frame.resource)
                .copied()
                .filter(|key| forwarder.is_live(*key));

            match cached {
                Some(key) => {
                    self.reader.refresh(source, target, &frame)?;
                    key
                }
                None => {
                    let handle = self.reader.share(source, target, &frame)?;
                    let key = forwarder.register(P::BACKEND, frame.desc, handle);
                    entry.keys.insert(frame.resource, key);
                    key
                }
            }
        };

        forwarder.on_frame(P::BACKEND, key);
        Ok(key)
    }

    /// Invalidate every cached handle of this backend and notify the sink
    pub fn reset(&self, forwarder: &CaptureForwarder) -> bool {
        let dropped = self.cache.lock().take();
        if let Some(cache) = &dropped {
            tracing::debug!("{} reset with {} cached frames", P::BACKEND, cache.keys.len());
        }

        forwarder.on_reset(P::BACKEND);
        self.reader.reset();
        true
    }
}
