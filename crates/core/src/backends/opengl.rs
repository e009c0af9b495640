//! OpenGL capture
//!
//! The host calls `capture(hdc)` with the GL context current on the calling
//! thread. There is no shareable GL object, so the back buffer is read into a
//! hook-owned RGBA8 buffer on every capture and handed on as CPU-mapped rows.

use std::ffi::{c_void, CStr};
use std::sync::OnceLock;

use parking_lot::Mutex;

use gcap_engine::{HostModule, ModuleResolver};
use gcap_sdk::gl::{self, GetIntegervFn, PixelStoreiFn, ReadPixelsFn};
use gcap_sdk::Backend;

use super::{SurfaceFrame, SurfaceReader};
use crate::error::{CaptureResult, CaptureSkip};
use crate::frame::{NativeHandle, SurfaceDesc};

#[cfg(windows)]
const GL_MODULE: &CStr = c"opengl32.dll";
#[cfg(not(windows))]
const GL_MODULE: &CStr = c"libGL.so.1";

const BYTES_PER_PIXEL: u32 = 4;

/// The GL 1.1 entry points the read-back needs
#[derive(Clone, Copy)]
pub struct GlFunctions {
    pub get_integerv: GetIntegervFn,
    pub pixel_storei: PixelStoreiFn,
    pub read_pixels: ReadPixelsFn,
}

impl GlFunctions {
    /// Resolve from the already loaded system GL module
    pub fn resolve(resolver: &dyn ModuleResolver) -> Option<Self> {
        let handle = resolver.find_module(GL_MODULE)?;
        let module = HostModule::new(resolver, handle, "gl");

        // SAFETY: GL 1.1 exports with the signatures declared in the SDK
        let functions = unsafe {
            Self {
                get_integerv: module.try_get(b"glGetIntegerv\0")?,
                pixel_storei: module.try_get(b"glPixelStorei\0")?,
                read_pixels: module.try_get(b"glReadPixels\0")?,
            }
        };
        Some(functions)
    }
}

pub struct GlReader {
    resolver: Box<dyn ModuleResolver>,
    functions: OnceLock<Option<GlFunctions>>,
    pixels: Mutex<Vec<u8>>,
}

impl GlReader {
    /// Reader resolving GL lazily through `resolver`
    pub fn new(resolver: Box<dyn ModuleResolver>) -> Self {
        Self {
            resolver,
            functions: OnceLock::new(),
            pixels: Mutex::new(Vec::new()),
        }
    }

    /// Reader with already resolved entry points
    pub fn with_functions(resolver: Box<dyn ModuleResolver>, functions: GlFunctions) -> Self {
        let reader = Self::new(resolver);
        let _ = reader.functions.set(Some(functions));
        reader
    }

    fn functions(&self) -> CaptureResult<GlFunctions> {
        let functions = self.functions.get_or_init(|| {
            let functions = GlFunctions::resolve(self.resolver.as_ref());
            if functions.is_none() {
                tracing::warn!("OpenGL entry points unavailable, GL capture disabled");
            }
            functions
        });
        functions.ok_or(CaptureSkip::Unsupported("GL entry points unavailable"))
    }

    /// Read the current viewport of the calling thread's context
    unsafe fn read_into(&self, functions: &GlFunctions, desc: &SurfaceDesc) -> CaptureResult<NativeHandle> {
        let stride = desc
            .width
            .checked_mul(BYTES_PER_PIXEL)
            .ok_or(CaptureSkip::Unsupported("viewport row stride overflows"))?;
        let len = (stride as usize)
            .checked_mul(desc.height as usize)
            .ok_or(CaptureSkip::Unsupported("viewport size overflows"))?;

        let mut pixels = self.pixels.lock();
        if pixels.len() != len {
            pixels.resize(len, 0);
        }

        (functions.pixel_storei)(gl::PACK_ALIGNMENT, 4);
        (functions.read_pixels)(
            0,
            0,
            desc.width as i32,
            desc.height as i32,
            gl::RGBA,
            gl::UNSIGNED_BYTE,
            pixels.as_mut_ptr().cast(),
        );

        Ok(NativeHandle::CpuMapped {
            ptr: pixels.as_ptr() as u64,
            stride,
            len: len as u64,
        })
    }
}

impl SurfaceReader for GlReader {
    const BACKEND: Backend = Backend::OpenGL;

    unsafe fn describe(&self, _hdc: *mut c_void, _unused: *mut c_void) -> CaptureResult<SurfaceFrame> {
        let functions = self.functions()?;

        let mut viewport = [0i32; 4];
        (functions.get_integerv)(gl::VIEWPORT, viewport.as_mut_ptr());
        let width = u32::try_from(viewport[2]).unwrap_or(0);
        let height = u32::try_from(viewport[3]).unwrap_or(0);

        Ok(SurfaceFrame {
            desc: SurfaceDesc::new(gl::RGBA, width, height),
            resource: 0,
        })
    }

    unsafe fn share(&self, _hdc: *mut c_void, _unused: *mut c_void, frame: &SurfaceFrame) -> CaptureResult<NativeHandle> {
        let functions = self.functions()?;
        self.read_into(&functions, &frame.desc)
    }

    unsafe fn refresh(&self, _hdc: *mut c_void, _unused: *mut c_void, frame: &SurfaceFrame) -> CaptureResult<()> {
        let functions = self.functions()?;
        self.read_into(&functions, &frame.desc).map(|_| ())
    }

    fn reset(&self) {
        let mut pixels = self.pixels.lock();
        pixels.clear();
        pixels.shrink_to_fit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::ptr::NonNull;

    use gcap_engine::ModuleHandle;

    use crate::backends::SurfaceCapture;
    use crate::forwarder::testing::recording_forwarder;

    thread_local! {
        static VIEWPORT: Cell<(i32, i32)> = const { Cell::new((4, 2)) };
        static READS: Cell<u32> = const { Cell::new(0) };
    }

    unsafe extern "system" fn get_integerv(pname: u32, data: *mut i32) {
        if pname == gl::VIEWPORT {
            let (w, h) = VIEWPORT.with(Cell::get);
            *data = 0;
            *data.add(1) = 0;
            *data.add(2) = w;
            *data.add(3) = h;
        }
    }

    unsafe extern "system" fn pixel_storei(_pname: u32, _param: i32) {}

    unsafe extern "system" fn read_pixels(
        _x: i32,
        _y: i32,
        width: i32,
        height: i32,
        _format: u32,
        _kind: u32,
        pixels: *mut c_void,
    ) {
        let n = READS.with(|r| {
            r.set(r.get() + 1);
            r.get()
        });
        std::ptr::write_bytes(pixels.cast::<u8>(), n as u8, (width * height * 4) as usize);
    }

    struct NoModules;

    impl ModuleResolver for NoModules {
        fn find_module(&self, _name: &CStr) -> Option<ModuleHandle> {
            None
        }

        unsafe fn find_symbol(&self, _module: ModuleHandle, _symbol: &CStr) -> Option<NonNull<c_void>> {
            None
        }
    }

    fn reader() -> GlReader {
        GlReader::with_functions(
            Box::new(NoModules),
            GlFunctions {
                get_integerv,
                pixel_storei,
                read_pixels,
            },
        )
    }

    fn hdc() -> *mut c_void {
        0x3000 as *mut c_void
    }

    #[test]
    fn test_pixels_are_read_every_capture() {
        VIEWPORT.with(|v| v.set((4, 2)));
        READS.with(|r| r.set(0));
        let (forwarder, sink) = recording_forwarder();
        let capture = SurfaceCapture::new(reader(), true);

        assert!(unsafe { capture.capture(&forwarder, hdc(), std::ptr::null_mut()) });
        assert!(unsafe { capture.capture(&forwarder, hdc(), std::ptr::null_mut()) });
        assert_eq!(READS.with(Cell::get), 2);

        let frames = sink.frames.lock();
        assert_eq!(frames[0].stride, 16);
        assert_eq!(frames[0].size, 32);
        assert_eq!(frames[0].handle, frames[1].handle);

        let rows = unsafe { std::slice::from_raw_parts(frames[1].handle as *const u8, 32) };
        assert!(rows.iter().all(|b| *b == 2));
    }

    #[test]
    fn test_empty_viewport_is_skipped() {
        VIEWPORT.with(|v| v.set((0, 0)));
        let (forwarder, _sink) = recording_forwarder();
        let capture = SurfaceCapture::new(reader(), true);

        let result = unsafe { capture.try_capture(&forwarder, hdc(), std::ptr::null_mut()) };
        assert_eq!(result, Err(CaptureSkip::EmptySurface));
    }

    #[test]
    fn test_oversized_viewport_is_skipped() {
        VIEWPORT.with(|v| v.set((i32::MAX, 1)));
        READS.with(|r| r.set(0));
        let (forwarder, sink) = recording_forwarder();
        let capture = SurfaceCapture::new(reader(), true);

        let result = unsafe { capture.try_capture(&forwarder, hdc(), std::ptr::null_mut()) };
        assert_eq!(result, Err(CaptureSkip::Unsupported("viewport row stride overflows")));
        assert_eq!(READS.with(Cell::get), 0);
        assert!(sink.frames.lock().is_empty());
        assert!(capture.reader().pixels.lock().is_empty());
    }

    #[test]
    fn test_missing_gl_module() {
        let (forwarder, _sink) = recording_forwarder();
        let capture = SurfaceCapture::new(GlReader::new(Box::new(NoModules)), true);

        let result = unsafe { capture.try_capture(&forwarder, hdc(), std::ptr::null_mut()) };
        assert!(matches!(result, Err(CaptureSkip::Unsupported(_))));
    }

    #[test]
    fn test_reset_frees_buffer() {
        VIEWPORT.with(|v| v.set((4, 2)));
        let (forwarder, _sink) = recording_forwarder();
        let capture = SurfaceCapture::new(reader(), true);

        assert!(unsafe { capture.capture(&forwarder, hdc(), std::ptr::null_mut()) });
        capture.reset(&forwarder);
        assert!(capture.reader().pixels.lock().is_empty());
    }
}
