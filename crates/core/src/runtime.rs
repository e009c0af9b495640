//! Process runtime
//!
//! One [`HookRuntime`] per process, built on first use by whichever side
//! arrives first: the host's attach poll or the Vulkan loader. Every
//! component hangs off it and is reached by reference.

use std::ffi::c_void;
use std::sync::{Arc, OnceLock};

use ash::vk;
use ash::vk::Handle;

use gcap_engine::{AttachError, DispatchTable, HookInstaller, ModuleResolver, SystemResolver};
use gcap_sdk::{Backend, LogFn};

use crate::backends::{D3d11Reader, D3d12Reader, D3d9Reader, GlReader, SurfaceCapture};
use crate::config::{EnvFeatureFlags, FeatureFlags, HookConfig};
use crate::forwarder::{CaptureForwarder, HostSink};
use crate::vulkan::VulkanTracker;

static RUNTIME: OnceLock<HookRuntime> = OnceLock::new();

/// The process runtime, built from the environment on first call
pub fn runtime() -> &'static HookRuntime {
    RUNTIME.get_or_init(HookRuntime::from_environment)
}

/// The process runtime, built by `init` if nothing has built it yet
pub fn init_runtime(init: impl FnOnce() -> HookRuntime) -> &'static HookRuntime {
    RUNTIME.get_or_init(init)
}

/// The process runtime, if something has built it already
pub fn try_runtime() -> Option<&'static HookRuntime> {
    RUNTIME.get()
}

pub struct HookRuntime {
    config: HookConfig,
    forwarder: CaptureForwarder,
    d3d9: SurfaceCapture<D3d9Reader>,
    d3d11: SurfaceCapture<D3d11Reader>,
    d3d12: SurfaceCapture<D3d12Reader>,
    opengl: SurfaceCapture<GlReader>,
    vulkan: VulkanTracker,
    /// None when the configured host module name is unusable
    installer: Option<HookInstaller>,
}

impl HookRuntime {
    #[tracing::instrument(skip_all)]
    pub fn new<R>(config: HookConfig, flags: &dyn FeatureFlags, resolver: R) -> Self
    where
        R: ModuleResolver + Clone + 'static,
    {
        let enabled = |backend: Backend| {
            let on = config.backend_enabled(backend, flags);
            if !on {
                tracing::info!("{} capture disabled", backend);
            }
            on
        };

        let installer = match HookInstaller::new(Box::new(resolver.clone()), &config.host_module) {
            Ok(installer) => Some(installer),
            Err(e) => {
                tracing::error!("Invalid host module name: {}", e);
                None
            }
        };

        Self {
            forwarder: CaptureForwarder::default(),
            d3d9: SurfaceCapture::new(D3d9Reader, enabled(Backend::D3D9)),
            d3d11: SurfaceCapture::new(D3d11Reader, enabled(Backend::D3D11)),
            d3d12: SurfaceCapture::new(D3d12Reader, enabled(Backend::D3D12)),
            opengl: SurfaceCapture::new(GlReader::new(Box::new(resolver)), enabled(Backend::OpenGL)),
            vulkan: VulkanTracker::new(
                enabled(Backend::Vulkan),
                config.vulkan.add_transfer_src_usage,
            ),
            installer,
            config,
        }
    }

    /// Config file, `GCAP_FLAG_*` overrides and the system module resolver
    pub fn from_environment() -> Self {
        let config = HookConfig::load();
        Self::new(config, &EnvFeatureFlags, SystemResolver)
    }

    pub fn config(&self) -> &HookConfig {
        &self.config
    }

    pub fn forwarder(&self) -> &CaptureForwarder {
        &self.forwarder
    }

    pub fn vulkan(&self) -> &VulkanTracker {
        &self.vulkan
    }

    pub fn installer(&self) -> Option<&HookInstaller> {
        self.installer.as_ref()
    }

    pub fn is_enabled(&self, backend: Backend) -> bool {
        match backend {
            Backend::D3D9 => self.d3d9.is_enabled(),
            Backend::D3D11 => self.d3d11.is_enabled(),
            Backend::D3D12 => self.d3d12.is_enabled(),
            Backend::OpenGL => self.opengl.is_enabled(),
            Backend::Vulkan => self.vulkan.is_enabled(),
        }
    }

    /// Bind `table` into the host module
    ///
    /// On success the host's frame and reset notification exports, when it
    /// has them, become the forwarder's sink.
    pub fn try_attach(&self, table: &DispatchTable, install_logger: &dyn Fn(LogFn)) -> Result<(), AttachError> {
        let installer = self
            .installer
            .as_ref()
            .ok_or_else(|| AttachError::InvalidSymbolName(self.config.host_module.clone()))?;

        let host = installer.attach(table, install_logger)?;
        if let Some(sink) = HostSink::from_host(&host) {
            tracing::debug!("Forwarding frames to host notification exports");
            self.forwarder.set_sink(Arc::new(sink));
        }
        Ok(())
    }

    /// Poll-style attach
    ///
    /// # Returns
    /// true once the host is loaded and every setter has been called
    pub fn attach(&self, table: &DispatchTable, install_logger: &dyn Fn(LogFn)) -> bool {
        match self.try_attach(table, install_logger) {
            Ok(()) => true,
            Err(e) if e.is_retryable() => {
                tracing::trace!("Attach not ready: {}", e);
                false
            }
            Err(e) => {
                tracing::warn!("Attach failed: {}", e);
                false
            }
        }
    }

    /// Route a host capture call to its backend
    ///
    /// # Safety
    /// The arguments must be what the host passes for `backend`:
    /// (device, surface), (swap chain, back buffer), (swap chain, queue),
    /// (hdc), or (queue, present info, source image)
    pub unsafe fn capture(&self, backend: Backend, a: *mut c_void, b: *mut c_void, _c: *mut c_void) -> bool {
        match backend {
            Backend::D3D9 => self.d3d9.capture(&self.forwarder, a, b),
            Backend::D3D11 => self.d3d11.capture(&self.forwarder, a, b),
            Backend::D3D12 => self.d3d12.capture(&self.forwarder, a, b),
            Backend::OpenGL => self.opengl.capture(&self.forwarder, a, b),
            Backend::Vulkan => self.vulkan.host_capture(
                vk::Queue::from_raw(a as u64),
                b as *const vk::PresentInfoKHR,
                &self.forwarder,
            ),
        }
    }

    /// Route a host reset call to its backend
    ///
    /// # Safety
    /// For Vulkan, `context` must be null or a live device handle
    pub unsafe fn reset(&self, backend: Backend, context: *mut c_void) -> bool {
        match backend {
            Backend::D3D9 => self.d3d9.reset(&self.forwarder),
            Backend::D3D11 => self.d3d11.reset(&self.forwarder),
            Backend::D3D12 => self.d3d12.reset(&self.forwarder),
            Backend::OpenGL => self.opengl.reset(&self.forwarder),
            Backend::Vulkan => self
                .vulkan
                .reset(vk::Device::from_raw(context as u64), &self.forwarder),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::ffi::CStr;
    use std::ptr::NonNull;

    use gcap_engine::{CaptureSlot, ModuleHandle};

    use crate::config::NoFeatureFlags;
    use crate::frame::{NativeHandle, SurfaceDesc};

    thread_local! {
        static HOST_LOADED: Cell<bool> = const { Cell::new(true) };
        static SETTER_CALLS: Cell<u32> = const { Cell::new(0) };
        static FRAMES_SEEN: Cell<u32> = const { Cell::new(0) };
    }

    unsafe extern "C" fn set_callbacks(_capture: *const c_void, _reset: *const c_void) -> bool {
        SETTER_CALLS.with(|c| c.set(c.get() + 1));
        true
    }

    unsafe extern "C" fn frame_ready(_frame: *const gcap_sdk::FrameDescriptor) {
        FRAMES_SEEN.with(|c| c.set(c.get() + 1));
    }

    unsafe extern "C" fn capture(_a: *mut c_void, _b: *mut c_void, _c: *mut c_void) -> bool {
        false
    }

    unsafe extern "C" fn reset(_context: *mut c_void) -> bool {
        false
    }

    /// Host module exporting every setter plus the frame notification
    #[derive(Clone, Copy)]
    struct FakeHost;

    impl ModuleResolver for FakeHost {
        fn find_module(&self, _name: &CStr) -> Option<ModuleHandle> {
            if HOST_LOADED.with(Cell::get) {
                ModuleHandle::from_raw(0x1000 as *mut c_void)
            } else {
                None
            }
        }

        unsafe fn find_symbol(&self, _module: ModuleHandle, symbol: &CStr) -> Option<NonNull<c_void>> {
            let bytes = symbol.to_bytes();
            let f = if bytes.starts_with(b"set_") {
                set_callbacks as *mut c_void
            } else if bytes == b"capture_frame_ready" {
                frame_ready as *mut c_void
            } else {
                return None;
            };
            NonNull::new(f)
        }
    }

    fn table() -> DispatchTable {
        Backend::ALL
            .iter()
            .fold(DispatchTable::new(), |table, backend| {
                table.with(CaptureSlot::new(*backend, capture, reset))
            })
    }

    #[test]
    fn test_attach_installs_host_sink() {
        HOST_LOADED.with(|h| h.set(true));
        SETTER_CALLS.with(|c| c.set(0));
        FRAMES_SEEN.with(|c| c.set(0));
        let runtime = HookRuntime::new(HookConfig::default(), &NoFeatureFlags, FakeHost);

        assert!(runtime.attach(&table(), &|_| {}));
        assert_eq!(SETTER_CALLS.with(Cell::get), Backend::COUNT as u32);

        let forwarder = runtime.forwarder();
        let key = forwarder.register(
            Backend::D3D11,
            SurfaceDesc::new(28, 64, 64),
            NativeHandle::Shared(0x44),
        );
        assert!(forwarder.on_frame(Backend::D3D11, key));
        assert_eq!(FRAMES_SEEN.with(Cell::get), 1);
    }

    #[test]
    fn test_attach_polls_while_host_absent() {
        HOST_LOADED.with(|h| h.set(false));
        SETTER_CALLS.with(|c| c.set(0));
        let runtime = HookRuntime::new(HookConfig::default(), &NoFeatureFlags, FakeHost);

        assert!(!runtime.attach(&table(), &|_| {}));
        assert_eq!(SETTER_CALLS.with(Cell::get), 0);

        HOST_LOADED.with(|h| h.set(true));
        assert!(runtime.attach(&table(), &|_| {}));
    }

    #[test]
    fn test_invalid_host_module_never_attaches() {
        let config = HookConfig {
            host_module: "bad\0name".to_string(),
            ..Default::default()
        };
        let runtime = HookRuntime::new(config, &NoFeatureFlags, FakeHost);
        assert!(runtime.installer().is_none());
        assert!(!runtime.attach(&table(), &|_| {}));
        assert!(matches!(
            runtime.try_attach(&table(), &|_| {}),
            Err(AttachError::InvalidSymbolName(_))
        ));
    }

    #[test]
    fn test_disabled_backends_from_config() {
        let mut config = HookConfig::default();
        config.backends.d3d9 = false;
        config.backends.vulkan = false;
        let runtime = HookRuntime::new(config, &NoFeatureFlags, FakeHost);

        assert!(!runtime.is_enabled(Backend::D3D9));
        assert!(!runtime.is_enabled(Backend::Vulkan));
        assert!(runtime.is_enabled(Backend::D3D11));

        let device = 0x10 as *mut c_void;
        assert!(!unsafe { runtime.capture(Backend::D3D9, device, device, std::ptr::null_mut()) });
    }

    #[test]
    fn test_null_arguments_do_not_capture() {
        let runtime = HookRuntime::new(HookConfig::default(), &NoFeatureFlags, FakeHost);
        let null = std::ptr::null_mut();

        for backend in [Backend::D3D9, Backend::D3D11, Backend::D3D12, Backend::Vulkan] {
            assert!(!unsafe { runtime.capture(backend, null, null, null) });
        }
        assert!(!unsafe { runtime.reset(Backend::Vulkan, null) });
    }

    #[test]
    fn test_surface_reset_notifies() {
        let runtime = HookRuntime::new(HookConfig::default(), &NoFeatureFlags, FakeHost);
        let before = runtime.forwarder().epoch(Backend::D3D12);
        assert!(unsafe { runtime.reset(Backend::D3D12, std::ptr::null_mut()) });
        assert_eq!(runtime.forwarder().epoch(Backend::D3D12), before + 1);
    }
}
