//! Host module resolution
//!
//! The hook never loads modules itself: it only looks for modules the host
//! process already has mapped, and resolves exports from them by name.

use std::ffi::{c_void, CStr};
use std::ptr::NonNull;

use crate::error::AttachError;

/// Handle of a module already loaded in this process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleHandle(NonNull<c_void>);

// SAFETY: a module handle is an address identifying a mapped image; it is
// valid process-wide and never dereferenced by us.
unsafe impl Send for ModuleHandle {}
unsafe impl Sync for ModuleHandle {}

impl ModuleHandle {
    /// Wrap a raw module handle, rejecting null
    pub fn from_raw(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    /// Get the raw handle
    pub fn as_ptr(&self) -> *mut c_void {
        self.0.as_ptr()
    }
}

/// Capability to find loaded modules and their exports
///
/// The system implementation wraps the platform loader; tests substitute a
/// scripted resolver.
pub trait ModuleResolver: Send + Sync {
    /// Find a module that is already loaded. Must never load it.
    fn find_module(&self, name: &CStr) -> Option<ModuleHandle>;

    /// Resolve an exported symbol
    ///
    /// # Safety
    /// `module` must have been returned by [`ModuleResolver::find_module`] on
    /// this resolver and the module must still be loaded.
    unsafe fn find_symbol(&self, module: ModuleHandle, symbol: &CStr) -> Option<NonNull<c_void>>;
}

/// Platform loader backed resolver
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[cfg(unix)]
impl ModuleResolver for SystemResolver {
    fn find_module(&self, name: &CStr) -> Option<ModuleHandle> {
        // RTLD_NOLOAD only succeeds for modules that are already mapped. The
        // reference it takes is kept for the life of the process.
        let handle = unsafe { libc::dlopen(name.as_ptr(), libc::RTLD_NOW | libc::RTLD_NOLOAD) };
        ModuleHandle::from_raw(handle)
    }

    unsafe fn find_symbol(&self, module: ModuleHandle, symbol: &CStr) -> Option<NonNull<c_void>> {
        NonNull::new(libc::dlsym(module.as_ptr(), symbol.as_ptr()))
    }
}

#[cfg(windows)]
mod win32 {
    use std::ffi::{c_char, c_void};

    #[link(name = "kernel32")]
    extern "system" {
        pub fn GetModuleHandleW(name: *const u16) -> *mut c_void;
        pub fn GetProcAddress(module: *mut c_void, name: *const c_char) -> *mut c_void;
    }
}

#[cfg(windows)]
impl ModuleResolver for SystemResolver {
    fn find_module(&self, name: &CStr) -> Option<ModuleHandle> {
        let wide: Vec<u16> = name
            .to_string_lossy()
            .encode_utf16()
            .chain(std::iter::once(0))
            .collect();
        // GetModuleHandleW does not add a reference and never loads
        let handle = unsafe { win32::GetModuleHandleW(wide.as_ptr()) };
        ModuleHandle::from_raw(handle)
    }

    unsafe fn find_symbol(&self, module: ModuleHandle, symbol: &CStr) -> Option<NonNull<c_void>> {
        NonNull::new(win32::GetProcAddress(module.as_ptr(), symbol.as_ptr()))
    }
}

/// A located host module with typed export lookup
pub struct HostModule<'r> {
    resolver: &'r dyn ModuleResolver,
    handle: ModuleHandle,
    name: &'r str,
}

impl<'r> HostModule<'r> {
    /// Wrap a located module
    pub fn new(resolver: &'r dyn ModuleResolver, handle: ModuleHandle, name: &'r str) -> Self {
        Self {
            resolver,
            handle,
            name,
        }
    }

    /// Module handle
    pub fn handle(&self) -> ModuleHandle {
        self.handle
    }

    /// Module name as configured
    pub fn name(&self) -> &str {
        self.name
    }

    /// Get an export by null-terminated name, as a function pointer type `F`
    ///
    /// # Safety
    /// `F` must be a function pointer type matching the export's real signature.
    pub unsafe fn get<F: Copy>(&self, symbol: &[u8]) -> Result<F, AttachError> {
        let symbol_str = CStr::from_bytes_with_nul(symbol).map_err(|_| {
            AttachError::InvalidSymbolName(String::from_utf8_lossy(symbol).into_owned())
        })?;

        debug_assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<*mut c_void>());

        match self.resolver.find_symbol(self.handle, symbol_str) {
            Some(ptr) => Ok(std::mem::transmute_copy::<*mut c_void, F>(&ptr.as_ptr())),
            None => Err(AttachError::MissingSymbol(format!(
                "{} from {}",
                symbol_str.to_string_lossy(),
                self.name
            ))),
        }
    }

    /// Try to get an export, returning None on failure instead of error
    ///
    /// # Safety
    /// Same as `get`
    pub unsafe fn try_get<F: Copy>(&self, symbol: &[u8]) -> Option<F> {
        self.get(symbol).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OneSymbol;

    extern "C" fn exported() -> i32 {
        7
    }

    impl ModuleResolver for OneSymbol {
        fn find_module(&self, _name: &CStr) -> Option<ModuleHandle> {
            ModuleHandle::from_raw(0x1000 as *mut c_void)
        }

        unsafe fn find_symbol(&self, _module: ModuleHandle, symbol: &CStr) -> Option<NonNull<c_void>> {
            if symbol.to_bytes() == b"exported" {
                NonNull::new(exported as *const () as *mut c_void)
            } else {
                None
            }
        }
    }

    #[test]
    fn test_typed_lookup() {
        let resolver = OneSymbol;
        let handle = resolver.find_module(c"host").unwrap();
        let module = HostModule::new(&resolver, handle, "host");

        let f: extern "C" fn() -> i32 = unsafe { module.get(b"exported\0").unwrap() };
        assert_eq!(f(), 7);
    }

    #[test]
    fn test_missing_and_invalid_symbols() {
        let resolver = OneSymbol;
        let handle = resolver.find_module(c"host").unwrap();
        let module = HostModule::new(&resolver, handle, "host");

        let missing = unsafe { module.get::<extern "C" fn() -> i32>(b"absent\0") };
        assert!(matches!(missing, Err(AttachError::MissingSymbol(_))));

        let invalid = unsafe { module.get::<extern "C" fn() -> i32>(b"no-terminator") };
        assert!(matches!(invalid, Err(AttachError::InvalidSymbolName(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_system_resolver_does_not_load() {
        let resolver = SystemResolver;
        assert!(resolver.find_module(c"libgcap-definitely-not-loaded.so").is_none());
    }
}
