//! Attach to the host capture-consumer module
//!
//! The installer owns the cached host module handle. Attach is a poll: while
//! the host module is not mapped yet it returns [`AttachError::HostNotLoaded`]
//! without touching anything, and once the module appears it binds every
//! slot of the dispatch table through the host's setter exports.

use std::ffi::CString;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use gcap_sdk::symbols::{self, SetCallbacksFn};
use gcap_sdk::{Backend, LogFn};

use crate::dispatch::DispatchTable;
use crate::error::AttachError;
use crate::loader::{HostModule, ModuleHandle, ModuleResolver};

/// Owner of host module discovery and slot binding
pub struct HookInstaller {
    resolver: Box<dyn ModuleResolver>,
    module_name: String,
    module_cname: CString,
    /// Cached after the first successful lookup
    host: Mutex<Option<ModuleHandle>>,
    attach_count: AtomicU32,
}

impl HookInstaller {
    /// Create an installer for the named host module
    pub fn new(resolver: Box<dyn ModuleResolver>, module_name: &str) -> Result<Self, AttachError> {
        let module_cname = CString::new(module_name)
            .map_err(|_| AttachError::InvalidSymbolName(module_name.to_string()))?;

        Ok(Self {
            resolver,
            module_name: module_name.to_string(),
            module_cname,
            host: Mutex::new(None),
            attach_count: AtomicU32::new(0),
        })
    }

    /// Configured host module name
    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    /// Number of successful attaches so far
    pub fn attach_count(&self) -> u32 {
        self.attach_count.load(Ordering::Relaxed)
    }

    /// Locate the host module, using the cached handle when available
    pub fn locate(&self) -> Result<HostModule<'_>, AttachError> {
        let mut cached = self.host.lock();

        let handle = match *cached {
            Some(handle) => handle,
            None => {
                let handle = self
                    .resolver
                    .find_module(&self.module_cname)
                    .ok_or_else(|| AttachError::HostNotLoaded(self.module_name.clone()))?;
                tracing::info!("Host module '{}' found at {:p}", self.module_name, handle.as_ptr());
                *cached = Some(handle);
                handle
            }
        };

        Ok(HostModule::new(
            self.resolver.as_ref(),
            handle,
            &self.module_name,
        ))
    }

    /// Bind every slot of `table` into the host module
    ///
    /// All setter exports are resolved before any of them is called, so a
    /// failure leaves the host untouched. When the host exports its logger,
    /// it is handed to `install_logger` before the setters run.
    ///
    /// Calling this again after success re-binds the same pairs; the host
    /// overwrites its own slots, so the final host state is unchanged.
    #[tracing::instrument(skip_all, fields(host = %self.module_name))]
    pub fn attach(
        &self,
        table: &DispatchTable,
        install_logger: &dyn Fn(LogFn),
    ) -> Result<HostModule<'_>, AttachError> {
        let host = self.locate()?;

        let mut setters: [Option<SetCallbacksFn>; Backend::COUNT] = [None; Backend::COUNT];
        for slot in table.iter() {
            let symbol = symbols::setter_symbol(slot.backend);
            setters[slot.backend.index()] = Some(unsafe { host.get::<SetCallbacksFn>(symbol)? });
        }

        match unsafe { host.try_get::<LogFn>(symbols::WRITE_LOG) } {
            Some(logger) => install_logger(logger),
            None => tracing::debug!("Host does not export a logger"),
        }

        for slot in table.iter() {
            let Some(setter) = setters[slot.backend.index()] else {
                continue;
            };

            let accepted = unsafe { setter(slot.capture_ptr(), slot.reset_ptr()) };
            if accepted {
                tracing::debug!("Bound {} capture callbacks", slot.backend);
            } else {
                tracing::warn!("Host rejected {} capture callbacks", slot.backend);
            }
        }

        let count = self.attach_count.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!("Attached {} capture slots (attach #{})", table.len(), count);

        Ok(host)
    }

    /// Poll-style attach returning only success
    pub fn try_attach(&self, table: &DispatchTable, install_logger: &dyn Fn(LogFn)) -> bool {
        match self.attach(table, install_logger) {
            Ok(_) => true,
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
}
