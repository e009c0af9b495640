//! gcap hook - C ABI layer
//!
//! This crate is the loaded library itself. It exports the attach poll the
//! host calls, the per-backend capture and reset callbacks bound into the
//! host, and the Vulkan loader's layer negotiation entry.

pub mod ffi;
pub mod logging;

use gcap_core::config::EnvFeatureFlags;
use gcap_engine::SystemResolver;
use gcap_core::{init_runtime, HookConfig, HookRuntime};

/// The process runtime, with host logging set up on first use
pub fn runtime() -> &'static HookRuntime {
    init_runtime(|| {
        let config = HookConfig::load();
        logging::init(&config.log_level);
        tracing::info!(
            "gcap hook {} starting, host module {}",
            env!("CARGO_PKG_VERSION"),
            config.host_module
        );
        HookRuntime::new(config, &EnvFeatureFlags, SystemResolver)
    })
}
