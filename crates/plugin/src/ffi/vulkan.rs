//! Vulkan loader entry
//!
//! The loader finds this symbol through the layer manifest and calls it
//! before anything else in the layer.

use ash::vk;

use gcap_core::vulkan::{negotiate, NegotiateLayerInterface};

use super::guarded;
use crate::runtime;

/// Layer interface negotiation
///
/// # Safety
/// `interface` must be null or point to the loader's negotiation struct
#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "system" fn vkNegotiateLoaderLayerInterfaceVersion(
    interface: *mut NegotiateLayerInterface,
) -> vk::Result {
    guarded(
        "vkNegotiateLoaderLayerInterfaceVersion",
        vk::Result::ERROR_INITIALIZATION_FAILED,
        || {
            if !runtime().vulkan().is_enabled() {
                tracing::info!("Vulkan capture disabled, layer passes through");
            }
            negotiate(interface)
        },
    )
}
