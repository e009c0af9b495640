//! Capture skip reasons
//!
//! A skip never reaches the host as a failure. The boundary functions turn it
//! into `false` ("no frame this present") and log it.

use std::mem;

use ash::vk;
use parking_lot::Mutex;

use gcap_sdk::Backend;

/// Why a present did not yield a frame
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureSkip {
    /// A required pointer argument was null
    #[error("Null argument: {0}")]
    NullArgument(&'static str),

    /// Backend disabled by configuration or feature flag
    #[error("Backend disabled")]
    Disabled,

    /// The surface cannot be captured this way
    #[error("Unsupported: {0}")]
    Unsupported(&'static str),

    /// A native API call returned a failure code
    #[error("{call} failed with {code:#x}")]
    NativeCall { call: &'static str, code: i32 },

    /// Zero width or height
    #[error("Surface has zero extent")]
    EmptySurface,

    /// The previous copy has not completed yet
    #[error("Previous copy still in flight")]
    Busy,

    /// The device exposes no graphics-capable queue family
    #[error("Device has no graphics queue")]
    NoGraphicsQueue,

    /// External memory export is not available for this device or image
    #[error("External memory export unavailable")]
    ExportUnavailable,

    #[error("Unknown device")]
    UnknownDevice,

    #[error("Unknown swapchain")]
    UnknownSwapchain,

    /// A Vulkan call failed
    #[error("Vulkan call failed: {0}")]
    Vulkan(vk::Result),
}

impl CaptureSkip {
    /// Whether this skip disables capture for the device permanently
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            CaptureSkip::NoGraphicsQueue | CaptureSkip::ExportUnavailable | CaptureSkip::Disabled
        )
    }
}

impl From<vk::Result> for CaptureSkip {
    fn from(result: vk::Result) -> Self {
        CaptureSkip::Vulkan(result)
    }
}

/// Result type for capture internals
pub type CaptureResult<T> = Result<T, CaptureSkip>;

/// Logs skip causes on transition only
///
/// Capture runs every present, so the same skip reason would otherwise be
/// logged at frame rate.
#[derive(Debug, Default)]
pub struct SkipLog {
    last: Mutex<Option<CaptureSkip>>,
}

impl SkipLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a skip. Returns true if it was logged.
    pub fn record(&self, backend: Backend, skip: &CaptureSkip) -> bool {
        let mut last = self.last.lock();
        let changed = last
            .as_ref()
            .map_or(true, |prev| mem::discriminant(prev) != mem::discriminant(skip));

        if changed {
            tracing::debug!("{} capture skipped: {}", backend, skip);
            *last = Some(skip.clone());
        } else {
            tracing::trace!("{} capture skipped: {}", backend, skip);
        }
        changed
    }

    /// Record a successful capture, re-arming the log
    pub fn clear(&self) {
        let mut last = self.last.lock();
        if last.take().is_some() {
            tracing::debug!("Capture resumed");
        }
    }
}
