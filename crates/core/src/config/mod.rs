//! Hook configuration
//!
//! A small TOML file, every key optional:
//!
//! ```toml
//! host_module = "owclient"
//! log_level = "debug"
//!
//! [backends]
//! opengl = false
//!
//! [vulkan]
//! add_transfer_src_usage = true
//! ```
//!
//! A missing file means defaults. A malformed file is reported and also means
//! defaults; the hook never refuses to run over its own config.

mod flags;
mod loader;

use std::path::Path;

use serde::{Deserialize, Serialize};

use gcap_sdk::Backend;

pub use flags::{parse_flag, EnvFeatureFlags, FeatureFlags, NoFeatureFlags, FLAG_ENV_PREFIX};
pub use loader::{config_path, host_exe_dir, CONFIG_ENV, CONFIG_FILE_NAME};

/// Configuration system errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse TOML content
    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Could not determine the directory of the host executable
    #[error("Config directory not available - could not resolve host executable path")]
    NoConfigDirectory,
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(windows)]
const DEFAULT_HOST_MODULE: &str = "owclient";
#[cfg(not(windows))]
const DEFAULT_HOST_MODULE: &str = "libowclient.so";

/// Per-backend enable bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendToggles {
    pub d3d9: bool,
    pub d3d11: bool,
    pub d3d12: bool,
    pub opengl: bool,
    pub vulkan: bool,
}

impl Default for BackendToggles {
    fn default() -> Self {
        Self {
            d3d9: true,
            d3d11: true,
            d3d12: true,
            opengl: true,
            vulkan: true,
        }
    }
}

impl BackendToggles {
    pub fn get(&self, backend: Backend) -> bool {
        match backend {
            Backend::D3D9 => self.d3d9,
            Backend::D3D11 => self.d3d11,
            Backend::D3D12 => self.d3d12,
            Backend::OpenGL => self.opengl,
            Backend::Vulkan => self.vulkan,
        }
    }
}

/// Vulkan layer options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VulkanConfig {
    /// Add TRANSFER_SRC to application swapchain usage so images can be copied
    pub add_transfer_src_usage: bool,
}

impl Default for VulkanConfig {
    fn default() -> Self {
        Self {
            add_transfer_src_usage: true,
        }
    }
}

/// Top-level hook configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookConfig {
    /// Name of the capture consumer module to attach to
    pub host_module: String,
    /// Default log filter when `GCAP_LOG` is unset
    pub log_level: String,
    pub backends: BackendToggles,
    pub vulkan: VulkanConfig,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            host_module: DEFAULT_HOST_MODULE.to_string(),
            log_level: "info".to_string(),
            backends: BackendToggles::default(),
            vulkan: VulkanConfig::default(),
        }
    }
}

impl HookConfig {
    /// Parse config from TOML text
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load config from a file. A missing file yields defaults.
    pub fn load_from(path: &Path) -> ConfigResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let config = Self::from_toml_str(&content)?;
                tracing::debug!("Loaded hook config from {:?}", path);
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No hook config at {:?}, using defaults", path);
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Load config from the resolved path, never failing
    pub fn load() -> Self {
        let result = config_path().and_then(|path| Self::load_from(&path));
        result.unwrap_or_else(|e| {
            tracing::warn!("Ignoring hook config: {}", e);
            Self::default()
        })
    }

    /// Whether a backend should capture, after feature-flag overrides
    pub fn backend_enabled(&self, backend: Backend, flags: &dyn FeatureFlags) -> bool {
        flags
            .flag(backend.name())
            .unwrap_or_else(|| self.backends.get(backend))
    }
}
