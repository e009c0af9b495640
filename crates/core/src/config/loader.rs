//! Config path resolution
//!
//! The hook lives inside someone else's process, so it only ever reads: the
//! config file is optional and never created.

use std::path::PathBuf;

use super::{ConfigError, ConfigResult};

/// Environment variable overriding the config path
pub const CONFIG_ENV: &str = "GCAP_CONFIG";

/// File name looked up next to the host executable
pub const CONFIG_FILE_NAME: &str = "gcap-hook.toml";

/// Directory of the host executable
pub fn host_exe_dir() -> ConfigResult<PathBuf> {
    let exe = std::env::current_exe().map_err(ConfigError::IoError)?;
    exe.parent()
        .map(PathBuf::from)
        .ok_or(ConfigError::NoConfigDirectory)
}

/// Returns the config file path.
///
/// `$GCAP_CONFIG` if set, else `gcap-hook.toml` next to the host executable.
pub fn config_path() -> ConfigResult<PathBuf> {
    match std::env::var_os(CONFIG_ENV) {
        Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
        _ => Ok(host_exe_dir()?.join(CONFIG_FILE_NAME)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_path_file_name() {
        if std::env::var_os(CONFIG_ENV).is_some() {
            return;
        }
        let path = config_path().unwrap();
        assert!(path.ends_with(CONFIG_FILE_NAME));
    }
}
