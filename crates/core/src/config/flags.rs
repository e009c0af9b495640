//! Boolean feature-flag overrides

/// Prefix of flag environment variables
pub const FLAG_ENV_PREFIX: &str = "GCAP_FLAG_";

/// Source of boolean overrides
pub trait FeatureFlags: Send + Sync {
    /// Look up a flag. None means "not set, use the configured value".
    fn flag(&self, name: &str) -> Option<bool>;
}

/// Flags read from `GCAP_FLAG_<NAME>` environment variables
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvFeatureFlags;

impl FeatureFlags for EnvFeatureFlags {
    fn flag(&self, name: &str) -> Option<bool> {
        let var = format!("{}{}", FLAG_ENV_PREFIX, name.to_ascii_uppercase());
        std::env::var(&var).ok().and_then(|value| parse_flag(&value))
    }
}

/// No overrides at all
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFeatureFlags;

impl FeatureFlags for NoFeatureFlags {
    fn flag(&self, _name: &str) -> Option<bool> {
        None
    }
}

/// Parse a flag value (`1/true/on/yes`, `0/false/off/no`)
pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("1"), Some(true));
        assert_eq!(parse_flag(" On "), Some(true));
        assert_eq!(parse_flag("FALSE"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
        assert_eq!(parse_flag(""), None);
    }

    #[test]
    fn test_env_flags() {
        std::env::set_var("GCAP_FLAG_TEST_ENV_FLAGS_LOOKUP", "off");
        assert_eq!(EnvFeatureFlags.flag("test_env_flags_lookup"), Some(false));
        assert_eq!(EnvFeatureFlags.flag("test_env_flags_unset"), None);
        std::env::remove_var("GCAP_FLAG_TEST_ENV_FLAGS_LOOKUP");
    }
}
