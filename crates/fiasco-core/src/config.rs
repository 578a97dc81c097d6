//! Flash configuration.
//!
//! The two process-wide switches of the original tool (simulate and
//! skip-verification) live in an explicit struct handed to constructors and
//! the dispatch layer; nothing reads global state.

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Configuration for a flashing session.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Perform all validation and logging but issue no real write.
    #[serde(default)]
    pub simulate: bool,
    /// Downgrade hash/type/device consistency failures to warnings.
    #[serde(default)]
    pub no_verify: bool,
    /// Block device node used by the raw-disk protocol, when bound.
    pub raw_disk: Option<String>,
    /// Root directory for local flashing (partition nodes by name).
    pub local_root: Option<String>,
    /// Seconds to poll for a USB device before giving up. Zero waits forever.
    #[serde(default)]
    pub wait_timeout_secs: u64,
}

impl FlashConfig {
    /// Load a flash profile from a TOML file.
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FlashConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save this profile to a TOML file.
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.toml");

        let config = FlashConfig {
            simulate: true,
            no_verify: false,
            raw_disk: Some("/dev/sdb".to_string()),
            local_root: None,
            wait_timeout_secs: 30,
        };
        config.save_to_file(&path).unwrap();

        let loaded = FlashConfig::load_from_file(&path).unwrap();
        assert!(loaded.simulate);
        assert!(!loaded.no_verify);
        assert_eq!(loaded.raw_disk.as_deref(), Some("/dev/sdb"));
        assert_eq!(loaded.wait_timeout_secs, 30);
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: FlashConfig = toml::from_str("").unwrap();
        assert!(!config.simulate);
        assert!(!config.no_verify);
        assert_eq!(config.wait_timeout_secs, 0);
    }
}
