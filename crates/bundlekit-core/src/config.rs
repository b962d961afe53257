//! Bundle configuration
//!
//! Construction options for a bundle manager. Collaborators (store, logger,
//! hooks) are supplied separately through the runtime builder; everything here
//! is plain data that can be loaded from TOML.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::types::{BundleKey, Checkout};
use crate::{BundleError, BundleResult};

/// Entrypoint handed to the bundler when neither config nor package names one
pub const DEFAULT_ENTRYPOINT: &str = ".";

// ----------------------------------------------------------------------------
// Bundle Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleConfig {
    /// Store identity; `None` for purely local stores
    pub key: Option<BundleKey>,
    /// Distribution channel to record on writable stores
    pub channel: Option<String>,
    /// Which version reads are served from
    pub checkout: Checkout,
    /// Staging managers always track the mutable head
    pub stage: bool,
    /// Capture a warmup trace from the start
    pub trace: bool,
    /// Watch the store for new versions after ready
    pub watch_updates: bool,
    /// Scratch directory handed to the bundler
    pub swap_dir: PathBuf,
    /// Module the bundler starts from; falls back to the package descriptor
    pub entrypoint: Option<String>,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            key: None,
            channel: None,
            checkout: Checkout::Release,
            stage: false,
            trace: false,
            watch_updates: false,
            swap_dir: std::env::temp_dir().join("bundlekit-swap"),
            entrypoint: None,
        }
    }
}

impl BundleConfig {
    /// Config for a replicated store
    pub fn for_key(key: BundleKey) -> Self {
        Self {
            key: Some(key),
            ..Self::default()
        }
    }

    /// Config for a purely local store tracking its head
    pub fn local() -> Self {
        Self {
            checkout: Checkout::Live,
            ..Self::default()
        }
    }

    /// Config tuned for tests: keyed, live checkout, no update watch
    pub fn testing() -> Self {
        Self {
            key: Some(BundleKey::new([0x42; 32])),
            checkout: Checkout::Live,
            swap_dir: PathBuf::from("/tmp/bundlekit-test"),
            ..Self::default()
        }
    }

    pub fn with_channel<T: Into<String>>(mut self, channel: T) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_checkout(mut self, checkout: Checkout) -> Self {
        self.checkout = checkout;
        self
    }

    /// Parse a TOML document
    pub fn from_toml_str(source: &str) -> BundleResult<Self> {
        let config: Self = toml::from_str(source)
            .map_err(|err| BundleError::config_error(err.to_string()))?;
        config.validate().map_err(BundleError::config_error)?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if let Some(channel) = &self.channel {
            if channel.trim().is_empty() {
                return Err("Channel cannot be empty".into());
            }
        }
        if let Some(entrypoint) = &self.entrypoint {
            if entrypoint.trim().is_empty() {
                return Err("Entrypoint cannot be empty".into());
            }
        }
        if self.stage && self.checkout != Checkout::Release && self.checkout != Checkout::Live {
            return Err("A staging bundle cannot pin a version".into());
        }
        if self.swap_dir.as_os_str().is_empty() {
            return Err("Swap directory cannot be empty".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(BundleConfig::default().validate().is_ok());
        assert!(BundleConfig::testing().validate().is_ok());
        assert!(BundleConfig::local().validate().is_ok());
    }

    #[test]
    fn test_staging_with_pinned_version_is_rejected() {
        let config = BundleConfig {
            stage: true,
            checkout: Checkout::Version(3),
            ..BundleConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml() {
        let key = BundleKey::new([9; 32]);
        let source = format!(
            "key = \"{}\"\nchannel = \"beta\"\ncheckout = 7\ntrace = true\n",
            key
        );
        let config = BundleConfig::from_toml_str(&source).unwrap();
        assert_eq!(config.key, Some(key));
        assert_eq!(config.channel.as_deref(), Some("beta"));
        assert_eq!(config.checkout, Checkout::Version(7));
        assert!(config.trace);
        assert!(!config.stage);
    }

    #[test]
    fn test_from_toml_named_checkout() {
        let config = BundleConfig::from_toml_str("checkout = \"live\"").unwrap();
        assert_eq!(config.checkout, Checkout::Live);
    }

    #[test]
    fn test_from_toml_rejects_bad_values() {
        assert!(BundleConfig::from_toml_str("checkout = \"head\"").is_err());
        assert!(BundleConfig::from_toml_str("channel = \"  \"").is_err());
        assert!(BundleConfig::from_toml_str("key = \"abcd\"").is_err());
    }
}
