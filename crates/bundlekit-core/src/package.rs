//! Package descriptor
//!
//! The `package.json`-style manifest shipped alongside a bundle. Only the
//! fields the manager reads are typed; everything else is kept verbatim.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::BundleResult;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Entry module
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl PackageDescriptor {
    /// Parse a descriptor; malformed JSON is a hard error
    pub fn parse(bytes: &[u8]) -> BundleResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BundleError;

    #[test]
    fn test_parse_keeps_unknown_fields() {
        let pkg = PackageDescriptor::parse(
            br#"{"name":"app","main":"app.js","pear":{"gui":true}}"#,
        )
        .unwrap();
        assert_eq!(pkg.name.as_deref(), Some("app"));
        assert_eq!(pkg.main.as_deref(), Some("app.js"));
        assert!(pkg.version.is_none());
        assert_eq!(pkg.extra["pear"]["gui"], serde_json::Value::Bool(true));
    }

    #[test]
    fn test_corrupt_descriptor_is_malformed_input() {
        let err = PackageDescriptor::parse(b"{\"name\": ").unwrap_err();
        assert!(matches!(err, BundleError::MalformedInput { .. }));
    }
}
