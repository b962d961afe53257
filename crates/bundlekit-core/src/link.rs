//! Bundle link parsing
//!
//! Links name a bundle by key and optionally a path inside it:
//! `bundle://<hex-key>/<path>`, `bundle:<hex-key>/<path>` or a bare key.

use url::Url;

use crate::bundler::LINK_SCHEME;
use crate::types::BundleKey;
use crate::{BundleError, BundleResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleLink {
    /// `None` when the link does not carry a decodable key
    pub key: Option<BundleKey>,
    /// Path after the key, without the leading slash
    pub data: Option<String>,
}

impl BundleLink {
    pub fn parse(link: &str) -> BundleResult<Self> {
        let link = link.trim();
        if link.is_empty() {
            return Err(BundleError::malformed("No link specified"));
        }

        let prefix = format!("{}:", LINK_SCHEME);
        let normalized = if link.starts_with(&prefix) {
            link.to_string()
        } else {
            format!("{}://{}", LINK_SCHEME, link)
        };

        let url = match Url::parse(&normalized) {
            Ok(url) => url,
            Err(_) => {
                return Ok(Self {
                    key: None,
                    data: None,
                })
            }
        };

        // Without a host the key is the first path segment
        let path = url.path();
        let (raw_key, rest) = match url.host_str().filter(|host| !host.is_empty()) {
            Some(host) => (host, path.strip_prefix('/').unwrap_or(path)),
            None => {
                let path = path.strip_prefix('/').unwrap_or(path);
                match path.split_once('/') {
                    Some((key, rest)) => (key, rest),
                    None => (path, ""),
                }
            }
        };

        let data = if rest.is_empty() {
            None
        } else {
            Some(rest.to_string())
        };

        Ok(Self {
            key: raw_key.parse().ok(),
            data,
        })
    }

    /// Canonical `bundle://` form
    pub fn to_url(&self) -> Option<String> {
        let key = self.key?;
        Some(match &self.data {
            Some(data) => format!("{}://{}/{}", LINK_SCHEME, key, data),
            None => format!("{}://{}", LINK_SCHEME, key),
        })
    }
}
