//! Core types for bundle management
//!
//! This module defines the identity, version and range types shared by the
//! manager and its collaborators, using newtype patterns for validation and
//! type safety.

use core::fmt;
use core::ops::Deref;
use core::str::FromStr;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::BundleError;

// ----------------------------------------------------------------------------
// Bundle Key
// ----------------------------------------------------------------------------

/// Public identity of a replicated store (32-byte key, hex encoded in text)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BundleKey([u8; 32]);

impl BundleKey {
    /// Create a new key from 32 bytes
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex form, as used in links and update notifications
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Topic under which peers for this key find each other
    pub fn discovery_key(&self) -> DiscoveryKey {
        DiscoveryKey::derive(self)
    }
}

impl fmt::Display for BundleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for BundleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BundleKey({})", self)
    }
}

impl FromStr for BundleKey {
    type Err = BundleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let clean_str = s.trim().strip_prefix("0x").unwrap_or(s.trim());

        let bytes = hex::decode(clean_str)
            .map_err(|_| BundleError::malformed(format!("Invalid hex in bundle key: {}", s)))?;

        let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            BundleError::malformed(format!(
                "Bundle key must be 32 bytes, got {}",
                bytes.len()
            ))
        })?;

        Ok(Self(key))
    }
}

impl TryFrom<String> for BundleKey {
    type Error = BundleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BundleKey> for String {
    fn from(key: BundleKey) -> Self {
        key.to_hex()
    }
}

impl Deref for BundleKey {
    type Target = [u8; 32];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// ----------------------------------------------------------------------------
// Discovery Key
// ----------------------------------------------------------------------------

/// Swarm topic derived from a bundle key; safe to announce publicly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiscoveryKey([u8; 32]);

impl DiscoveryKey {
    const NAMESPACE: &'static [u8] = b"bundlekit/discovery";

    /// Derive the topic for a key
    pub fn derive(key: &BundleKey) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(Self::NAMESPACE);
        hasher.update(key.as_bytes());
        Self(hasher.finalize().into())
    }

    /// Create a discovery key from raw bytes
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for DiscoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

// ----------------------------------------------------------------------------
// Version
// ----------------------------------------------------------------------------

/// Length of the store history at some point; the checkout coordinate
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Version(u64);

impl Version {
    pub const fn new(length: u64) -> Self {
        Self(length)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// The version after one more committed mutation
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(length: u64) -> Self {
        Self(length)
    }
}

// ----------------------------------------------------------------------------
// Checkout Selection
// ----------------------------------------------------------------------------

/// Which version of the store a manager serves reads from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "CheckoutRepr", into = "CheckoutRepr")]
pub enum Checkout {
    /// The version named by the stored release pointer (or the head if unset)
    #[default]
    Release,
    /// An exact version
    Version(u64),
    /// The mutable head
    Live,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum CheckoutRepr {
    Number(u64),
    Name(String),
}

impl TryFrom<CheckoutRepr> for Checkout {
    type Error = BundleError;

    fn try_from(repr: CheckoutRepr) -> Result<Self, Self::Error> {
        match repr {
            CheckoutRepr::Number(version) => Ok(Checkout::Version(version)),
            CheckoutRepr::Name(name) => name.parse(),
        }
    }
}

impl From<Checkout> for CheckoutRepr {
    fn from(checkout: Checkout) -> Self {
        match checkout {
            Checkout::Version(version) => CheckoutRepr::Number(version),
            other => CheckoutRepr::Name(other.to_string()),
        }
    }
}

impl FromStr for Checkout {
    type Err = BundleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "release" => Ok(Checkout::Release),
            "live" => Ok(Checkout::Live),
            other => other
                .parse::<u64>()
                .map(Checkout::Version)
                .map_err(|_| BundleError::malformed(format!("Invalid checkout: {}", s))),
        }
    }
}

impl fmt::Display for Checkout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Checkout::Release => write!(f, "release"),
            Checkout::Version(version) => write!(f, "{}", version),
            Checkout::Live => write!(f, "live"),
        }
    }
}

// ----------------------------------------------------------------------------
// Ranges
// ----------------------------------------------------------------------------

/// Which part of the store a range addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Region {
    /// Index/metadata blocks touched while resolving entries
    Meta,
    /// Blob blocks holding file contents
    Data,
}

/// A half-open block range `[start, end)` touched during a traced run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessRange {
    pub region: Region,
    pub start: u64,
    pub end: u64,
}

impl AccessRange {
    /// Create a range; an inverted range collapses to empty at `start`
    pub fn new(region: Region, start: u64, end: u64) -> Self {
        Self {
            region,
            start,
            end: end.max(start),
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// A download request range; `end: None` means "to the end of the region"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    pub fn open_ended(start: u64) -> Self {
        Self { start, end: None }
    }
}

impl From<&AccessRange> for ByteRange {
    fn from(range: &AccessRange) -> Self {
        ByteRange::new(range.start, range.end)
    }
}

// ----------------------------------------------------------------------------
// Entries
// ----------------------------------------------------------------------------

/// Location of an entry's contents in the blob store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRange {
    pub block_offset: u64,
    pub block_length: u64,
    pub byte_length: u64,
}

/// A resolved key in a store view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub key: String,
    /// Position of the entry's node in the metadata log
    pub seq: u64,
    pub blob: Option<BlobRange>,
    pub metadata: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_key_hex_round_trip() {
        let key = BundleKey::new([0xab; 32]);
        let parsed: BundleKey = key.to_string().parse().unwrap();
        assert_eq!(parsed, key);
        assert_eq!(format!("{:?}", key), format!("BundleKey({})", key));
    }

    #[test]
    fn test_bundle_key_rejects_wrong_length() {
        assert!("abcd".parse::<BundleKey>().is_err());
        assert!("zz".repeat(32).parse::<BundleKey>().is_err());
    }

    #[test]
    fn test_discovery_key_is_stable_and_distinct() {
        let key = BundleKey::new([7; 32]);
        assert_eq!(key.discovery_key(), key.discovery_key());
        assert_ne!(key.discovery_key().as_bytes(), key.as_bytes());
    }

    #[test]
    fn test_checkout_parsing() {
        assert_eq!("release".parse::<Checkout>().unwrap(), Checkout::Release);
        assert_eq!("live".parse::<Checkout>().unwrap(), Checkout::Live);
        assert_eq!("42".parse::<Checkout>().unwrap(), Checkout::Version(42));
        assert!("-1".parse::<Checkout>().is_err());
        assert!("head".parse::<Checkout>().is_err());
    }

    #[test]
    fn test_checkout_serde_accepts_numbers_and_names() {
        let version: Checkout = serde_json::from_str("12").unwrap();
        assert_eq!(version, Checkout::Version(12));
        let live: Checkout = serde_json::from_str("\"live\"").unwrap();
        assert_eq!(live, Checkout::Live);
        assert_eq!(serde_json::to_string(&Checkout::Release).unwrap(), "\"release\"");
    }

    #[test]
    fn test_inverted_access_range_collapses() {
        let range = AccessRange::new(Region::Data, 10, 4);
        assert!(range.is_empty());
        assert_eq!(range.start, 10);
    }
}
