//! Swarm abstraction for bundle replication
//!
//! A [`Swarm`] is the caller-owned peer discovery network. The manager joins
//! it under the store's discovery key and leaves it on close; the swarm owns
//! connection handling and data serving.

use async_trait::async_trait;

use crate::types::{BundleKey, DiscoveryKey};
use crate::{BundleError, BundleResult, ReplicationError};

// ----------------------------------------------------------------------------
// Join Options
// ----------------------------------------------------------------------------

/// Caller-facing options for joining a swarm
#[derive(Debug, Clone)]
pub struct JoinOptions {
    /// Comma-separated hex keys of extra peers to announce to
    pub seeders: Option<String>,
    /// Accept incoming connections
    pub server: bool,
    /// Make outgoing connections
    pub client: bool,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self {
            seeders: None,
            server: false,
            client: true,
        }
    }
}

impl JoinOptions {
    /// Options for a seeding peer that both serves and connects
    pub fn seeding() -> Self {
        Self {
            seeders: None,
            server: true,
            client: true,
        }
    }

    pub fn with_seeders<T: Into<String>>(mut self, seeders: T) -> Self {
        self.seeders = Some(seeders.into());
        self
    }

    /// Resolve the seed list into the request handed to the swarm
    pub fn resolve(&self) -> BundleResult<JoinRequest> {
        let announce_seeds = match &self.seeders {
            Some(list) => parse_seeders(list)?,
            None => Vec::new(),
        };
        Ok(JoinRequest {
            announce_seeds,
            server: self.server,
            client: self.client,
        })
    }
}

fn parse_seeders(list: &str) -> BundleResult<Vec<BundleKey>> {
    list.split(',')
        .map(str::trim)
        .filter(|seed| !seed.is_empty())
        .map(|seed| {
            seed.parse::<BundleKey>()
                .map_err(|_| BundleError::malformed(format!("Invalid seeder key: {}", seed)))
        })
        .collect()
}

/// Resolved join parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub announce_seeds: Vec<BundleKey>,
    pub server: bool,
    pub client: bool,
}

// ----------------------------------------------------------------------------
// Swarm Trait
// ----------------------------------------------------------------------------

/// Peer discovery network shared with the caller
#[async_trait]
pub trait Swarm: Send + Sync {
    /// Join `topic`; resolves once the topic has been announced
    async fn join(&self, topic: DiscoveryKey, request: JoinRequest)
        -> Result<(), ReplicationError>;

    /// Leave `topic`
    async fn leave(&self, topic: DiscoveryKey) -> Result<(), ReplicationError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_are_client_only() {
        let request = JoinOptions::default().resolve().unwrap();
        assert!(request.client);
        assert!(!request.server);
        assert!(request.announce_seeds.is_empty());
    }

    #[test]
    fn test_seeders_are_split_on_commas() {
        let a = BundleKey::new([1; 32]);
        let b = BundleKey::new([2; 32]);
        let options = JoinOptions::seeding().with_seeders(format!("{}, {},", a, b));
        let request = options.resolve().unwrap();
        assert_eq!(request.announce_seeds, vec![a, b]);
        assert!(request.server);
    }

    #[test]
    fn test_invalid_seeder_is_malformed_input() {
        let err = JoinOptions::default()
            .with_seeders("not-a-key")
            .resolve()
            .unwrap_err();
        assert!(matches!(err, BundleError::MalformedInput { .. }));
    }
}
