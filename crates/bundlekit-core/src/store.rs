//! Versioned store abstraction
//!
//! The bundle manager consumes a peer-replicated, versioned key/value store
//! through these traits. The store format and its wire protocol live behind
//! them; the manager only relies on the contract spelled out here.

use alloc::sync::Arc;
use async_trait::async_trait;
use futures::{sink::Sink, stream::BoxStream};
use serde::{de::DeserializeOwned, Serialize};
use std::pin::Pin;
use tokio::sync::broadcast;

use crate::types::{BundleKey, ByteRange, DiscoveryKey, Entry, Version};
use crate::{BundleResult, StoreError, StoreResult};

/// Chunked blob contents flowing out of (or into) a store
pub type ByteStream = BoxStream<'static, StoreResult<Vec<u8>>>;

/// Per-key write sink opened against a batch; closing it commits the entry
pub type BlobSink = Pin<Box<dyn Sink<Vec<u8>, Error = StoreError> + Send>>;

// ----------------------------------------------------------------------------
// Store View
// ----------------------------------------------------------------------------

/// Read access to a store at one version (or at the moving head)
#[async_trait]
pub trait StoreView: Send + Sync {
    /// Version this view reads from
    fn version(&self) -> Version;

    /// Resolve a key to its entry
    async fn entry(&self, key: &str) -> StoreResult<Option<Entry>>;

    /// Read an entry's full contents
    async fn get(&self, entry: &Entry) -> StoreResult<Option<Vec<u8>>>;

    /// Stream an entry's contents
    async fn read_stream(&self, entry: &Entry) -> StoreResult<ByteStream>;

    /// Read a small metadata value
    async fn get_meta(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Ask replication to fetch the given block ranges ahead of use
    async fn download_range(&self, meta: &[ByteRange], data: &[ByteRange]) -> StoreResult<()>;
}

// ----------------------------------------------------------------------------
// Batch
// ----------------------------------------------------------------------------

/// A group of writes committed together by `flush`
#[async_trait]
pub trait Batch: Send + Sync {
    /// Open a write sink for `key` inside this batch
    fn write_stream(
        &self,
        key: &str,
        metadata: Option<serde_json::Value>,
    ) -> StoreResult<BlobSink>;

    /// Commit every completed write in the batch
    async fn flush(&self) -> StoreResult<()>;
}

// ----------------------------------------------------------------------------
// Versioned Store
// ----------------------------------------------------------------------------

/// Notification that the store advanced to a new version
#[derive(Clone)]
pub struct VersionChange {
    pub version: Version,
    pub fork_id: u64,
    /// Immutable view pinned at `version`
    pub view: Arc<dyn StoreView>,
}

impl core::fmt::Debug for VersionChange {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VersionChange")
            .field("version", &self.version)
            .field("fork_id", &self.fork_id)
            .finish()
    }
}

/// Connection change for a replicating peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Added { remote_key: BundleKey },
    Removed { remote_key: BundleKey },
}

/// A writable, replicated, versioned store
#[async_trait]
pub trait VersionedStore: Send + Sync {
    /// Open the store; resolves once it is ready for use
    async fn open(&self) -> StoreResult<()>;

    fn is_opened(&self) -> bool;

    fn is_writable(&self) -> bool;

    fn discovery_key(&self) -> DiscoveryKey;

    fn fork_id(&self) -> u64;

    /// View that always reads the latest version
    fn head(&self) -> Arc<dyn StoreView>;

    /// Immutable view pinned at `version`
    fn checkout(&self, version: Version) -> Arc<dyn StoreView>;

    async fn del(&self, key: &str) -> StoreResult<bool>;

    fn batch(&self) -> Arc<dyn Batch>;

    async fn put_meta(&self, key: &str, value: Vec<u8>) -> StoreResult<()>;

    /// Infinite sequence of version changes, ending when the store closes
    fn watch(&self) -> BoxStream<'static, VersionChange>;

    /// Peer connect/disconnect notifications, if the store replicates
    fn peer_events(&self) -> Option<broadcast::Receiver<PeerEvent>>;

    async fn close(&self) -> StoreResult<()>;
}

// ----------------------------------------------------------------------------
// Typed Metadata
// ----------------------------------------------------------------------------

/// Well-known metadata keys
pub mod keys {
    /// Version pointer of the published release
    pub const RELEASE: &str = "release";
    /// Distribution channel tag
    pub const CHANNEL: &str = "channel";
    /// Platform version the bundle targets
    pub const PLATFORM_VERSION: &str = "platformVersion";
    /// Serialized warmup trace
    pub const WARMUP: &str = "warmup";
}

/// Read and decode a metadata value
pub async fn read_meta<T, V>(view: &V, key: &str) -> BundleResult<Option<T>>
where
    T: DeserializeOwned,
    V: StoreView + ?Sized,
{
    match view.get_meta(key).await? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        None => Ok(None),
    }
}

/// Encode and write a metadata value
pub async fn write_meta<T, S>(store: &S, key: &str, value: &T) -> BundleResult<()>
where
    T: Serialize + ?Sized,
    S: VersionedStore + ?Sized,
{
    let bytes = bincode::serialize(value)?;
    store.put_meta(key, bytes).await?;
    Ok(())
}
