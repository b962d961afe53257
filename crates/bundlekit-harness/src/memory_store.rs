//! In-memory versioned store
//!
//! A [`VersionedStore`] keeping every version as a full snapshot. Blob
//! contents live in an append-only block log so entries carry realistic block
//! ranges for tracing and prefetch. Every committed mutation bumps the version
//! by one and is broadcast to watchers.

use async_trait::async_trait;
use bundlekit_core::{
    keys, Batch, BlobRange, BlobSink, BundleKey, ByteRange, ByteStream, DiscoveryKey, Entry,
    PeerEvent, StoreError, StoreResult, StoreView, Version, VersionChange, VersionedStore,
};
use futures::{sink::Sink, stream, stream::BoxStream, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::broadcast;

/// Bytes per blob block
pub const BLOCK_SIZE: usize = 64;

const CHANGE_BUFFER: usize = 64;

// ----------------------------------------------------------------------------
// Store State
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct Snapshot {
    files: BTreeMap<String, Entry>,
    meta: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug)]
struct State {
    /// `history[v]` is the store at version `v`; version 0 is empty
    history: Vec<Snapshot>,
    blocks: Vec<Vec<u8>>,
    opened: bool,
    closed: bool,
}

impl State {
    fn length(&self) -> u64 {
        self.history.len() as u64 - 1
    }

    fn readable(&self) -> StoreResult<()> {
        if self.closed {
            Err(StoreError::Closed)
        } else if !self.opened {
            Err(StoreError::NotOpen)
        } else {
            Ok(())
        }
    }

    fn snapshot(&self, pinned: Option<Version>) -> StoreResult<&Snapshot> {
        self.readable()?;
        let version = pinned.map_or_else(|| self.length(), Version::get);
        self.history
            .get(version as usize)
            .ok_or(StoreError::VersionUnavailable {
                requested: version,
                length: self.length(),
            })
    }

    fn append_blob(&mut self, bytes: &[u8]) -> BlobRange {
        let block_offset = self.blocks.len() as u64;
        self.blocks
            .extend(bytes.chunks(BLOCK_SIZE).map(<[u8]>::to_vec));
        BlobRange {
            block_offset,
            block_length: self.blocks.len() as u64 - block_offset,
            byte_length: bytes.len() as u64,
        }
    }

    fn blob_blocks(&self, blob: &BlobRange) -> Vec<Vec<u8>> {
        let start = blob.block_offset as usize;
        let end = start + blob.block_length as usize;
        self.blocks
            .get(start..end)
            .map(<[Vec<u8>]>::to_vec)
            .unwrap_or_default()
    }
}

/// A recorded `download_range` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub meta: Vec<ByteRange>,
    pub data: Vec<ByteRange>,
}

struct StoreCore {
    state: RwLock<State>,
    changes: Mutex<Option<broadcast::Sender<VersionChange>>>,
    downloads: Mutex<Vec<DownloadRequest>>,
    fork_id: AtomicU64,
    fail_open: AtomicBool,
    fail_downloads: AtomicBool,
    fail_next_flush: AtomicBool,
}

impl StoreCore {
    /// Apply one mutation as a new version and notify watchers
    fn commit<F>(self: &Arc<Self>, mutate: F) -> Version
    where
        F: FnOnce(&mut State, &mut Snapshot, u64),
    {
        let version = {
            let mut state = self.state.write();
            let seq = state.length() + 1;
            let mut next = state.history.last().cloned().unwrap_or_default();
            mutate(&mut *state, &mut next, seq);
            state.history.push(next);
            Version::new(seq)
        };

        if let Some(sender) = self.changes.lock().as_ref() {
            let _ = sender.send(VersionChange {
                version,
                fork_id: self.fork_id.load(Ordering::SeqCst),
                view: Arc::new(MemoryView {
                    core: Arc::clone(self),
                    pinned: Some(version),
                }),
            });
        }
        version
    }
}

// ----------------------------------------------------------------------------
// Memory Store
// ----------------------------------------------------------------------------

/// In-memory store for tests
pub struct MemoryStore {
    core: Arc<StoreCore>,
    key: BundleKey,
    writable: bool,
    peers: broadcast::Sender<PeerEvent>,
}

impl MemoryStore {
    /// Create an empty writable store
    pub fn new(key: BundleKey) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        let (peers, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            core: Arc::new(StoreCore {
                state: RwLock::new(State {
                    history: vec![Snapshot::default()],
                    blocks: Vec::new(),
                    opened: false,
                    closed: false,
                }),
                changes: Mutex::new(Some(changes)),
                downloads: Mutex::new(Vec::new()),
                fork_id: AtomicU64::new(0),
                fail_open: AtomicBool::new(false),
                fail_downloads: AtomicBool::new(false),
                fail_next_flush: AtomicBool::new(false),
            }),
            key,
            writable: true,
            peers,
        }
    }

    /// Create a store replicated from someone else's writer
    pub fn read_only(key: BundleKey) -> Self {
        Self {
            writable: false,
            ..Self::new(key)
        }
    }

    pub fn with_fork_id(self, fork_id: u64) -> Self {
        self.core.fork_id.store(fork_id, Ordering::SeqCst);
        self
    }

    /// Make `open` fail
    pub fn failing_open(self) -> Self {
        self.core.fail_open.store(true, Ordering::SeqCst);
        self
    }

    pub fn key(&self) -> BundleKey {
        self.key
    }

    /// Current version
    pub fn version(&self) -> Version {
        Version::new(self.core.state.read().length())
    }

    pub fn is_closed(&self) -> bool {
        self.core.state.read().closed
    }

    // ------------------------------------------------------------------------
    // Seeding (bypasses open and writability checks)
    // ------------------------------------------------------------------------

    /// Write a file as its own version
    pub fn put(&self, key: &str, bytes: impl AsRef<[u8]>) -> Version {
        let key = key.to_string();
        let bytes = bytes.as_ref().to_vec();
        self.core.commit(move |state, snapshot, seq| {
            let blob = state.append_blob(&bytes);
            snapshot.files.insert(
                key.clone(),
                Entry {
                    key,
                    seq,
                    blob: Some(blob),
                    metadata: None,
                },
            );
        })
    }

    /// Write raw metadata as its own version
    pub fn set_meta_bytes(&self, key: &str, value: Vec<u8>) -> Version {
        let key = key.to_string();
        self.core.commit(move |_, snapshot, _| {
            snapshot.meta.insert(key, value);
        })
    }

    /// Encode and write metadata the way the manager reads it
    pub fn set_meta<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> bincode::Result<Version> {
        Ok(self.set_meta_bytes(key, bincode::serialize(value)?))
    }

    /// Point the release pointer at `version`
    pub fn publish_release(&self, version: Version) -> bincode::Result<Version> {
        self.set_meta(keys::RELEASE, &version.get())
    }

    pub fn set_platform_version(&self, platform_version: &str) -> bincode::Result<Version> {
        self.set_meta(keys::PLATFORM_VERSION, platform_version)
    }

    /// Decode a metadata value at the head, ignoring open state
    pub fn meta<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let state = self.core.state.read();
        let bytes = state.history.last()?.meta.get(key)?;
        bincode::deserialize(bytes).ok()
    }

    // ------------------------------------------------------------------------
    // Observation and fault injection
    // ------------------------------------------------------------------------

    /// Every `download_range` call so far
    pub fn downloads(&self) -> Vec<DownloadRequest> {
        self.core.downloads.lock().clone()
    }

    pub fn fail_downloads(&self, fail: bool) {
        self.core.fail_downloads.store(fail, Ordering::SeqCst);
    }

    /// Reject the next batch commit; its staged writes are discarded
    pub fn fail_next_flush(&self) {
        self.core.fail_next_flush.store(true, Ordering::SeqCst);
    }

    /// Number of live `watch` subscriptions
    pub fn watcher_count(&self) -> usize {
        self.core
            .changes
            .lock()
            .as_ref()
            .map_or(0, broadcast::Sender::receiver_count)
    }

    pub fn simulate_peer_add(&self, remote_key: BundleKey) {
        let _ = self.peers.send(PeerEvent::Added { remote_key });
    }

    pub fn simulate_peer_remove(&self, remote_key: BundleKey) {
        let _ = self.peers.send(PeerEvent::Removed { remote_key });
    }

    fn check_writable(&self) -> StoreResult<()> {
        self.core.state.read().readable()?;
        if self.writable {
            Ok(())
        } else {
            Err(StoreError::ReadOnly)
        }
    }
}

#[async_trait]
impl VersionedStore for MemoryStore {
    async fn open(&self) -> StoreResult<()> {
        if self.core.fail_open.load(Ordering::SeqCst) {
            return Err(StoreError::Io {
                reason: "open failed".into(),
            });
        }
        let mut state = self.core.state.write();
        if state.closed {
            return Err(StoreError::Closed);
        }
        state.opened = true;
        Ok(())
    }

    fn is_opened(&self) -> bool {
        let state = self.core.state.read();
        state.opened && !state.closed
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn discovery_key(&self) -> DiscoveryKey {
        self.key.discovery_key()
    }

    fn fork_id(&self) -> u64 {
        self.core.fork_id.load(Ordering::SeqCst)
    }

    fn head(&self) -> Arc<dyn StoreView> {
        Arc::new(MemoryView {
            core: Arc::clone(&self.core),
            pinned: None,
        })
    }

    fn checkout(&self, version: Version) -> Arc<dyn StoreView> {
        Arc::new(MemoryView {
            core: Arc::clone(&self.core),
            pinned: Some(version),
        })
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        self.check_writable()?;
        let exists = self.core.state.read().snapshot(None)?.files.contains_key(key);
        if !exists {
            return Ok(false);
        }
        let key = key.to_string();
        self.core.commit(move |_, snapshot, _| {
            snapshot.files.remove(&key);
        });
        Ok(true)
    }

    fn batch(&self) -> Arc<dyn Batch> {
        Arc::new(MemoryBatch {
            core: Arc::clone(&self.core),
            writable: self.writable,
            staged: Arc::new(Mutex::new(Vec::new())),
            flushed: Arc::new(AtomicBool::new(false)),
        })
    }

    async fn put_meta(&self, key: &str, value: Vec<u8>) -> StoreResult<()> {
        self.check_writable()?;
        self.set_meta_bytes(key, value);
        Ok(())
    }

    fn watch(&self) -> BoxStream<'static, VersionChange> {
        let receiver = match self.core.changes.lock().as_ref() {
            Some(sender) => sender.subscribe(),
            None => return stream::empty().boxed(),
        };
        stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(change) => return Some((change, receiver)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    fn peer_events(&self) -> Option<broadcast::Receiver<PeerEvent>> {
        Some(self.peers.subscribe())
    }

    async fn close(&self) -> StoreResult<()> {
        self.core.state.write().closed = true;
        // Dropping the sender ends every watch stream
        self.core.changes.lock().take();
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Views
// ----------------------------------------------------------------------------

struct MemoryView {
    core: Arc<StoreCore>,
    pinned: Option<Version>,
}

#[async_trait]
impl StoreView for MemoryView {
    fn version(&self) -> Version {
        self.pinned
            .unwrap_or_else(|| Version::new(self.core.state.read().length()))
    }

    async fn entry(&self, key: &str) -> StoreResult<Option<Entry>> {
        let state = self.core.state.read();
        Ok(state.snapshot(self.pinned)?.files.get(key).cloned())
    }

    async fn get(&self, entry: &Entry) -> StoreResult<Option<Vec<u8>>> {
        let state = self.core.state.read();
        state.readable()?;
        Ok(entry.blob.map(|blob| state.blob_blocks(&blob).concat()))
    }

    async fn read_stream(&self, entry: &Entry) -> StoreResult<ByteStream> {
        let state = self.core.state.read();
        state.readable()?;
        let blocks = entry
            .blob
            .map(|blob| state.blob_blocks(&blob))
            .unwrap_or_default();
        Ok(stream::iter(blocks.into_iter().map(Ok)).boxed())
    }

    async fn get_meta(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let state = self.core.state.read();
        Ok(state.snapshot(self.pinned)?.meta.get(key).cloned())
    }

    async fn download_range(&self, meta: &[ByteRange], data: &[ByteRange]) -> StoreResult<()> {
        self.core.state.read().readable()?;
        if self.core.fail_downloads.load(Ordering::SeqCst) {
            return Err(StoreError::Io {
                reason: "no peers serving range".into(),
            });
        }
        self.core.downloads.lock().push(DownloadRequest {
            meta: meta.to_vec(),
            data: data.to_vec(),
        });
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Batches
// ----------------------------------------------------------------------------

struct StagedWrite {
    key: String,
    bytes: Vec<u8>,
    metadata: Option<serde_json::Value>,
}

struct MemoryBatch {
    core: Arc<StoreCore>,
    writable: bool,
    staged: Arc<Mutex<Vec<StagedWrite>>>,
    flushed: Arc<AtomicBool>,
}

#[async_trait]
impl Batch for MemoryBatch {
    fn write_stream(
        &self,
        key: &str,
        metadata: Option<serde_json::Value>,
    ) -> StoreResult<BlobSink> {
        if !self.writable {
            return Err(StoreError::ReadOnly);
        }
        if self.flushed.load(Ordering::SeqCst) {
            return Err(StoreError::BatchFlushed);
        }
        Ok(Box::pin(MemorySink {
            key: key.to_string(),
            metadata,
            buffer: Vec::new(),
            staged: Arc::clone(&self.staged),
            flushed: Arc::clone(&self.flushed),
            committed: false,
        }))
    }

    async fn flush(&self) -> StoreResult<()> {
        self.core.state.read().readable()?;
        if !self.writable {
            return Err(StoreError::ReadOnly);
        }
        self.flushed.store(true, Ordering::SeqCst);

        let staged = std::mem::take(&mut *self.staged.lock());
        if self.core.fail_next_flush.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Io {
                reason: "batch commit rejected".into(),
            });
        }
        if staged.is_empty() {
            return Ok(());
        }
        self.core.commit(move |state, snapshot, seq| {
            for write in staged {
                let blob = state.append_blob(&write.bytes);
                snapshot.files.insert(
                    write.key.clone(),
                    Entry {
                        key: write.key,
                        seq,
                        blob: Some(blob),
                        metadata: write.metadata,
                    },
                );
            }
        });
        Ok(())
    }
}

/// Buffers one entry and stages it into the batch on close
struct MemorySink {
    key: String,
    metadata: Option<serde_json::Value>,
    buffer: Vec<u8>,
    staged: Arc<Mutex<Vec<StagedWrite>>>,
    flushed: Arc<AtomicBool>,
    committed: bool,
}

impl MemorySink {
    fn check_batch(&self) -> StoreResult<()> {
        if self.flushed.load(Ordering::SeqCst) {
            Err(StoreError::BatchFlushed)
        } else {
            Ok(())
        }
    }
}

impl Sink<Vec<u8>> for MemorySink {
    type Error = StoreError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(self.check_batch())
    }

    fn start_send(self: Pin<&mut Self>, item: Vec<u8>) -> Result<(), Self::Error> {
        let this = self.get_mut();
        this.check_batch()?;
        this.buffer.extend_from_slice(&item);
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.get_mut();
        if this.committed {
            return Poll::Ready(Ok(()));
        }
        if let Err(err) = this.check_batch() {
            return Poll::Ready(Err(err));
        }
        this.staged.lock().push(StagedWrite {
            key: this.key.clone(),
            bytes: std::mem::take(&mut this.buffer),
            metadata: this.metadata.take(),
        });
        this.committed = true;
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::SinkExt;

    fn store() -> MemoryStore {
        MemoryStore::new(BundleKey::new([3; 32]))
    }

    #[tokio::test]
    async fn test_reads_require_open() {
        let store = store();
        store.put("/a", b"alpha");
        let head = store.head();
        assert_eq!(head.entry("/a").await, Err(StoreError::NotOpen));

        store.open().await.unwrap();
        let entry = head.entry("/a").await.unwrap().unwrap();
        assert_eq!(head.get(&entry).await.unwrap().unwrap(), b"alpha");
    }

    #[tokio::test]
    async fn test_checkout_is_pinned() {
        let store = store();
        store.open().await.unwrap();
        let v1 = store.put("/a", b"one");
        store.put("/a", b"two");

        let pinned = store.checkout(v1);
        let entry = pinned.entry("/a").await.unwrap().unwrap();
        assert_eq!(pinned.get(&entry).await.unwrap().unwrap(), b"one");
        assert_eq!(pinned.version(), v1);
        assert_eq!(store.head().version(), Version::new(2));
    }

    #[tokio::test]
    async fn test_blobs_span_blocks() {
        let store = store();
        store.open().await.unwrap();
        store.put("/small", b"x");
        store.put("/big", vec![7u8; BLOCK_SIZE * 2 + 1]);

        let entry = store.head().entry("/big").await.unwrap().unwrap();
        let blob = entry.blob.unwrap();
        assert_eq!(blob.block_offset, 1);
        assert_eq!(blob.block_length, 3);
        assert_eq!(blob.byte_length, BLOCK_SIZE as u64 * 2 + 1);
    }

    #[tokio::test]
    async fn test_batch_commits_on_flush_only() {
        let store = store();
        store.open().await.unwrap();
        let batch = store.batch();

        let mut sink = batch.write_stream("/file", None).unwrap();
        sink.send(b"hello".to_vec()).await.unwrap();
        sink.close().await.unwrap();
        assert_eq!(store.version(), Version::new(0));

        batch.flush().await.unwrap();
        assert_eq!(store.version(), Version::new(1));
        assert!(store.head().entry("/file").await.unwrap().is_some());
        assert!(matches!(
            batch.write_stream("/late", None),
            Err(StoreError::BatchFlushed)
        ));
    }

    #[tokio::test]
    async fn test_read_only_store_rejects_writes() {
        let store = MemoryStore::read_only(BundleKey::new([4; 32]));
        store.open().await.unwrap();
        assert_eq!(store.put_meta("channel", vec![1]).await, Err(StoreError::ReadOnly));
        assert!(store.batch().write_stream("/x", None).is_err());
    }

    #[tokio::test]
    async fn test_watch_ends_on_close() {
        let store = store();
        store.open().await.unwrap();
        let mut changes = store.watch();
        store.put("/a", b"a");

        let change = changes.next().await.unwrap();
        assert_eq!(change.version, Version::new(1));

        store.close().await.unwrap();
        assert!(changes.next().await.is_none());
    }
}
