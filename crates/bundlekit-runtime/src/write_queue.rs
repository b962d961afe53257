//! Absorbed writes
//!
//! The [`WriteQueue`] pipes caller streams into per-key sinks opened against
//! one shared batch, tracks every in-flight pipe by id and drains them before
//! the batch is committed.

use bundlekit_core::{Batch, BundleError, BundleResult, StoreResult, VersionedStore};
use dashmap::DashMap;
use futures::{
    future::{join_all, BoxFuture, Shared},
    FutureExt, Stream, StreamExt,
};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, warn};

type WriteOutcome = Shared<BoxFuture<'static, BundleResult<()>>>;

// ----------------------------------------------------------------------------
// Pending Write
// ----------------------------------------------------------------------------

/// Completion of one absorbed write
///
/// The pipe runs in the background whether or not this is awaited. Every
/// clone resolves to the same outcome.
#[derive(Clone)]
pub struct PendingWrite {
    id: u64,
    outcome: WriteOutcome,
}

impl PendingWrite {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for PendingWrite {
    type Output = BundleResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.outcome).poll(cx)
    }
}

// ----------------------------------------------------------------------------
// Write Queue
// ----------------------------------------------------------------------------

/// The active batch and the writes bound to it
struct OpenBatch {
    batch: Arc<dyn Batch>,
    writes: Vec<WriteOutcome>,
}

impl OpenBatch {
    /// Wait for every write bound to the batch, then commit it
    ///
    /// Failed writes are already dropped from the batch, so the commit goes
    /// ahead regardless; the first write failure wins over a commit failure.
    async fn commit(self) -> BundleResult<()> {
        debug!("Settling {} writes before commit", self.writes.len());
        let mut first_failure = None;
        for result in join_all(self.writes).await {
            if let Err(err) = result {
                first_failure.get_or_insert(err);
            }
        }

        if let Err(err) = self.batch.flush().await {
            warn!("Batch commit failed: {}", err);
            first_failure.get_or_insert(err.into());
        }

        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

pub struct WriteQueue {
    store: Arc<dyn VersionedStore>,
    batch: Mutex<Option<OpenBatch>>,
    pending: Arc<DashMap<u64, WriteOutcome>>,
    next_id: AtomicU64,
}

impl WriteQueue {
    pub fn new(store: Arc<dyn VersionedStore>) -> Self {
        Self {
            store,
            batch: Mutex::new(None),
            pending: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Start piping `source` into `key` within the active batch
    ///
    /// Must be called from within a tokio runtime.
    pub fn absorb<S>(
        &self,
        key: &str,
        source: S,
        metadata: Option<serde_json::Value>,
    ) -> BundleResult<PendingWrite>
    where
        S: Stream<Item = StoreResult<Vec<u8>>> + Send + 'static,
    {
        // The sink and its pending entry are created under the batch lock,
        // so a drain that takes the batch also sees every write into it
        let (id, sink, outcome, done) = {
            let mut slot = self.batch.lock();
            let open = slot.get_or_insert_with(|| OpenBatch {
                batch: self.store.batch(),
                writes: Vec::new(),
            });
            let sink = open
                .batch
                .write_stream(key, metadata)
                .map_err(|err| BundleError::write_failed(key, err))?;

            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let (done, settled) = oneshot::channel();
            let outcome: WriteOutcome = settled
                .map(|received| {
                    received
                        .unwrap_or_else(|_| Err(BundleError::task_failed("write task dropped")))
                })
                .boxed()
                .shared();
            self.pending.insert(id, outcome.clone());
            open.writes.push(outcome.clone());
            (id, sink, outcome, done)
        };

        let pending = Arc::clone(&self.pending);
        let key = key.to_string();
        tokio::spawn(async move {
            let result = source
                .boxed()
                .forward(sink)
                .await
                .map_err(|err| BundleError::write_failed(&key, err));
            if let Err(err) = &result {
                warn!("Absorbed write failed: {}", err);
            }
            pending.remove(&id);
            let _ = done.send(result);
        });

        debug!("Absorbing write {} into active batch", id);
        Ok(PendingWrite { id, outcome })
    }

    /// Commit the active batch, if any; later absorbs open a new one
    ///
    /// Writes already absorbed into the batch settle before the commit.
    pub async fn flush(&self) -> BundleResult<()> {
        let open = self.batch.lock().take();
        match open {
            Some(open) => open.commit().await,
            None => Ok(()),
        }
    }

    /// Settle every pending write and commit, until nothing is left
    ///
    /// Each pass detaches the active batch, waits for the writes into it and
    /// then commits it. Writes absorbed meanwhile open a new batch that the
    /// next pass picks up. A failed write or commit does not stop the queue
    /// from emptying; the first failure is returned once it has.
    pub async fn drain(&self) -> BundleResult<()> {
        let mut first_failure = None;

        loop {
            let open = self.batch.lock().take();
            let result = match open {
                Some(open) => open.commit().await,
                None => {
                    // Writes whose batch a concurrent flush is committing
                    let stragglers: Vec<WriteOutcome> = self
                        .pending
                        .iter()
                        .map(|pending| pending.value().clone())
                        .collect();
                    if stragglers.is_empty() {
                        break;
                    }
                    debug!("Waiting on {} detached writes", stragglers.len());
                    join_all(stragglers)
                        .await
                        .into_iter()
                        .find(|result| result.is_err())
                        .unwrap_or(Ok(()))
                }
            };
            if let Err(err) = result {
                first_failure.get_or_insert(err);
            }
        }

        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn has_batch(&self) -> bool {
        self.batch.lock().is_some()
    }

    /// Nothing in flight and no batch open
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && !self.has_batch()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bundlekit_core::{BundleKey, StoreError, StoreView, Version};
    use bundlekit_harness::{wait_until, MemoryStore};
    use futures::{channel::mpsc, stream};
    use std::time::Duration;

    async fn opened_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new(BundleKey::new([1; 32])));
        store.open().await.unwrap();
        store
    }

    fn chunks(parts: &[&[u8]]) -> impl Stream<Item = StoreResult<Vec<u8>>> + Send + 'static {
        let owned: Vec<StoreResult<Vec<u8>>> = parts.iter().map(|p| Ok(p.to_vec())).collect();
        stream::iter(owned)
    }

    #[tokio::test]
    async fn test_absorb_then_drain_commits_one_version() {
        let store = opened_store().await;
        let queue = WriteQueue::new(store.clone());

        queue.absorb("/a", chunks(&[b"al", b"pha"]), None).unwrap();
        queue.absorb("/b", chunks(&[b"beta"]), None).unwrap();
        queue.drain().await.unwrap();

        assert!(queue.is_idle());
        assert_eq!(store.version(), Version::new(1));
        let head = store.head();
        let entry = head.entry("/a").await.unwrap().unwrap();
        assert_eq!(head.get(&entry).await.unwrap().unwrap(), b"alpha");
    }

    #[tokio::test]
    async fn test_flush_without_batch_is_noop() {
        let store = opened_store().await;
        let queue = WriteQueue::new(store.clone());
        queue.flush().await.unwrap();
        assert_eq!(store.version(), Version::new(0));
    }

    #[tokio::test]
    async fn test_failed_write_is_removed_and_reported() {
        let store = opened_store().await;
        let queue = WriteQueue::new(store.clone());

        let failing = stream::iter(vec![
            Ok(b"partial".to_vec()),
            Err(StoreError::Io {
                reason: "source reset".into(),
            }),
        ]);
        let write = queue.absorb("/broken", failing, None).unwrap();
        queue.absorb("/ok", chunks(&[b"fine"]), None).unwrap();

        let err = queue.drain().await.unwrap_err();
        assert!(matches!(err, BundleError::Write { ref key, .. } if key == "/broken"));
        assert!(write.await.is_err());
        assert!(queue.is_idle());
        assert!(store.head().entry("/ok").await.unwrap().is_some());
        assert!(store.head().entry("/broken").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pending_write_resolves_after_pipe() {
        let store = opened_store().await;
        let queue = WriteQueue::new(store.clone());

        let write = queue.absorb("/a", chunks(&[b"x"]), None).unwrap();
        write.clone().await.unwrap();
        assert_eq!(queue.pending_count(), 0);
        assert!(queue.has_batch());
    }

    #[tokio::test]
    async fn test_flush_waits_for_writes_in_batch() {
        let store = opened_store().await;
        let queue = Arc::new(WriteQueue::new(store.clone()));
        let (feed, source) = mpsc::unbounded();
        queue.absorb("/slow", source, None).unwrap();

        let flushing = tokio::spawn({
            let queue = queue.clone();
            async move { queue.flush().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!flushing.is_finished());
        assert_eq!(store.version(), Version::new(0));

        feed.unbounded_send(Ok(b"late bytes".to_vec())).unwrap();
        drop(feed);
        flushing.await.unwrap().unwrap();

        assert!(queue.is_idle());
        assert_eq!(store.version(), Version::new(1));
        let head = store.head();
        let entry = head.entry("/slow").await.unwrap().unwrap();
        assert_eq!(head.get(&entry).await.unwrap().unwrap(), b"late bytes");
    }

    #[tokio::test]
    async fn test_drain_continues_past_failed_commit() {
        let store = opened_store().await;
        let queue = Arc::new(WriteQueue::new(store.clone()));
        let (feed, source) = mpsc::unbounded();
        queue.absorb("/first", source, None).unwrap();

        let draining = tokio::spawn({
            let queue = queue.clone();
            async move { queue.drain().await }
        });
        assert!(wait_until(Duration::from_secs(1), || !queue.has_batch()).await);

        // Lands in a second batch while the first is still settling
        queue.absorb("/late", chunks(&[b"late"]), None).unwrap();
        store.fail_next_flush();
        feed.unbounded_send(Ok(b"first".to_vec())).unwrap();
        drop(feed);

        let err = draining.await.unwrap().unwrap_err();
        assert!(matches!(err, BundleError::Store(StoreError::Io { .. })));
        assert!(queue.is_idle());

        let head = store.head();
        assert!(head.entry("/first").await.unwrap().is_none());
        assert!(head.entry("/late").await.unwrap().is_some());
        assert_eq!(store.version(), Version::new(1));
    }
}
