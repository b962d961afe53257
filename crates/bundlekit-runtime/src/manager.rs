//! Bundle manager
//!
//! [`BundleManager`] presents one application package at one version on top
//! of a replicated, versioned store. It owns the store handle and the current
//! read view, and coordinates:
//!
//! - checkout calibration (release pointer, pinned version or live head)
//! - traced reads and absorbed, batched writes
//! - swarm join/leave through the replication state machine
//! - warmup capture and prefetch
//! - orderly close: leave, drain, store close
//!
//! Once `close` has started every operation except `close`, property reads
//! and `progress` fails with [`BundleError::Closed`].

use crate::prefetch::{self, PrefetchRanges, WarmupStats};
use crate::replication::{FailureCallback, Replication};
use crate::watch;
use crate::write_queue::{PendingWrite, WriteQueue};
use bundlekit_core::{
    keys, read_meta, write_meta, AccessRange, AccessTracer, Artifact, BundleConfig, BundleError,
    BundleEvent, BundleKey, BundleRequest, BundleResult, Bundler, ByteStream, Checkout,
    DiscoveryKey, Entry, EventLogger, FailureHandler, JoinOptions, PackageDescriptor, Region,
    StoreResult, StoreView, Swarm, UpdateNotifier, Version, VersionedStore, WarmupTrace,
    DEFAULT_ENTRYPOINT, LINK_SCHEME,
};
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub(crate) type Opening = Shared<BoxFuture<'static, BundleResult<()>>>;

// ----------------------------------------------------------------------------
// Public Types
// ----------------------------------------------------------------------------

/// Lifecycle of a bundle manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleState {
    /// Store open in progress
    Opening,
    /// Store open failed; `ready` reports the error
    Failed,
    /// Store open, checkout not yet resolved
    Ready,
    /// Checkout, channel and warmup resolved
    Calibrated,
    Closing,
    Closed,
}

/// Outcome of calibration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Calibration {
    /// Version of the view reads are served from
    pub version: Version,
    /// Release pointer the view was pinned to, if any
    pub release: Option<Version>,
    pub channel: String,
    pub platform_version: Option<String>,
}

/// Result of `bundle()`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleOutput {
    /// Hex key, or `dev` for local bundles
    pub key: String,
    pub artifact: Artifact,
}

// ----------------------------------------------------------------------------
// Shared State
// ----------------------------------------------------------------------------

pub(crate) struct ManagerParts {
    pub config: BundleConfig,
    pub store: Arc<dyn VersionedStore>,
    pub package: Option<PackageDescriptor>,
    pub logger: Arc<dyn EventLogger>,
    pub failure: Arc<dyn FailureHandler>,
    pub notifier: Arc<dyn UpdateNotifier>,
    pub bundler: Option<Arc<dyn Bundler>>,
}

pub(crate) struct Inner {
    pub(crate) config: BundleConfig,
    pub(crate) store: Arc<dyn VersionedStore>,
    package: Option<PackageDescriptor>,
    /// Swapped once, by calibration; reads clone it when they start
    pub(crate) view: RwLock<Arc<dyn StoreView>>,
    pub(crate) logger: Arc<dyn EventLogger>,
    failure: Arc<dyn FailureHandler>,
    pub(crate) notifier: Arc<dyn UpdateNotifier>,
    bundler: Option<Arc<dyn Bundler>>,
    pub(crate) opening: Opening,
    state: Arc<Mutex<BundleState>>,
    calibration: OnceCell<Calibration>,
    writes: WriteQueue,
    replication: Replication,
    tracer: Mutex<Option<AccessTracer>>,
    warmup: RwLock<Option<Vec<AccessRange>>>,
    closed: AtomicBool,
    teardown: OnceCell<BundleResult<()>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

// ----------------------------------------------------------------------------
// Bundle Manager
// ----------------------------------------------------------------------------

/// Handle to one bundle; clones share the same manager
#[derive(Clone)]
pub struct BundleManager {
    inner: Arc<Inner>,
}

impl BundleManager {
    /// Wire up a manager and schedule the store open
    pub(crate) fn start(parts: ManagerParts) -> Self {
        let ManagerParts {
            config,
            store,
            package,
            logger,
            failure,
            notifier,
            bundler,
        } = parts;

        let state = Arc::new(Mutex::new(BundleState::Opening));
        let opening = spawn_open(
            Arc::clone(&store),
            config.channel.clone(),
            Arc::clone(&logger),
            Arc::clone(&state),
        );
        let tracer = if config.trace {
            Some(AccessTracer::new())
        } else {
            None
        };

        let inner = Arc::new(Inner {
            view: RwLock::new(store.head()),
            writes: WriteQueue::new(Arc::clone(&store)),
            replication: Replication::new(store.discovery_key(), Arc::clone(&logger)),
            config,
            store,
            package,
            logger,
            failure,
            notifier,
            bundler,
            opening,
            state,
            calibration: OnceCell::new(),
            tracer: Mutex::new(tracer),
            warmup: RwLock::new(None),
            closed: AtomicBool::new(false),
            teardown: OnceCell::new(),
            tasks: Mutex::new(Vec::new()),
        });
        let manager = Self { inner };

        if let Some(events) = manager.inner.store.peer_events() {
            manager.spawn_task(watch::forward_peer_events(
                events,
                Arc::clone(&manager.inner.logger),
            ));
        }
        if manager.inner.config.watch_updates {
            manager.spawn_task(watch::watch_updates(Arc::downgrade(&manager.inner)));
        }
        manager
    }

    /// Open `store` and report whether it holds any content
    pub async fn provisioned(store: &dyn VersionedStore) -> BundleResult<bool> {
        store.open().await?;
        let provisioned = store.head().version().get() > 0;
        store.close().await?;
        Ok(provisioned)
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Resolves once the store is open (and the channel recorded)
    pub async fn ready(&self) -> BundleResult<()> {
        self.ensure_open("ready")?;
        self.inner.opening.clone().await
    }

    /// Resolve the checkout, channel, platform version and warmup trace
    ///
    /// Memoized: later calls return without touching the store.
    pub async fn calibrate(&self) -> BundleResult<Calibration> {
        self.ensure_open("calibrate")?;
        self.inner.opening.clone().await?;
        let calibration = self
            .inner
            .calibration
            .get_or_try_init(|| self.resolve_calibration())
            .await?;
        Ok(calibration.clone())
    }

    async fn resolve_calibration(&self) -> BundleResult<Calibration> {
        let config = &self.inner.config;
        let tracing = self.is_tracing();
        let mut release = None;

        if !config.stage && !tracing {
            match config.checkout {
                Checkout::Release => {
                    let head = self.inner.store.head();
                    release = read_meta::<u64, _>(&*head, keys::RELEASE)
                        .await?
                        .map(Version::new);
                    if let Some(version) = release {
                        self.rebind(self.inner.store.checkout(version));
                    }
                }
                Checkout::Version(version) => {
                    self.rebind(self.inner.store.checkout(Version::new(version)));
                }
                Checkout::Live => {}
            }
        }

        let view = self.current_view();
        let platform_version: Option<String> = read_meta(&*view, keys::PLATFORM_VERSION).await?;
        let channel = match &config.channel {
            Some(channel) => channel.clone(),
            None => read_meta::<String, _>(&*view, keys::CHANNEL)
                .await?
                .unwrap_or_default(),
        };

        if !tracing {
            if let Some(trace) = read_meta::<WarmupTrace, _>(&*view, keys::WARMUP).await? {
                let ranges = trace.inflate()?;
                debug!("Loaded {} warmup ranges", ranges.len());
                self.spawn_warmup_prefetch(&ranges);
                *self.inner.warmup.write() = Some(ranges);
            }
        }

        let calibration = Calibration {
            version: view.version(),
            release,
            channel,
            platform_version,
        };
        info!(
            version = %calibration.version,
            channel = %calibration.channel,
            "Bundle calibrated"
        );
        self.inner.logger.log(&BundleEvent::Calibrated {
            version: calibration.version,
            release: calibration.release,
        });
        {
            let mut state = self.inner.state.lock();
            if *state == BundleState::Ready {
                *state = BundleState::Calibrated;
            }
        }
        Ok(calibration)
    }

    /// Log `err`, hand it to the failure handler, then close
    ///
    /// Close runs whether or not the handler succeeds. With the default
    /// handler the error is returned.
    pub async fn fatal(&self, err: BundleError) -> BundleResult<()> {
        error!("Bundle failure: {}", err);
        self.inner.logger.log(&BundleEvent::Error {
            error: err.to_string(),
        });
        let handled = self.inner.failure.on_failure(&err).await;
        let closed = self.close().await;
        handled.and(closed)
    }

    /// Leave the swarm, drain writes and close the store
    ///
    /// Every step runs even if an earlier one fails; the first failure is
    /// returned. Concurrent and repeated calls share one teardown.
    pub async fn close(&self) -> BundleResult<()> {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            debug!("Closing bundle");
        }
        self.inner
            .teardown
            .get_or_init(|| self.teardown())
            .await
            .clone()
    }

    async fn teardown(&self) -> BundleResult<()> {
        *self.inner.state.lock() = BundleState::Closing;
        let mut first_error: Option<BundleError> = None;

        // Writes absorbed before the open finished need an open store
        if let Err(err) = self.inner.opening.clone().await {
            debug!("Store open failed before close: {}", err);
        }

        if let Err(err) = self.inner.replication.leave(None).await {
            warn!("Leave during close failed: {}", err);
            first_error.get_or_insert(err);
        }

        let capture = self.inner.tracer.lock().take();
        if capture.is_some() {
            debug!("Stopped warmup capture");
        }

        if let Err(err) = self.inner.writes.drain().await {
            warn!("Drain during close failed: {}", err);
            first_error.get_or_insert(err);
        }

        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            task.abort();
        }

        if let Err(err) = self.inner.store.close().await {
            warn!("Store close failed: {}", err);
            first_error.get_or_insert(err.into());
        }

        *self.inner.state.lock() = BundleState::Closed;
        self.inner.logger.log(&BundleEvent::Closed);
        info!("Bundle closed");

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Resolve `key` to its raw entry
    pub async fn entry(&self, key: &str) -> BundleResult<Option<Entry>> {
        let view = self.reader("entry").await?;
        self.lookup(&*view, key).await
    }

    pub async fn get(&self, key: &str) -> BundleResult<Option<Vec<u8>>> {
        let view = self.reader("get").await?;
        let entry = match self.lookup(&*view, key).await? {
            Some(entry) => entry,
            None => return Ok(None),
        };
        let contents = view.get(&entry).await?;
        if contents.is_some() {
            self.trace_blob(&entry);
        }
        Ok(contents)
    }

    pub async fn has(&self, key: &str) -> BundleResult<bool> {
        Ok(self.entry(key).await?.is_some())
    }

    /// Stream the contents of `key`, or `None` if it does not exist
    pub async fn stream_from(&self, key: &str) -> BundleResult<Option<ByteStream>> {
        let view = self.reader("stream").await?;
        let entry = match self.lookup(&*view, key).await? {
            Some(entry) => entry,
            None => return Ok(None),
        };
        let stream = view.read_stream(&entry).await?;
        self.trace_blob(&entry);
        Ok(Some(stream))
    }

    async fn reader(&self, operation: &'static str) -> BundleResult<Arc<dyn StoreView>> {
        self.ensure_open(operation)?;
        self.inner.opening.clone().await?;
        Ok(self.current_view())
    }

    async fn lookup(&self, view: &dyn StoreView, key: &str) -> BundleResult<Option<Entry>> {
        let entry = view.entry(key).await?;
        if let (Some(entry), Some(tracer)) = (&entry, self.active_tracer()) {
            tracer.record(Region::Meta, entry.seq, entry.seq + 1);
        }
        Ok(entry)
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    pub async fn del(&self, key: &str) -> BundleResult<bool> {
        self.ensure_open("delete")?;
        Ok(self.inner.store.del(key).await?)
    }

    /// Pipe `source` into `key` as part of the active batch
    ///
    /// The write is tracked until it settles; `drain` waits for it.
    pub fn absorb_read_stream<S>(
        &self,
        key: &str,
        source: S,
        metadata: Option<serde_json::Value>,
    ) -> BundleResult<PendingWrite>
    where
        S: Stream<Item = StoreResult<Vec<u8>>> + Send + 'static,
    {
        self.ensure_open("absorb")?;
        self.inner.writes.absorb(key, source, metadata)
    }

    pub async fn flush(&self) -> BundleResult<()> {
        self.ensure_open("flush")?;
        self.inner.writes.flush().await
    }

    pub async fn drain(&self) -> BundleResult<()> {
        self.ensure_open("drain")?;
        self.inner.writes.drain().await
    }

    // ------------------------------------------------------------------------
    // Replication
    // ------------------------------------------------------------------------

    /// Join `swarm` under the store's discovery key
    ///
    /// Concurrent calls share one join. A failed join is fatal.
    pub async fn join(&self, swarm: Arc<dyn Swarm>, options: JoinOptions) -> BundleResult<()> {
        self.ensure_open("join")?;
        self.inner
            .replication
            .join(swarm, &options, Some(self.failure_callback()))
            .await
    }

    /// Leave the joined swarm; a no-op when not joined. A failed leave is fatal.
    pub async fn leave(&self) -> BundleResult<()> {
        self.ensure_open("leave")?;
        self.inner
            .replication
            .leave(Some(self.failure_callback()))
            .await
    }

    fn failure_callback(&self) -> FailureCallback {
        let inner = Arc::downgrade(&self.inner);
        Box::new(move |err: BundleError| {
            if let Some(inner) = inner.upgrade() {
                let manager = BundleManager { inner };
                tokio::spawn(async move {
                    if let Err(err) = manager.fatal(err).await {
                        debug!("Fatal error propagated: {}", err);
                    }
                });
            }
        })
    }

    // ------------------------------------------------------------------------
    // Tracing and Prefetch
    // ------------------------------------------------------------------------

    /// Begin capturing accessed ranges for a future warmup
    ///
    /// Capture and warmup replay are exclusive: this fails once a stored
    /// warmup trace has been loaded.
    pub fn start_tracing(&self) -> BundleResult<AccessTracer> {
        self.ensure_open("start tracing")?;
        if self.inner.warmup.read().is_some() {
            return Err(BundleError::programmer(
                "Cannot trace a bundle that is replaying a warmup",
            ));
        }
        let mut slot = self.inner.tracer.lock();
        Ok(slot.get_or_insert_with(AccessTracer::new).clone())
    }

    /// Persist the captured ranges as the warmup trace
    pub async fn finalize_tracing(&self) -> BundleResult<()> {
        self.ensure_open("finalize tracing")?;
        if !self.inner.store.is_opened() {
            return Err(BundleError::programmer(
                "Bundle must be opened before warmup can commence",
            ));
        }
        let tracer = self.active_tracer().ok_or_else(|| {
            BundleError::programmer("Tracing finalized without a tracer present")
        })?;

        let trace = tracer.deflate()?;
        write_meta(&*self.inner.store, keys::WARMUP, &trace).await?;
        info!(ranges = tracer.len(), "Warmup trace persisted");
        Ok(())
    }

    /// Download `ranges` ahead of use
    pub async fn prefetch(&self, ranges: impl Into<PrefetchRanges>) -> BundleResult<()> {
        let ranges = ranges.into();
        let view = self.reader("prefetch").await?;
        prefetch::download(&*view, &ranges).await
    }

    /// Completion percentages of the warmup; ends after yielding 100
    pub fn progress(&self) -> BoxStream<'static, u8> {
        let manager = self.clone();
        stream::once(async move {
            if manager.inner.config.key.is_none() {
                return 100;
            }
            let ranges = manager.inner.warmup.read().clone();
            if let Some(ranges) = ranges {
                if let Err(err) = manager.prefetch(ranges).await {
                    warn!("Warmup prefetch failed: {}", err);
                }
            }
            100
        })
        .boxed()
    }

    /// Size of the loaded warmup trace
    pub fn warmup(&self) -> WarmupStats {
        self.inner
            .warmup
            .read()
            .as_deref()
            .map(WarmupStats::from_ranges)
            .unwrap_or_default()
    }

    fn spawn_warmup_prefetch(&self, ranges: &[AccessRange]) {
        let view = self.current_view();
        let logger = Arc::clone(&self.inner.logger);
        let request = PrefetchRanges::from(ranges);
        self.spawn_task(async move {
            if let Err(err) = prefetch::download(&*view, &request).await {
                warn!("Warmup prefetch failed: {}", err);
                logger.log(&BundleEvent::PrefetchFailed {
                    reason: err.to_string(),
                });
            }
        });
    }

    fn active_tracer(&self) -> Option<AccessTracer> {
        self.inner.tracer.lock().clone()
    }

    fn is_tracing(&self) -> bool {
        self.inner.tracer.lock().is_some()
    }

    fn trace_blob(&self, entry: &Entry) {
        if let (Some(tracer), Some(blob)) = (self.active_tracer(), entry.blob) {
            tracer.record(
                Region::Data,
                blob.block_offset,
                blob.block_offset + blob.block_length,
            );
        }
    }

    // ------------------------------------------------------------------------
    // Bundling
    // ------------------------------------------------------------------------

    /// Package the current view into a runnable artifact
    pub async fn bundle(&self) -> BundleResult<BundleOutput> {
        self.ensure_open("bundle")?;
        if !self.inner.store.is_opened() {
            self.inner.opening.clone().await?;
        }
        let bundler = self
            .inner
            .bundler
            .clone()
            .ok_or_else(|| BundleError::config_error("No bundler configured"))?;

        let id = self
            .inner
            .config
            .key
            .map_or_else(|| "dev".to_string(), |key| key.to_hex());
        let entrypoint = self
            .inner
            .config
            .entrypoint
            .clone()
            .or_else(|| self.inner.package.as_ref().and_then(|pkg| pkg.main.clone()))
            .unwrap_or_else(|| DEFAULT_ENTRYPOINT.to_string());
        let request = BundleRequest {
            entrypoint,
            cwd: self.inner.config.swap_dir.clone(),
            absolute_prebuilds: true,
            mount: format!("{}://{}", LINK_SCHEME, id),
        };

        let artifact = bundler.bundle(self.current_view(), request).await?;
        Ok(BundleOutput { key: id, artifact })
    }

    // ------------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------------

    pub fn state(&self) -> BundleState {
        *self.inner.state.lock()
    }

    /// Version of the view reads are served from
    pub fn version(&self) -> Version {
        self.current_view().version()
    }

    pub fn key(&self) -> Option<BundleKey> {
        self.inner.config.key
    }

    pub fn discovery_key(&self) -> DiscoveryKey {
        self.inner.store.discovery_key()
    }

    /// Configured channel until calibration, then the resolved one
    pub fn channel(&self) -> Option<String> {
        self.inner
            .calibration
            .get()
            .map(|calibration| calibration.channel.clone())
            .or_else(|| self.inner.config.channel.clone())
    }

    pub fn platform_version(&self) -> Option<String> {
        self.inner
            .calibration
            .get()
            .and_then(|calibration| calibration.platform_version.clone())
    }

    /// True when reads are pinned to a stored release
    pub fn live(&self) -> bool {
        self.inner.config.checkout == Checkout::Release
            && self
                .inner
                .calibration
                .get()
                .map_or(false, |calibration| calibration.release.is_some())
    }

    pub fn calibration(&self) -> Option<Calibration> {
        self.inner.calibration.get().cloned()
    }

    pub fn package(&self) -> Option<&PackageDescriptor> {
        self.inner.package.as_ref()
    }

    pub fn is_opened(&self) -> bool {
        self.inner.store.is_opened()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn is_local(&self) -> bool {
        self.inner.config.key.is_none()
    }

    /// Replication state name: `idle`, `joining`, `joined` or `leaving`
    pub fn replication_state(&self) -> &'static str {
        self.inner.replication.state_name()
    }

    pub fn pending_writes(&self) -> usize {
        self.inner.writes.pending_count()
    }

    /// No writes in flight and no batch open
    pub fn writes_idle(&self) -> bool {
        self.inner.writes.is_idle()
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn ensure_open(&self, operation: &'static str) -> BundleResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            Err(BundleError::Closed { operation })
        } else {
            Ok(())
        }
    }

    fn current_view(&self) -> Arc<dyn StoreView> {
        Arc::clone(&*self.inner.view.read())
    }

    fn rebind(&self, view: Arc<dyn StoreView>) {
        debug!("Rebinding reads to version {}", view.version());
        *self.inner.view.write() = view;
    }

    fn spawn_task<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        if self.is_closed() {
            handle.abort();
            return;
        }
        self.inner.tasks.lock().push(handle);
    }
}

// ----------------------------------------------------------------------------
// Store Open
// ----------------------------------------------------------------------------

fn spawn_open(
    store: Arc<dyn VersionedStore>,
    channel: Option<String>,
    logger: Arc<dyn EventLogger>,
    state: Arc<Mutex<BundleState>>,
) -> Opening {
    let handle = tokio::spawn(async move {
        let result = open_store(&*store, channel, &*logger).await;
        {
            let mut state = state.lock();
            if *state == BundleState::Opening {
                *state = if result.is_ok() {
                    BundleState::Ready
                } else {
                    BundleState::Failed
                };
            }
        }
        if let Err(err) = &result {
            error!("Bundle store failed to open: {}", err);
        }
        result
    });

    async move {
        match handle.await {
            Ok(result) => result,
            Err(err) => Err(BundleError::task_failed(err)),
        }
    }
    .boxed()
    .shared()
}

async fn open_store(
    store: &dyn VersionedStore,
    channel: Option<String>,
    logger: &dyn EventLogger,
) -> BundleResult<()> {
    store.open().await?;

    // The channel is recorded once per writable store
    if let Some(channel) = channel {
        if store.is_writable() {
            let head = store.head();
            let existing: Option<String> = read_meta(&*head, keys::CHANNEL).await?;
            if existing.as_deref() != Some(channel.as_str()) {
                write_meta(store, keys::CHANNEL, &channel).await?;
                debug!("Recorded channel {}", channel);
                logger.log(&BundleEvent::ChannelPersisted { channel });
            }
        }
    }

    info!("Bundle store open");
    logger.log(&BundleEvent::Ready);
    Ok(())
}
