//! Recording collaborators
//!
//! Logger, failure handler, notifier and bundler implementations that keep
//! what they were given so tests can assert on it.

use async_trait::async_trait;
use bundlekit_core::{
    Artifact, BundleError, BundleEvent, BundleRequest, BundleResult, Bundler, EventLogger,
    FailureHandler, StoreView, UpdateInfo, UpdateNotifier,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

// ----------------------------------------------------------------------------
// Logger
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct RecordingLogger {
    events: Mutex<Vec<BundleEvent>>,
}

impl RecordingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BundleEvent> {
        self.events.lock().clone()
    }

    pub fn tags(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(BundleEvent::tag).collect()
    }

    pub fn count(&self, tag: &str) -> usize {
        self.events.lock().iter().filter(|e| e.tag() == tag).count()
    }
}

impl EventLogger for RecordingLogger {
    fn log(&self, event: &BundleEvent) {
        self.events.lock().push(event.clone());
    }
}

// ----------------------------------------------------------------------------
// Failure Handler
// ----------------------------------------------------------------------------

/// Reports each failure on a channel, then swallows or propagates it
pub struct RecordingFailureHandler {
    failures: mpsc::UnboundedSender<BundleError>,
    swallow: bool,
}

impl RecordingFailureHandler {
    /// Handler that swallows failures
    pub fn swallowing() -> (Self, mpsc::UnboundedReceiver<BundleError>) {
        let (failures, receiver) = mpsc::unbounded_channel();
        (
            Self {
                failures,
                swallow: true,
            },
            receiver,
        )
    }

    /// Handler that propagates failures after recording them
    pub fn propagating() -> (Self, mpsc::UnboundedReceiver<BundleError>) {
        let (handler, receiver) = Self::swallowing();
        (
            Self {
                swallow: false,
                ..handler
            },
            receiver,
        )
    }
}

#[async_trait]
impl FailureHandler for RecordingFailureHandler {
    async fn on_failure(&self, err: &BundleError) -> BundleResult<()> {
        let _ = self.failures.send(err.clone());
        if self.swallow {
            Ok(())
        } else {
            Err(err.clone())
        }
    }
}

// ----------------------------------------------------------------------------
// Update Notifier
// ----------------------------------------------------------------------------

pub struct RecordingNotifier {
    updates: mpsc::UnboundedSender<UpdateInfo>,
}

impl RecordingNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UpdateInfo>) {
        let (updates, receiver) = mpsc::unbounded_channel();
        (Self { updates }, receiver)
    }
}

impl UpdateNotifier for RecordingNotifier {
    fn update_available(&self, update: &UpdateInfo) {
        let _ = self.updates.send(update.clone());
    }
}

// ----------------------------------------------------------------------------
// Bundler
// ----------------------------------------------------------------------------

/// Bundler that packs just the entrypoint file
#[derive(Debug, Default)]
pub struct MockBundler {
    requests: Mutex<Vec<BundleRequest>>,
}

impl MockBundler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<BundleRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Bundler for MockBundler {
    async fn bundle(
        &self,
        view: Arc<dyn StoreView>,
        request: BundleRequest,
    ) -> Result<Artifact, BundleError> {
        self.requests.lock().push(request.clone());

        let mut sources = BTreeMap::new();
        if let Some(entry) = view.entry(&request.entrypoint).await? {
            if let Some(bytes) = view.get(&entry).await? {
                sources.insert(request.entrypoint.clone(), bytes);
            }
        }

        let mut resolutions = BTreeMap::new();
        resolutions.insert(request.mount.clone(), request.entrypoint.clone());

        Ok(Artifact {
            entrypoint: request.entrypoint,
            sources,
            resolutions,
        })
    }
}
