//! BundleKit Harness
//!
//! In-memory collaborators for exercising bundle managers without a real
//! store or network: a versioned [`MemoryStore`], a controllable
//! [`MockSwarm`], and recording hooks.

pub mod memory_store;
pub mod mock_swarm;
pub mod recorders;

pub use memory_store::{DownloadRequest, MemoryStore, BLOCK_SIZE};
pub use mock_swarm::MockSwarm;
pub use recorders::{
    MockBundler, RecordingFailureHandler, RecordingLogger, RecordingNotifier,
};

use std::future::Future;
use std::time::Duration;

/// Install a test-friendly tracing subscriber; repeated calls are ignored
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Poll `condition` until it holds or `limit` elapses
pub async fn wait_until<F>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    true
}

/// Await `future`, giving up after `limit`
pub async fn within<T>(limit: Duration, future: impl Future<Output = T>) -> Option<T> {
    tokio::time::timeout(limit, future).await.ok()
}
