//! Background store watchers
//!
//! Long-running tasks spawned by the manager: forwarding replication peer
//! events to the event logger, and announcing new releases to the update
//! notifier. Both end when the store closes its streams.

use crate::manager::Inner;
use bundlekit_core::{
    keys, read_meta, BundleEvent, EventLogger, PeerEvent, UpdateInfo, Version,
};
use futures::StreamExt;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

/// Log every peer added to or removed from replication
pub(crate) async fn forward_peer_events(
    mut events: broadcast::Receiver<PeerEvent>,
    logger: Arc<dyn EventLogger>,
) {
    loop {
        match events.recv().await {
            Ok(PeerEvent::Added { remote_key }) => {
                logger.log(&BundleEvent::PeerAdded {
                    peer: remote_key.to_hex(),
                });
            }
            Ok(PeerEvent::Removed { remote_key }) => {
                logger.log(&BundleEvent::PeerRemoved {
                    peer: remote_key.to_hex(),
                });
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("Skipped {} peer events", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!("Peer event stream ended");
}

/// Notify when an appended version publishes a release other than the one
/// being served
///
/// Holds the manager weakly so a dropped manager ends the watch.
pub(crate) async fn watch_updates(inner: Weak<Inner>) {
    let (mut changes, opening) = match inner.upgrade() {
        Some(inner) => (inner.store.watch(), inner.opening.clone()),
        None => return,
    };
    if opening.await.is_err() {
        return;
    }

    while let Some(change) = changes.next().await {
        let inner = match inner.upgrade() {
            Some(inner) => inner,
            None => break,
        };

        let release = match read_meta::<u64, _>(&*change.view, keys::RELEASE).await {
            Ok(release) => release.map(Version::new),
            Err(err) => {
                warn!("Could not read release at version {}: {}", change.version, err);
                continue;
            }
        };
        let serving = inner.view.read().version();
        if release == Some(serving) {
            debug!("Version {} keeps release {}", change.version, serving);
            continue;
        }

        let update = UpdateInfo {
            key: inner.config.key,
            version: change.version,
            fork_id: change.fork_id,
        };
        info!("Update available at version {}", update.version);
        inner.logger.log(&BundleEvent::UpdateAvailable(update.clone()));
        inner.notifier.update_available(&update);
    }
    debug!("Update watch ended");
}
