//! Structured bundle events and the logger collaborator
//!
//! The manager reports lifecycle and replication activity as [`BundleEvent`]
//! values handed to an [`EventLogger`]. Events are observations only; no
//! component consumes them as control signals.

use core::fmt;
use serde::{Deserialize, Serialize};

use crate::hooks::UpdateInfo;
use crate::types::Version;

// ----------------------------------------------------------------------------
// Event Types
// ----------------------------------------------------------------------------

/// Log levels for bundle events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Observable activity of a bundle manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BundleEvent {
    Ready,
    ChannelPersisted { channel: String },
    Calibrated {
        version: Version,
        release: Option<Version>,
    },
    Announced,
    Left,
    PeerAdded { peer: String },
    PeerRemoved { peer: String },
    PrefetchFailed { reason: String },
    UpdateAvailable(UpdateInfo),
    Error { error: String },
    Closed,
}

impl BundleEvent {
    /// Short tag identifying the event kind
    pub fn tag(&self) -> &'static str {
        match self {
            BundleEvent::Ready => "ready",
            BundleEvent::ChannelPersisted { .. } => "channel-persisted",
            BundleEvent::Calibrated { .. } => "calibrated",
            BundleEvent::Announced => "announced",
            BundleEvent::Left => "left",
            BundleEvent::PeerAdded { .. } => "peer-add",
            BundleEvent::PeerRemoved { .. } => "peer-remove",
            BundleEvent::PrefetchFailed { .. } => "prefetch-failed",
            BundleEvent::UpdateAvailable(_) => "update-available",
            BundleEvent::Error { .. } => "bundle-error",
            BundleEvent::Closed => "closed",
        }
    }

    pub fn level(&self) -> LogLevel {
        match self {
            BundleEvent::Error { .. } => LogLevel::Error,
            BundleEvent::PrefetchFailed { .. } => LogLevel::Warn,
            BundleEvent::PeerAdded { .. } | BundleEvent::PeerRemoved { .. } => LogLevel::Debug,
            _ => LogLevel::Info,
        }
    }
}

impl fmt::Display for BundleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BundleEvent::ChannelPersisted { channel } => write!(f, "{} channel:{}", self.tag(), channel),
            BundleEvent::Calibrated { version, release } => {
                write!(f, "{} version:{} release:{:?}", self.tag(), version, release)
            }
            BundleEvent::PeerAdded { peer } | BundleEvent::PeerRemoved { peer } => {
                write!(f, "{} peer:{}", self.tag(), peer)
            }
            BundleEvent::PrefetchFailed { reason } => write!(f, "{} reason:{}", self.tag(), reason),
            BundleEvent::UpdateAvailable(update) => {
                write!(f, "{} version:{} fork:{}", self.tag(), update.version, update.fork_id)
            }
            BundleEvent::Error { error } => write!(f, "{} error:{}", self.tag(), error),
            _ => write!(f, "{}", self.tag()),
        }
    }
}

// ----------------------------------------------------------------------------
// Logger Implementations
// ----------------------------------------------------------------------------

/// Single-argument structured event sink
pub trait EventLogger: Send + Sync {
    fn log(&self, event: &BundleEvent);
}

/// Logger that discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpLogger;

impl EventLogger for NoOpLogger {
    fn log(&self, _event: &BundleEvent) {}
}

/// Logger that forwards events to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl EventLogger for TracingLogger {
    fn log(&self, event: &BundleEvent) {
        match event.level() {
            LogLevel::Debug => tracing::debug!(tag = event.tag(), "{}", event),
            LogLevel::Info => tracing::info!(tag = event.tag(), "{}", event),
            LogLevel::Warn => tracing::warn!(tag = event.tag(), "{}", event),
            LogLevel::Error => tracing::error!(tag = event.tag(), "{}", event),
        }
    }
}
