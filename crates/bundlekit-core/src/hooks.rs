//! Optional caller hooks
//!
//! Failure handling and update notification are capability traits with no-op
//! (or propagating) defaults, so the manager never checks whether a hook was
//! supplied.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{BundleKey, Version};
use crate::{BundleError, BundleResult};

// ----------------------------------------------------------------------------
// Failure Handling
// ----------------------------------------------------------------------------

/// Receives fatal errors before the manager closes itself
#[async_trait]
pub trait FailureHandler: Send + Sync {
    /// Handle `err`; returning `Err` propagates to whoever triggered the failure
    async fn on_failure(&self, err: &BundleError) -> BundleResult<()>;
}

/// Default handler: the error propagates to the caller
#[derive(Debug, Clone, Copy, Default)]
pub struct PropagateFailure;

#[async_trait]
impl FailureHandler for PropagateFailure {
    async fn on_failure(&self, err: &BundleError) -> BundleResult<()> {
        Err(err.clone())
    }
}

// ----------------------------------------------------------------------------
// Update Notification
// ----------------------------------------------------------------------------

/// A store version that is newer than the pinned release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateInfo {
    /// Store identity, `None` for local stores
    pub key: Option<BundleKey>,
    pub version: Version,
    pub fork_id: u64,
}

pub trait UpdateNotifier: Send + Sync {
    fn update_available(&self, update: &UpdateInfo);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoUpdateNotifier;

impl UpdateNotifier for NoUpdateNotifier {
    fn update_available(&self, _update: &UpdateInfo) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_failure_handler_propagates() {
        let err = BundleError::malformed("bad");
        let result = PropagateFailure.on_failure(&err).await;
        assert!(matches!(result, Err(BundleError::MalformedInput { .. })));
    }
}
