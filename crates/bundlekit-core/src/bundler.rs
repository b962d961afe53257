//! Bundler abstraction
//!
//! Packages the resolved contents of a store view into a runnable artifact.
//! Invoked once per `bundle()` call, never on the read path.

use alloc::sync::Arc;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::store::StoreView;
use crate::BundleError;

/// Link scheme used for mounts and app links
pub const LINK_SCHEME: &str = "bundle";

/// Parameters for one bundling run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleRequest {
    pub entrypoint: String,
    /// Scratch directory for extracted native assets
    pub cwd: PathBuf,
    pub absolute_prebuilds: bool,
    /// Prefix the artifact resolves its sources under
    pub mount: String,
}

/// Output of a bundling run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub entrypoint: String,
    pub sources: BTreeMap<String, Vec<u8>>,
    pub resolutions: BTreeMap<String, String>,
}

#[async_trait]
pub trait Bundler: Send + Sync {
    async fn bundle(
        &self,
        view: Arc<dyn StoreView>,
        request: BundleRequest,
    ) -> Result<Artifact, BundleError>;
}
