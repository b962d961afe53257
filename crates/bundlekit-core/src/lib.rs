//! BundleKit Core
//!
//! Vocabulary for versioned content bundles: identity and version types, the
//! collaborator traits a bundle manager consumes (store, swarm, bundler,
//! logger, hooks), warmup tracing, configuration and error types. The manager
//! itself lives in `bundlekit-runtime`.

extern crate alloc;

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod bundler;
pub mod config;
pub mod errors;
pub mod events;
pub mod hooks;
pub mod link;
pub mod package;
pub mod store;
pub mod swarm;
pub mod tracer;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use bundler::{Artifact, BundleRequest, Bundler, LINK_SCHEME};
pub use config::{BundleConfig, DEFAULT_ENTRYPOINT};
pub use errors::{BundleError, BundleResult, ReplicationError, StoreError, StoreResult};
pub use events::{BundleEvent, EventLogger, LogLevel, NoOpLogger, TracingLogger};
pub use hooks::{FailureHandler, NoUpdateNotifier, PropagateFailure, UpdateInfo, UpdateNotifier};
pub use link::BundleLink;
pub use package::PackageDescriptor;
pub use store::{
    keys, read_meta, write_meta, Batch, BlobSink, ByteStream, PeerEvent, StoreView,
    VersionChange, VersionedStore,
};
pub use swarm::{JoinOptions, JoinRequest, Swarm};
pub use tracer::{AccessTracer, WarmupTrace};
pub use types::{
    AccessRange, BlobRange, BundleKey, ByteRange, Checkout, DiscoveryKey, Entry, Region, Version,
};
