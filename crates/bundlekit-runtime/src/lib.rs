//! BundleKit Runtime
//!
//! The bundle manager and the machinery it coordinates:
//! - `BundleManager`: checkout calibration, traced reads and lifecycle
//! - `WriteQueue`: absorbed write streams batched into one commit
//! - `Replication`: swarm join/leave state machine
//! - Warmup prefetch and background update watching
//!
//! `bundlekit-core` provides the collaborator traits the runtime consumes.

pub mod builder;
pub mod manager;
pub mod prefetch;
pub mod replication;
mod watch;
pub mod write_queue;

pub use builder::BundleManagerBuilder;
pub use manager::{BundleManager, BundleOutput, BundleState, Calibration};
pub use prefetch::{PrefetchRanges, WarmupStats};
pub use replication::{FailureCallback, Replication};
pub use write_queue::{PendingWrite, WriteQueue};

// Re-export core types for convenience
pub use bundlekit_core::{
    BundleConfig, BundleError, BundleEvent, BundleKey, BundleResult, Checkout, JoinOptions,
    Version,
};
