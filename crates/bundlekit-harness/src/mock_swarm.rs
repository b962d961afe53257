//! Mock swarm for replication tests
//!
//! Counts join/leave attempts, records requests and can fail or hold joins
//! until the test releases them.

use async_trait::async_trait;
use bundlekit_core::{DiscoveryKey, JoinRequest, ReplicationError, Swarm};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Semaphore;

#[derive(Debug, Default)]
pub struct MockSwarm {
    joins: AtomicUsize,
    leaves: AtomicUsize,
    fail_joins: AtomicBool,
    fail_leaves: AtomicBool,
    /// Joins wait for a permit when set
    gate: Option<Semaphore>,
    requests: Mutex<Vec<JoinRequest>>,
    topics: Mutex<HashSet<DiscoveryKey>>,
}

impl MockSwarm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swarm whose joins block until [`MockSwarm::release_join`]
    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::default()
        }
    }

    /// Swarm whose joins always fail
    pub fn failing_joins() -> Self {
        let swarm = Self::default();
        swarm.fail_joins.store(true, Ordering::SeqCst);
        swarm
    }

    /// Let one pending (or future) join through
    pub fn release_join(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }

    pub fn fail_joins(&self, fail: bool) {
        self.fail_joins.store(fail, Ordering::SeqCst);
    }

    pub fn fail_leaves(&self, fail: bool) {
        self.fail_leaves.store(fail, Ordering::SeqCst);
    }

    pub fn join_count(&self) -> usize {
        self.joins.load(Ordering::SeqCst)
    }

    pub fn leave_count(&self) -> usize {
        self.leaves.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<JoinRequest> {
        self.requests.lock().last().cloned()
    }

    pub fn is_joined(&self, topic: &DiscoveryKey) -> bool {
        self.topics.lock().contains(topic)
    }
}

#[async_trait]
impl Swarm for MockSwarm {
    async fn join(
        &self,
        topic: DiscoveryKey,
        request: JoinRequest,
    ) -> Result<(), ReplicationError> {
        self.joins.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request);

        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|err| ReplicationError::JoinFailed {
                    reason: err.to_string(),
                })?
                .forget();
        }

        if self.fail_joins.load(Ordering::SeqCst) {
            return Err(ReplicationError::JoinFailed {
                reason: "announce rejected".into(),
            });
        }
        self.topics.lock().insert(topic);
        Ok(())
    }

    async fn leave(&self, topic: DiscoveryKey) -> Result<(), ReplicationError> {
        self.leaves.fetch_add(1, Ordering::SeqCst);
        if self.fail_leaves.load(Ordering::SeqCst) {
            return Err(ReplicationError::LeaveFailed {
                reason: "unannounce rejected".into(),
            });
        }
        self.topics.lock().remove(&topic);
        Ok(())
    }
}
