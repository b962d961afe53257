//! Swarm join/leave orchestration
//!
//! Replication state is an explicit machine:
//!
//! ```text
//! Idle --join--> Joining --ok--> Joined --leave--> Leaving --ok--> Idle
//!                   |                                  |
//!                   +--err--> Idle          Joined <--err
//! ```
//!
//! Concurrent callers share the in-flight transition instead of starting a
//! second one. A `join` that finds a leave in flight waits for it and then
//! joins; a `leave` that finds a join in flight waits for it and then leaves.

use bundlekit_core::{
    BundleError, BundleEvent, BundleResult, DiscoveryKey, EventLogger, JoinOptions, JoinRequest,
    Swarm,
};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

type Completion = Shared<BoxFuture<'static, BundleResult<()>>>;

/// Invoked once with the error when a reported transition fails
pub type FailureCallback = Box<dyn FnOnce(BundleError) + Send>;

// ----------------------------------------------------------------------------
// Replication State
// ----------------------------------------------------------------------------

enum ReplicationState {
    Idle,
    Joining {
        swarm: Arc<dyn Swarm>,
        done: Completion,
    },
    Joined {
        swarm: Arc<dyn Swarm>,
    },
    Leaving {
        swarm: Arc<dyn Swarm>,
        done: Completion,
    },
}

impl ReplicationState {
    fn name(&self) -> &'static str {
        match self {
            ReplicationState::Idle => "idle",
            ReplicationState::Joining { .. } => "joining",
            ReplicationState::Joined { .. } => "joined",
            ReplicationState::Leaving { .. } => "leaving",
        }
    }
}

enum Wait {
    Join(Completion),
    Leave(Completion),
}

// ----------------------------------------------------------------------------
// Replication
// ----------------------------------------------------------------------------

pub struct Replication {
    topic: DiscoveryKey,
    logger: Arc<dyn EventLogger>,
    state: Arc<Mutex<ReplicationState>>,
}

impl Replication {
    pub fn new(topic: DiscoveryKey, logger: Arc<dyn EventLogger>) -> Self {
        Self {
            topic,
            logger,
            state: Arc::new(Mutex::new(ReplicationState::Idle)),
        }
    }

    /// Current state name: `idle`, `joining`, `joined` or `leaving`
    pub fn state_name(&self) -> &'static str {
        self.state.lock().name()
    }

    pub fn is_joined(&self) -> bool {
        matches!(*self.state.lock(), ReplicationState::Joined { .. })
    }

    /// Join `swarm`, or share the join already in flight
    ///
    /// Seeds are resolved only when a new join starts; an invalid seed list
    /// fails without contacting the swarm.
    pub async fn join(
        &self,
        swarm: Arc<dyn Swarm>,
        options: &JoinOptions,
        on_failure: Option<FailureCallback>,
    ) -> BundleResult<()> {
        let mut on_failure = on_failure;
        loop {
            let wait = {
                let mut state = self.state.lock();
                match &*state {
                    ReplicationState::Joined { .. } => return Ok(()),
                    ReplicationState::Joining { done, .. } => Wait::Join(done.clone()),
                    ReplicationState::Leaving { done, .. } => Wait::Leave(done.clone()),
                    ReplicationState::Idle => {
                        let request = options.resolve()?;
                        let done =
                            self.spawn_join(Arc::clone(&swarm), request, on_failure.take());
                        *state = ReplicationState::Joining {
                            swarm: Arc::clone(&swarm),
                            done: done.clone(),
                        };
                        Wait::Join(done)
                    }
                }
            };

            match wait {
                Wait::Join(done) => return done.await,
                Wait::Leave(done) => {
                    debug!("Join waiting for in-flight leave");
                    let _ = done.await;
                }
            }
        }
    }

    /// Leave the joined swarm, or share the leave already in flight
    pub async fn leave(&self, on_failure: Option<FailureCallback>) -> BundleResult<()> {
        let mut on_failure = on_failure;
        loop {
            let wait = {
                let mut state = self.state.lock();
                match &*state {
                    ReplicationState::Idle => return Ok(()),
                    ReplicationState::Leaving { done, .. } => Wait::Leave(done.clone()),
                    ReplicationState::Joining { done, .. } => Wait::Join(done.clone()),
                    ReplicationState::Joined { swarm } => {
                        let swarm = Arc::clone(swarm);
                        let done = self.spawn_leave(Arc::clone(&swarm), on_failure.take());
                        *state = ReplicationState::Leaving {
                            swarm,
                            done: done.clone(),
                        };
                        Wait::Leave(done)
                    }
                }
            };

            match wait {
                Wait::Leave(done) => return done.await,
                Wait::Join(done) => {
                    debug!("Leave waiting for in-flight join");
                    let _ = done.await;
                }
            }
        }
    }

    fn spawn_join(
        &self,
        swarm: Arc<dyn Swarm>,
        request: JoinRequest,
        on_failure: Option<FailureCallback>,
    ) -> Completion {
        let (done, settled) = oneshot::channel();
        let state = Arc::clone(&self.state);
        let logger = Arc::clone(&self.logger);
        let topic = self.topic;

        tokio::spawn(async move {
            let result = swarm.join(topic, request).await;
            let outcome = {
                let mut state = state.lock();
                match result {
                    Ok(()) => {
                        *state = ReplicationState::Joined { swarm };
                        Ok(())
                    }
                    Err(err) => {
                        *state = ReplicationState::Idle;
                        Err(BundleError::from(err))
                    }
                }
            };

            match &outcome {
                Ok(()) => {
                    info!("Announced on topic {}", topic);
                    logger.log(&BundleEvent::Announced);
                }
                Err(err) => {
                    warn!("Join failed: {}", err);
                    if let Some(on_failure) = on_failure {
                        on_failure(err.clone());
                    }
                }
            }
            let _ = done.send(outcome);
        });

        completion(settled)
    }

    fn spawn_leave(&self, swarm: Arc<dyn Swarm>, on_failure: Option<FailureCallback>) -> Completion {
        let (done, settled) = oneshot::channel();
        let state = Arc::clone(&self.state);
        let logger = Arc::clone(&self.logger);
        let topic = self.topic;

        tokio::spawn(async move {
            let result = swarm.leave(topic).await;
            let outcome = {
                let mut state = state.lock();
                match result {
                    Ok(()) => {
                        *state = ReplicationState::Idle;
                        Ok(())
                    }
                    Err(err) => {
                        *state = ReplicationState::Joined { swarm };
                        Err(BundleError::from(err))
                    }
                }
            };

            match &outcome {
                Ok(()) => {
                    info!("Left topic {}", topic);
                    logger.log(&BundleEvent::Left);
                }
                Err(err) => {
                    warn!("Leave failed: {}", err);
                    if let Some(on_failure) = on_failure {
                        on_failure(err.clone());
                    }
                }
            }
            let _ = done.send(outcome);
        });

        completion(settled)
    }
}

fn completion(settled: oneshot::Receiver<BundleResult<()>>) -> Completion {
    settled
        .map(|received| {
            received.unwrap_or_else(|_| Err(BundleError::task_failed("replication task dropped")))
        })
        .boxed()
        .shared()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bundlekit_core::{BundleKey, NoOpLogger};
    use bundlekit_harness::MockSwarm;
    use std::time::Duration;

    fn replication() -> Arc<Replication> {
        Arc::new(Replication::new(
            BundleKey::new([8; 32]).discovery_key(),
            Arc::new(NoOpLogger),
        ))
    }

    #[tokio::test]
    async fn test_join_and_leave_cycle() {
        let replication = replication();
        let swarm = Arc::new(MockSwarm::new());

        replication
            .join(swarm.clone(), &JoinOptions::default(), None)
            .await
            .unwrap();
        assert!(replication.is_joined());
        replication.join(swarm.clone(), &JoinOptions::default(), None).await.unwrap();
        assert_eq!(swarm.join_count(), 1);

        replication.leave(None).await.unwrap();
        assert_eq!(replication.state_name(), "idle");
        replication.leave(None).await.unwrap();
        assert_eq!(swarm.leave_count(), 1);
    }

    #[tokio::test]
    async fn test_leave_waits_for_join_in_flight() {
        let replication = replication();
        let swarm = Arc::new(MockSwarm::gated());

        let joining = {
            let replication = Arc::clone(&replication);
            let swarm = Arc::clone(&swarm);
            tokio::spawn(async move {
                replication.join(swarm, &JoinOptions::default(), None).await
            })
        };
        while replication.state_name() != "joining" {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let leaving = {
            let replication = Arc::clone(&replication);
            tokio::spawn(async move { replication.leave(None).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(swarm.leave_count(), 0);

        swarm.release_join();
        joining.await.unwrap().unwrap();
        leaving.await.unwrap().unwrap();
        assert_eq!(swarm.leave_count(), 1);
        assert_eq!(replication.state_name(), "idle");
    }

    #[tokio::test]
    async fn test_failed_join_returns_to_idle_and_reports() {
        let replication = replication();
        let swarm = Arc::new(MockSwarm::failing_joins());
        let (reported, mut receiver) = tokio::sync::mpsc::unbounded_channel::<BundleError>();
        let on_failure: FailureCallback = Box::new(move |err: BundleError| {
            let _ = reported.send(err);
        });

        let err = replication
            .join(
                swarm,
                &JoinOptions::default(),
                Some(on_failure),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BundleError::Replication(_)));
        assert_eq!(replication.state_name(), "idle");
        assert!(receiver.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_failed_leave_stays_joined() {
        let replication = replication();
        let swarm = Arc::new(MockSwarm::new());
        replication.join(swarm.clone(), &JoinOptions::default(), None).await.unwrap();

        swarm.fail_leaves(true);
        assert!(replication.leave(None).await.is_err());
        assert!(replication.is_joined());

        swarm.fail_leaves(false);
        replication.leave(None).await.unwrap();
        assert!(!replication.is_joined());
    }

    #[tokio::test]
    async fn test_invalid_seeders_start_nothing() {
        let replication = replication();
        let swarm = Arc::new(MockSwarm::new());
        let options = JoinOptions::default().with_seeders("zz");

        let err = replication.join(swarm.clone(), &options, None).await.unwrap_err();
        assert!(matches!(err, BundleError::MalformedInput { .. }));
        assert_eq!(swarm.join_count(), 0);
        assert_eq!(replication.state_name(), "idle");
    }
}
