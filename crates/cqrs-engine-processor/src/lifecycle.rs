//! Processor lifecycle: plain start/stop and leader-election-driven
//! operation.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use cqrs_engine_core::{EngineError, EngineResult};

use crate::processor::EventProcessor;

/// Handle to a running group or partition. Cancelling stops the loop;
/// waiting returns how it ended.
pub struct ProcessorHandle {
    token: CancellationToken,
    join: JoinHandle<EngineResult<()>>,
}

impl ProcessorHandle {
    pub(crate) fn new(token: CancellationToken, join: JoinHandle<EngineResult<()>>) -> Self {
        Self { token, join }
    }

    /// Request a prompt stop. In-flight handlers complete first.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Wait for the loop to end. `Ok` after a stop; `Err` carries the
    /// non-transient failure that took the processor down.
    pub async fn wait(self) -> EngineResult<()> {
        self.join.await.map_err(|e| EngineError::Transient {
            message: format!("processor task failed: {e}"),
        })?
    }
}

/// Start the given partition processors directly; they run until stopped.
pub fn start_processors(processors: Vec<Arc<EventProcessor>>) -> ProcessorHandle {
    let token = CancellationToken::new();
    let run_token = token.clone();
    let join = tokio::spawn(async move {
        let mut tasks = JoinSet::new();
        for processor in processors {
            let token = run_token.clone();
            tasks.spawn(processor.run(token));
        }
        let mut outcome: EngineResult<()> = Ok(());
        while let Some(joined) = tasks.join_next().await {
            if let Err(error) = flatten_join(joined) {
                // One partition going down takes the group handle with it.
                run_token.cancel();
                if outcome.is_ok() {
                    outcome = Err(error);
                }
            }
        }
        outcome
    });
    ProcessorHandle::new(token, join)
}

/// Distributed lock registry for leader election. One holder per name
/// across the fleet; the lock is released by dropping the guard.
#[async_trait]
pub trait LockRegistry: Send + Sync {
    async fn try_acquire(&self, name: &str) -> Option<LockGuard>;
}

/// RAII lock ownership.
pub struct LockGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockGuard {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Process-local lock registry: elects one leader among competing
/// lifecycles in the same process, and serves as the test double for an
/// external registry.
#[derive(Default)]
pub struct InMemoryLockRegistry {
    held: Arc<Mutex<HashSet<String>>>,
}

impl InMemoryLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockRegistry for InMemoryLockRegistry {
    async fn try_acquire(&self, name: &str) -> Option<LockGuard> {
        let mut held = self.held.lock().expect("lock registry poisoned");
        if !held.insert(name.to_string()) {
            return None;
        }
        let registry = Arc::clone(&self.held);
        let name = name.to_string();
        Some(LockGuard::new(move || {
            registry
                .lock()
                .expect("lock registry poisoned")
                .remove(&name);
        }))
    }
}

/// How often a non-leader retries the election.
pub const ELECTION_POLL_INTERVAL: Duration = Duration::from_millis(100);

fn flatten_join(
    joined: Result<EngineResult<()>, tokio::task::JoinError>,
) -> EngineResult<()> {
    joined.unwrap_or_else(|e| {
        Err(EngineError::Transient {
            message: format!("processor task failed: {e}"),
        })
    })
}

/// Run the group's partitions only while holding the group lock. Losing a
/// run (non-transient failure) releases the lock and rejoins the
/// election after the poll interval.
pub fn start_leader_elected(
    group: String,
    registry: Arc<dyn LockRegistry>,
    processors: Vec<Arc<EventProcessor>>,
    poll_interval: Duration,
) -> ProcessorHandle {
    let token = CancellationToken::new();
    let run_token = token.clone();
    let join = tokio::spawn(async move {
        loop {
            if run_token.is_cancelled() {
                return Ok(());
            }
            if let Some(guard) = registry.try_acquire(&group).await {
                tracing::info!(group = %group, "acquired leadership");
                let mut inner = start_processors(processors.clone());
                let mut finished = false;
                let mut outcome: EngineResult<()> = Ok(());
                tokio::select! {
                    _ = run_token.cancelled() => {
                        inner.token.cancel();
                    }
                    joined = &mut inner.join => {
                        finished = true;
                        outcome = flatten_join(joined);
                    }
                }
                if !finished {
                    outcome = flatten_join((&mut inner.join).await);
                }
                drop(guard);
                tracing::info!(group = %group, "released leadership");
                if run_token.is_cancelled() {
                    return outcome;
                }
                if let Err(error) = outcome {
                    tracing::error!(group = %group, error = %error, "leader run failed");
                }
            }
            tokio::select! {
                _ = run_token.cancelled() => return Ok(()),
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    });
    ProcessorHandle::new(token, join)
}
