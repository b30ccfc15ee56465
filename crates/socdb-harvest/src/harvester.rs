//! Starting, observing, and cancelling harvests.
//!
//! A [`Harvester`] owns the shared store and a worker pool. Each
//! [`Harvester::start`] spawns one loop on the Tokio runtime and returns a
//! [`HarvestHandle`] for status and cancellation. At most one loop per
//! (target, collection) runs in a process at a time.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use socdb_core::{AppConfig, CheckpointStore, HarvestKey, PersistenceSink, ProfileRecord};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::controller::run_harvest;
use crate::error::HarvestError;
use crate::governor::GovernorConfig;
use crate::policy::TerminationPolicy;
use crate::resolve::{HarvestTarget, IdentityResolver};
use crate::source::PageSource;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HarvestState {
    /// Waiting for a worker slot.
    #[default]
    Pending,
    Running,
    Done,
    Capped,
    Stalled,
    Errored,
    /// Stopped on request. The checkpoint is left resumable.
    Cancelled,
}

impl HarvestState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, HarvestState::Pending | HarvestState::Running)
    }
}

impl fmt::Display for HarvestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HarvestState::Pending => "pending",
            HarvestState::Running => "running",
            HarvestState::Done => "done",
            HarvestState::Capped => "capped",
            HarvestState::Stalled => "stalled",
            HarvestState::Errored => "errored",
            HarvestState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of one harvest.
///
/// `items_accepted` is read from the checkpoint and spans every run of the
/// same (target, collection). Every other counter covers this run only and
/// starts at zero on resume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HarvestStatus {
    pub state: HarvestState,
    /// Cumulative net-new items, including earlier runs of the same checkpoint.
    pub items_accepted: u64,
    /// Malformed items plus dropped deferred items seen by this run.
    pub items_rejected: u64,
    pub last_error: Option<String>,
    /// Batches fetched by this run.
    pub iterations: u32,
    /// Items waiting on a parent row.
    pub deferred: usize,
    /// Deferred items this run gave up on.
    pub dropped: u64,
    /// Raw items whose key was already handled earlier in this run.
    pub duplicate_occurrences: u64,
}

#[derive(Debug, Clone)]
pub struct HarvestOptions {
    /// Discard the stored checkpoint and start from the beginning.
    pub force_restart: bool,
    /// Re-upsert items the store already has, refreshing their counters.
    /// When `false`, known items are skipped after an existence check.
    pub refresh_known: bool,
    pub policy: TerminationPolicy,
    pub governor: GovernorConfig,
    pub max_deferred_retries: u32,
    /// Page limit for each comment reply thread. `0` skips reply threads.
    pub max_reply_pages: u32,
    /// Display fields for the owning profile (posts and followers only).
    pub profile: Option<ProfileRecord>,
    pub resolver: IdentityResolver,
}

impl Default for HarvestOptions {
    fn default() -> Self {
        Self {
            force_restart: false,
            refresh_known: true,
            policy: TerminationPolicy::default(),
            governor: GovernorConfig::default(),
            max_deferred_retries: 3,
            max_reply_pages: 200,
            profile: None,
            resolver: IdentityResolver::default(),
        }
    }
}

impl HarvestOptions {
    #[must_use]
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            policy: TerminationPolicy {
                max_items: config.harvest_max_items,
                max_iterations: config.harvest_max_iterations,
                stall_threshold: config.harvest_stall_threshold,
            },
            governor: GovernorConfig::from_app_config(config),
            max_deferred_retries: config.harvest_max_deferred_retries,
            ..Self::default()
        }
    }
}

/// Handle to one spawned harvest.
#[derive(Debug)]
pub struct HarvestHandle {
    id: Uuid,
    key: HarvestKey,
    status: watch::Receiver<HarvestStatus>,
    cancel: CancellationToken,
    task: JoinHandle<Result<HarvestState, HarvestError>>,
}

impl HarvestHandle {
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn key(&self) -> &HarvestKey {
        &self.key
    }

    #[must_use]
    pub fn status(&self) -> HarvestStatus {
        self.status.borrow().clone()
    }

    /// A receiver that is notified on every status change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<HarvestStatus> {
        self.status.clone()
    }

    /// Requests cooperative cancellation. Returns immediately.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The token [`cancel`](Self::cancel) trips, for cancelling after the
    /// handle has been consumed by [`wait`](Self::wait).
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for the loop to reach a terminal state.
    ///
    /// # Errors
    ///
    /// Returns the loop's [`HarvestError`], or [`HarvestError::Task`] if the
    /// task panicked or was aborted.
    pub async fn wait(self) -> Result<HarvestState, HarvestError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(HarvestError::Task {
                key: self.key,
                reason: e.to_string(),
            }),
        }
    }
}

/// Removes a key from the running set when its task ends, however it ends.
struct RunningGuard {
    running: Arc<Mutex<HashSet<HarvestKey>>>,
    key: HarvestKey,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

pub struct Harvester<S> {
    store: Arc<S>,
    permits: Arc<Semaphore>,
    running: Arc<Mutex<HashSet<HarvestKey>>>,
}

impl<S> Clone for Harvester<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            permits: Arc::clone(&self.permits),
            running: Arc::clone(&self.running),
        }
    }
}

impl<S> Harvester<S>
where
    S: PersistenceSink + CheckpointStore + 'static,
{
    /// `max_concurrent` loops run at once; further starts wait as `Pending`.
    pub fn new(store: S, max_concurrent: usize) -> Self {
        Self::from_arc(Arc::new(store), max_concurrent)
    }

    pub fn from_arc(store: Arc<S>, max_concurrent: usize) -> Self {
        Self {
            store,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            running: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Whether a loop for `key` is active in this process.
    #[must_use]
    pub fn is_running(&self, key: &HarvestKey) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }

    /// Spawns a harvest loop for `target`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::AlreadyRunning`] if a loop for the same
    /// (target, collection) is active.
    pub fn start<P>(
        &self,
        target: HarvestTarget,
        source: P,
        options: HarvestOptions,
    ) -> Result<HarvestHandle, HarvestError>
    where
        P: PageSource + 'static,
    {
        let key = HarvestKey::new(target.id.clone(), target.collection);
        if !self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone())
        {
            return Err(HarvestError::AlreadyRunning { key });
        }
        let guard = RunningGuard {
            running: Arc::clone(&self.running),
            key: key.clone(),
        };

        let (status_tx, status_rx) = watch::channel(HarvestStatus::default());
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let store = Arc::clone(&self.store);
        let permits = Arc::clone(&self.permits);
        let span = tracing::info_span!(
            "harvest",
            target_id = %key.target_id,
            collection = %key.collection
        );
        let task_key = key.clone();

        let task = tokio::spawn(
            async move {
                let _guard = guard;
                let _permit = tokio::select! {
                    biased;
                    () = task_cancel.cancelled() => {
                        status_tx.send_modify(|s| s.state = HarvestState::Cancelled);
                        return Ok(HarvestState::Cancelled);
                    }
                    permit = permits.acquire_owned() => permit.map_err(|e| HarvestError::Task {
                        key: task_key,
                        reason: e.to_string(),
                    })?,
                };
                run_harvest(
                    &target,
                    store.as_ref(),
                    &source,
                    &options,
                    &task_cancel,
                    &status_tx,
                )
                .await
            }
            .instrument(span),
        );

        tracing::debug!(key = %key, "harvest spawned");
        Ok(HarvestHandle {
            id: Uuid::new_v4(),
            key,
            status: status_rx,
            cancel,
            task,
        })
    }

    #[must_use]
    pub fn status(&self, handle: &HarvestHandle) -> HarvestStatus {
        handle.status()
    }

    pub fn cancel(&self, handle: &HarvestHandle) {
        handle.cancel();
    }
}
