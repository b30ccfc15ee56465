//! The harvest loop.
//!
//! One loop walks one (target, collection): load the checkpoint, then
//! fetch → resolve → persist → decide until the policy says stop, saving the
//! checkpoint after every batch. Cancellation is checked before each fetch
//! and before each persist, and leaves the checkpoint resumable.
//!
//! A comments batch also walks the reply thread under every top-level
//! comment that reports replies, before the batch's checkpoint is saved. A
//! run cancelled mid-thread refetches the batch and its threads on resume.

use std::collections::{HashSet, VecDeque};

use chrono::Utc;
use socdb_core::{
    CheckpointStatus, CheckpointStore, CollectionType, CommentRecord, Entity, EntityRef,
    HarvestCheckpoint, HarvestKey, PersistenceSink, ProfileRecord, SinkError,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::HarvestError;
use crate::governor::Governor;
use crate::harvester::{HarvestOptions, HarvestState, HarvestStatus};
use crate::policy::{BatchResult, Decision, TerminationPolicy};
use crate::resolve::HarvestTarget;
use crate::source::{ContinuationToken, PageSource, RawBatch};

/// An item whose parent row was missing when it was written.
struct DeferredItem {
    entity: Entity,
    retries: u32,
}

/// Runs one harvest to a terminal state on the current task.
///
/// Progress is published on `status` after every batch. Returns the final
/// state; `Errored` is reported as `Err` after the checkpoint has been saved
/// with status `errored`.
///
/// # Errors
///
/// Returns [`HarvestError`] when a source call or sink write fails for good.
pub async fn run_harvest<S, P>(
    target: &HarvestTarget,
    store: &S,
    source: &P,
    options: &HarvestOptions,
    cancel: &CancellationToken,
    status: &watch::Sender<HarvestStatus>,
) -> Result<HarvestState, HarvestError>
where
    S: PersistenceSink + CheckpointStore,
    P: PageSource,
{
    Controller {
        target,
        store,
        source,
        options,
        cancel,
        status,
        governor: Governor::new(options.governor),
        checkpoint: HarvestCheckpoint::start(&HarvestKey::new(target.id.clone(), target.collection)),
        checkpoint_loaded: false,
        token: None,
        seen: HashSet::new(),
        deferred: VecDeque::new(),
        progress: HarvestStatus::default(),
    }
    .run()
    .await
}

struct Controller<'a, S, P> {
    target: &'a HarvestTarget,
    store: &'a S,
    source: &'a P,
    options: &'a HarvestOptions,
    cancel: &'a CancellationToken,
    status: &'a watch::Sender<HarvestStatus>,
    governor: Governor,
    checkpoint: HarvestCheckpoint,
    checkpoint_loaded: bool,
    token: Option<ContinuationToken>,
    /// Keys handled by this invocation. Repeats count as duplicate occurrences.
    seen: HashSet<EntityRef>,
    deferred: VecDeque<DeferredItem>,
    progress: HarvestStatus,
}

/// External ids of the top-level comments that report replies.
fn reply_parents(entities: &[Entity]) -> Vec<String> {
    entities
        .iter()
        .filter_map(|entity| match entity {
            Entity::Comment(CommentRecord {
                parent_key: None,
                external_comment_id: Some(id),
                reply_count: Some(replies),
                ..
            }) if *replies > 0 => Some(id.clone()),
            _ => None,
        })
        .collect()
}

fn finished(decision: Decision) -> HarvestState {
    match decision {
        Decision::Continue => HarvestState::Running,
        Decision::Done => HarvestState::Done,
        Decision::Capped => HarvestState::Capped,
        Decision::Stalled => HarvestState::Stalled,
    }
}

impl<S, P> Controller<'_, S, P>
where
    S: PersistenceSink + CheckpointStore,
    P: PageSource,
{
    async fn run(mut self) -> Result<HarvestState, HarvestError> {
        self.progress.state = HarvestState::Running;
        self.publish();

        match self.drive().await {
            Ok(state) => Ok(state),
            Err(err) => {
                self.fail(&err).await;
                Err(err)
            }
        }
    }

    async fn drive(&mut self) -> Result<HarvestState, HarvestError> {
        if let Some(prior) = self.init().await? {
            return Ok(prior);
        }
        self.ensure_profile().await?;

        loop {
            if self.cancel.is_cancelled() {
                return self.cancelled().await;
            }
            self.progress.iterations += 1;
            tracing::debug!(iteration = self.progress.iterations, "fetching");
            let Some(batch) = self.fetch().await? else {
                return self.cancelled().await;
            };

            let entities = self.resolve(&batch);
            let threads = reply_parents(&entities);

            if self.cancel.is_cancelled() {
                return self.cancelled().await;
            }
            let (mut net_new, truncated) = self.persist(entities).await?;

            if !truncated {
                let Some(replies) = self.harvest_replies(threads).await? else {
                    return self.cancelled().await;
                };
                net_new += replies;
            }

            let decision = self.decide(&batch, net_new, truncated);
            if decision == Decision::Continue {
                self.save().await?;
                self.publish();
                continue;
            }
            return self.finish(decision).await;
        }
    }

    /// Loads the stored checkpoint and applies the resume rules. Returns the
    /// prior terminal state when there is nothing to do.
    async fn init(&mut self) -> Result<Option<HarvestState>, HarvestError> {
        let key = self.checkpoint.key();
        let store = self.store;
        let stored = self
            .governor
            .call_sink(|| store.load_checkpoint(&key))
            .await?;
        self.checkpoint_loaded = true;

        let resumed = match stored {
            Some(prior) if !self.options.force_restart => match prior.status {
                CheckpointStatus::Done => {
                    tracing::info!(
                        accepted = prior.accepted_count,
                        "harvest already done, nothing to do without a forced restart"
                    );
                    self.progress.items_accepted = prior.accepted_count;
                    self.progress.state = HarvestState::Done;
                    self.checkpoint = prior;
                    self.publish();
                    return Ok(Some(HarvestState::Done));
                }
                CheckpointStatus::InProgress => prior,
                CheckpointStatus::Capped | CheckpointStatus::Stalled | CheckpointStatus::Errored => {
                    HarvestCheckpoint {
                        no_progress_streak: 0,
                        status: CheckpointStatus::InProgress,
                        ..prior
                    }
                }
            },
            Some(_) | None => HarvestCheckpoint::start(&key),
        };
        self.checkpoint = resumed;

        self.token = match self
            .checkpoint
            .continuation_token
            .as_deref()
            .map(ContinuationToken::decode)
        {
            Some(Ok(token)) => Some(token),
            Some(Err(e)) => {
                tracing::warn!(
                    error = %e,
                    "stored continuation token unreadable, starting from the beginning"
                );
                None
            }
            None => None,
        };

        self.save().await?;
        tracing::debug!(
            resumed = self.token.is_some(),
            accepted = self.checkpoint.accepted_count,
            "checkpoint loaded"
        );
        Ok(None)
    }

    /// Posts and followers hang off a profile row; make sure it exists.
    async fn ensure_profile(&mut self) -> Result<(), HarvestError> {
        if self.target.collection == CollectionType::Comments {
            return Ok(());
        }
        let profile = ProfileRecord {
            external_id: self.target.id.clone(),
            platform: self.target.platform.clone(),
            ..self.options.profile.clone().unwrap_or_default()
        };
        let store = self.store;
        self.governor
            .call_sink(|| store.upsert_profile(&profile))
            .await?;
        Ok(())
    }

    /// `None` when cancelled while waiting on the source.
    async fn fetch(&mut self) -> Result<Option<RawBatch>, HarvestError> {
        let source = self.source;
        let cancel = self.cancel;
        let token = self.token.clone();
        tokio::select! {
            biased;
            () = cancel.cancelled() => Ok(None),
            fetched = self.governor.call_source(|| source.fetch(token.as_ref())) => Ok(Some(fetched?)),
        }
    }

    /// One page of the reply thread under `parent`. `None` when cancelled.
    async fn fetch_replies(
        &mut self,
        parent: &str,
        token: Option<&ContinuationToken>,
    ) -> Result<Option<Option<RawBatch>>, HarvestError> {
        let source = self.source;
        let cancel = self.cancel;
        tokio::select! {
            biased;
            () = cancel.cancelled() => Ok(None),
            fetched = self.governor.call_source(|| source.fetch_replies(parent, token)) => {
                Ok(Some(fetched?))
            }
        }
    }

    /// Walks the reply thread under each parent comment and persists the
    /// replies. Returns the net-new count, or `None` when cancelled.
    ///
    /// A thread ends when the source reports no more pages, stops advancing
    /// its cursor, or hits the page limit.
    async fn harvest_replies(
        &mut self,
        parents: Vec<String>,
    ) -> Result<Option<u64>, HarvestError> {
        let mut net_new = 0;
        if self.options.max_reply_pages == 0 || !self.source.has_reply_threads() {
            return Ok(Some(net_new));
        }

        'threads: for parent in parents {
            let mut token: Option<ContinuationToken> = None;
            for page in 1..=self.options.max_reply_pages {
                if self.cancel.is_cancelled() || self.cap_reached() {
                    break 'threads;
                }
                let Some(fetched) = self.fetch_replies(&parent, token.as_ref()).await? else {
                    return Ok(None);
                };
                let Some(mut batch) = fetched else {
                    break 'threads;
                };

                for item in &mut batch.items {
                    let top_level = item
                        .parent_id
                        .as_deref()
                        .map_or(true, |p| p.trim().is_empty() || p == "0");
                    if top_level {
                        item.parent_id = Some(parent.clone());
                    }
                }
                let entities = self.resolve(&batch);
                let (new, _) = self.persist(entities).await?;
                net_new += new;
                tracing::debug!(
                    %parent,
                    page,
                    items = batch.items.len(),
                    net_new = new,
                    "reply page persisted"
                );

                match batch.next {
                    Some(next) if !batch.complete && !next.repeats(token.as_ref()) => {
                        token = Some(next);
                    }
                    _ => break,
                }
            }
        }

        if self.cancel.is_cancelled() {
            return Ok(None);
        }
        Ok(Some(net_new))
    }

    fn resolve(&mut self, batch: &RawBatch) -> Vec<Entity> {
        let mut entities = Vec::with_capacity(batch.items.len());
        for item in &batch.items {
            match self.options.resolver.resolve(self.target, item) {
                Ok(entity) => entities.push(entity),
                Err(e) => {
                    self.progress.items_rejected += 1;
                    tracing::warn!(error = %e, ordinal = ?item.ordinal, "skipping item");
                }
            }
        }
        entities
    }

    fn cap_reached(&self) -> bool {
        let max = self.options.policy.max_items;
        max > 0 && self.checkpoint.accepted_count >= max
    }

    /// Writes a batch. Returns the net-new count and whether the batch was
    /// cut short by the item cap.
    async fn persist(&mut self, entities: Vec<Entity>) -> Result<(u64, bool), HarvestError> {
        let mut net_new = 0;
        let mut truncated = false;

        for entity in entities {
            if self.cap_reached() {
                truncated = true;
                break;
            }
            if !self.seen.insert(entity.entity_ref()) {
                self.progress.duplicate_occurrences += 1;
                continue;
            }
            if !self.options.refresh_known && self.is_known(&entity).await? {
                continue;
            }
            let written = self.upsert(&entity).await;
            match written {
                Ok(true) => net_new += 1,
                Ok(false) => {}
                Err(SinkError::ReferentialGap { parent }) => {
                    tracing::debug!(key = %entity.key(), %parent, "parent not stored yet, deferring");
                    self.deferred.push_back(DeferredItem { entity, retries: 0 });
                }
                Err(e) => return Err(e.into()),
            }
        }

        net_new += self.retry_deferred(false).await?;
        Ok((net_new, truncated))
    }

    async fn is_known(&mut self, entity: &Entity) -> Result<bool, HarvestError> {
        let entity_ref = entity.entity_ref();
        let store = self.store;
        Ok(self
            .governor
            .call_sink(|| store.exists(&entity_ref))
            .await?)
    }

    /// Upserts one entity and returns whether it was new.
    async fn upsert(&mut self, entity: &Entity) -> Result<bool, SinkError> {
        let store = self.store;
        let outcome = self.governor.call_sink(|| store.upsert(entity)).await?;
        if outcome.was_new {
            self.checkpoint.accepted_count += 1;
        }
        Ok(outcome.was_new)
    }

    /// Retries every deferred item once. On the final pass nothing is put
    /// back: what still fails is dropped.
    async fn retry_deferred(&mut self, final_pass: bool) -> Result<u64, HarvestError> {
        let mut net_new = 0;
        for mut item in std::mem::take(&mut self.deferred) {
            if self.cap_reached() {
                if final_pass {
                    self.drop_deferred(&item, "item cap reached");
                } else {
                    self.deferred.push_back(item);
                }
                continue;
            }
            let written = self.upsert(&item.entity).await;
            match written {
                Ok(true) => net_new += 1,
                Ok(false) => {}
                Err(SinkError::ReferentialGap { parent }) => {
                    item.retries += 1;
                    if final_pass || item.retries >= self.options.max_deferred_retries {
                        self.drop_deferred(&item, &format!("{parent} never appeared"));
                    } else {
                        self.deferred.push_back(item);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(net_new)
    }

    fn drop_deferred(&mut self, item: &DeferredItem, reason: &str) {
        self.progress.dropped += 1;
        self.progress.items_rejected += 1;
        tracing::warn!(
            key = %item.entity.key(),
            retries = item.retries,
            reason,
            "dropping deferred item"
        );
    }

    fn decide(&mut self, batch: &RawBatch, net_new: u64, truncated: bool) -> Decision {
        let result = BatchResult {
            net_new,
            accepted_total: self.checkpoint.accepted_count,
            iteration: self.progress.iterations,
            complete: batch.complete,
            end_signal: self.source.is_end_signal(batch),
            has_next: batch.next.is_some(),
            token_repeated: batch
                .next
                .as_ref()
                .is_some_and(|next| next.repeats(self.token.as_ref())),
        };
        let streak = TerminationPolicy::next_streak(self.checkpoint.no_progress_streak, &result);
        let decision = self.options.policy.decide(&result, streak);

        self.checkpoint.no_progress_streak = streak;
        // A cut-short batch is refetched on resume, so the token stays put.
        if !truncated {
            if let Some(next) = &batch.next {
                self.token = Some(next.clone());
            }
        }
        self.checkpoint.continuation_token = self.token.as_ref().map(ContinuationToken::encode);

        tracing::debug!(
            iteration = result.iteration,
            items = batch.items.len(),
            net_new,
            streak,
            accepted = result.accepted_total,
            ?decision,
            "batch persisted"
        );
        decision
    }

    async fn finish(&mut self, decision: Decision) -> Result<HarvestState, HarvestError> {
        self.retry_deferred(true).await?;
        self.checkpoint.status = decision.checkpoint_status();
        self.save().await?;

        let state = finished(decision);
        self.progress.state = state;
        self.publish();
        tracing::info!(
            state = %state,
            accepted = self.checkpoint.accepted_count,
            rejected = self.progress.items_rejected,
            iterations = self.progress.iterations,
            duplicates = self.progress.duplicate_occurrences,
            "harvest finished"
        );
        Ok(state)
    }

    async fn cancelled(&mut self) -> Result<HarvestState, HarvestError> {
        self.checkpoint.status = CheckpointStatus::InProgress;
        self.save().await?;
        self.progress.state = HarvestState::Cancelled;
        self.publish();
        tracing::info!(
            accepted = self.checkpoint.accepted_count,
            "harvest cancelled, checkpoint kept for resume"
        );
        Ok(HarvestState::Cancelled)
    }

    async fn fail(&mut self, err: &HarvestError) {
        // Without a loaded checkpoint a save would clobber the stored one.
        if self.checkpoint_loaded {
            self.checkpoint.status = CheckpointStatus::Errored;
            if let Err(save_err) = self.save().await {
                tracing::error!(error = %save_err, "failed to save errored checkpoint");
            }
        }
        self.progress.state = HarvestState::Errored;
        self.progress.last_error = Some(err.to_string());
        self.publish();
        tracing::error!(
            error = %err,
            accepted = self.checkpoint.accepted_count,
            "harvest errored"
        );
    }

    async fn save(&mut self) -> Result<(), HarvestError> {
        self.checkpoint.updated_at = Utc::now();
        let checkpoint = self.checkpoint.clone();
        let store = self.store;
        self.governor
            .call_sink(|| store.save_checkpoint(&checkpoint))
            .await?;
        Ok(())
    }

    fn publish(&mut self) {
        self.progress.items_accepted = self.checkpoint.accepted_count;
        self.progress.deferred = self.deferred.len();
        self.status.send_replace(self.progress.clone());
    }
}

#[cfg(test)]
#[path = "controller_test.rs"]
mod tests;
