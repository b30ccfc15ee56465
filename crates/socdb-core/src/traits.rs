//! Storage seams the harvest loop is written against.
//!
//! The Postgres implementation lives in `socdb-db`; an in-memory one ships
//! with `socdb-harvest` for tests and dry runs.

use std::future::Future;

use crate::checkpoint::{HarvestCheckpoint, HarvestKey};
use crate::error::SinkError;
use crate::models::{Entity, EntityRef, ProfileRecord, UpsertOutcome};

/// Idempotent entity store keyed by canonical identity.
///
/// Implementations must:
///
/// - apply each `upsert` atomically for that one entity;
/// - never overwrite a stored value with `None` (merge, don't replace);
/// - keep identity and creation-time fields immutable once written;
/// - serialize same-key races through the store's own unique constraints
///   rather than in-process locks, reporting exactly one caller as `was_new`.
pub trait PersistenceSink: Send + Sync {
    /// Creates or merges the owning profile row.
    fn upsert_profile(
        &self,
        profile: &ProfileRecord,
    ) -> impl Future<Output = Result<UpsertOutcome, SinkError>> + Send;

    /// Creates or merges one entity.
    ///
    /// Returns [`SinkError::ReferentialGap`] when the owning profile, post,
    /// or parent comment has not been stored yet.
    fn upsert(&self, entity: &Entity)
        -> impl Future<Output = Result<UpsertOutcome, SinkError>> + Send;

    /// Returns `true` if an entity with this scoped key is already stored.
    fn exists(&self, entity: &EntityRef) -> impl Future<Output = Result<bool, SinkError>> + Send;
}

/// Durable store for [`HarvestCheckpoint`]s, one row per [`HarvestKey`].
pub trait CheckpointStore: Send + Sync {
    fn load_checkpoint(
        &self,
        key: &HarvestKey,
    ) -> impl Future<Output = Result<Option<HarvestCheckpoint>, SinkError>> + Send;

    /// Inserts or replaces the checkpoint for its key.
    fn save_checkpoint(
        &self,
        checkpoint: &HarvestCheckpoint,
    ) -> impl Future<Output = Result<(), SinkError>> + Send;
}
