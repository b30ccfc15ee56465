//! [`PgStore`]: the Postgres-backed [`PersistenceSink`] and [`CheckpointStore`].

use socdb_core::{
    CheckpointStore, Entity, EntityRef, HarvestCheckpoint, HarvestKey, PersistenceSink,
    ProfileRecord, SinkError, UpsertOutcome,
};
use sqlx::PgPool;

use crate::{checkpoints, comments, followers, posts, profiles};

/// Cheap to clone; clones share the pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl PersistenceSink for PgStore {
    async fn upsert_profile(&self, profile: &ProfileRecord) -> Result<UpsertOutcome, SinkError> {
        Ok(profiles::upsert_profile(&self.pool, profile).await?)
    }

    async fn upsert(&self, entity: &Entity) -> Result<UpsertOutcome, SinkError> {
        let outcome = match entity {
            Entity::Post(post) => posts::upsert_post(&self.pool, post).await?,
            Entity::Comment(comment) => comments::upsert_comment(&self.pool, comment).await?,
            Entity::Follower(follower) => followers::upsert_follower(&self.pool, follower).await?,
        };
        Ok(outcome)
    }

    async fn exists(&self, entity: &EntityRef) -> Result<bool, SinkError> {
        let exists = match entity {
            EntityRef::Post {
                profile_external_id,
                key,
            } => posts::post_exists(&self.pool, profile_external_id, key).await?,
            EntityRef::Comment { post, key } => {
                comments::comment_exists(&self.pool, post, key).await?
            }
            EntityRef::Follower {
                profile_external_id,
                key,
            } => followers::follower_exists(&self.pool, profile_external_id, key).await?,
        };
        Ok(exists)
    }
}

impl CheckpointStore for PgStore {
    async fn load_checkpoint(
        &self,
        key: &HarvestKey,
    ) -> Result<Option<HarvestCheckpoint>, SinkError> {
        Ok(checkpoints::get_checkpoint(&self.pool, key).await?)
    }

    async fn save_checkpoint(&self, checkpoint: &HarvestCheckpoint) -> Result<(), SinkError> {
        Ok(checkpoints::save_checkpoint(&self.pool, checkpoint).await?)
    }
}
