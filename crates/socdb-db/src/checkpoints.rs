//! Database operations for `harvest_checkpoints`.

use chrono::{DateTime, Utc};
use socdb_core::{CheckpointStatus, CollectionType, HarvestCheckpoint, HarvestKey};
use sqlx::PgPool;

use crate::DbError;

/// A row from the `harvest_checkpoints` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CheckpointRow {
    pub target_id: String,
    pub collection_type: String,
    pub continuation_token: Option<String>,
    pub accepted_count: i64,
    pub no_progress_streak: i32,
    pub status: String,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<CheckpointRow> for HarvestCheckpoint {
    type Error = DbError;

    fn try_from(row: CheckpointRow) -> Result<Self, Self::Error> {
        let collection = row.collection_type.parse::<CollectionType>().map_err(|_| {
            DbError::InvalidStoredValue {
                column: "collection_type",
                value: row.collection_type.clone(),
            }
        })?;
        let status =
            row.status
                .parse::<CheckpointStatus>()
                .map_err(|_| DbError::InvalidStoredValue {
                    column: "status",
                    value: row.status.clone(),
                })?;

        Ok(HarvestCheckpoint {
            target_id: row.target_id,
            collection,
            continuation_token: row.continuation_token,
            accepted_count: u64::try_from(row.accepted_count).unwrap_or(0),
            no_progress_streak: u32::try_from(row.no_progress_streak).unwrap_or(0),
            status,
            updated_at: row.updated_at,
        })
    }
}

/// Loads the checkpoint for a (target, collection) pair.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails or
/// [`DbError::InvalidStoredValue`] if the row holds an unknown status.
pub async fn get_checkpoint(
    pool: &PgPool,
    key: &HarvestKey,
) -> Result<Option<HarvestCheckpoint>, DbError> {
    let row = sqlx::query_as::<_, CheckpointRow>(
        "SELECT target_id, collection_type, continuation_token, accepted_count, \
                no_progress_streak, status, updated_at \
         FROM harvest_checkpoints \
         WHERE target_id = $1 AND collection_type = $2",
    )
    .bind(&key.target_id)
    .bind(key.collection.as_str())
    .fetch_optional(pool)
    .await?;

    row.map(HarvestCheckpoint::try_from).transpose()
}

/// Inserts or replaces the checkpoint for its (target, collection) pair.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the upsert fails.
pub async fn save_checkpoint(pool: &PgPool, checkpoint: &HarvestCheckpoint) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO harvest_checkpoints \
             (target_id, collection_type, continuation_token, accepted_count, \
              no_progress_streak, status, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         ON CONFLICT (target_id, collection_type) DO UPDATE SET \
             continuation_token = EXCLUDED.continuation_token, \
             accepted_count     = EXCLUDED.accepted_count, \
             no_progress_streak = EXCLUDED.no_progress_streak, \
             status             = EXCLUDED.status, \
             updated_at         = EXCLUDED.updated_at",
    )
    .bind(&checkpoint.target_id)
    .bind(checkpoint.collection.as_str())
    .bind(&checkpoint.continuation_token)
    .bind(i64::try_from(checkpoint.accepted_count).unwrap_or(i64::MAX))
    .bind(i32::try_from(checkpoint.no_progress_streak).unwrap_or(i32::MAX))
    .bind(checkpoint.status.as_str())
    .bind(checkpoint.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Lists all checkpoints, most recently updated first.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails or
/// [`DbError::InvalidStoredValue`] if a row holds an unknown status.
pub async fn list_checkpoints(pool: &PgPool) -> Result<Vec<HarvestCheckpoint>, DbError> {
    let rows = sqlx::query_as::<_, CheckpointRow>(
        "SELECT target_id, collection_type, continuation_token, accepted_count, \
                no_progress_streak, status, updated_at \
         FROM harvest_checkpoints \
         ORDER BY updated_at DESC, target_id, collection_type",
    )
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(HarvestCheckpoint::try_from).collect()
}

/// Deletes the checkpoint so the next harvest starts fresh.
///
/// Returns `true` if a row was removed. Harvested entities are untouched.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the delete fails.
pub async fn reset_checkpoint(pool: &PgPool, key: &HarvestKey) -> Result<bool, DbError> {
    let result = sqlx::query(
        "DELETE FROM harvest_checkpoints WHERE target_id = $1 AND collection_type = $2",
    )
    .bind(&key.target_id)
    .bind(key.collection.as_str())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}
