//! Database operations for `followers`.

use chrono::{DateTime, Utc};
use socdb_core::{CanonicalKey, FollowerRecord, UpsertOutcome};
use sqlx::PgPool;

use crate::profiles::require_profile_id;
use crate::DbError;

/// A row from the `followers` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FollowerRow {
    pub id: i64,
    pub profile_id: i64,
    pub follower_key: String,
    pub handle: Option<String>,
    pub display_name: Option<String>,
    pub profile_url: Option<String>,
    pub is_active: bool,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Creates or refreshes a follower relationship.
///
/// Rediscovery reactivates the row and bumps `last_seen_at`.
///
/// # Errors
///
/// Returns [`DbError::MissingParent`] if the profile is not stored, or
/// [`DbError::Sqlx`] if the upsert fails.
pub async fn upsert_follower(
    pool: &PgPool,
    follower: &FollowerRecord,
) -> Result<UpsertOutcome, DbError> {
    let profile_id = require_profile_id(pool, &follower.profile_external_id).await?;

    let (id, was_new): (i64, bool) = sqlx::query_as(
        "INSERT INTO followers (profile_id, follower_key, handle, display_name, profile_url) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (profile_id, follower_key) DO UPDATE SET \
             handle       = COALESCE(EXCLUDED.handle, followers.handle), \
             display_name = COALESCE(EXCLUDED.display_name, followers.display_name), \
             profile_url  = COALESCE(EXCLUDED.profile_url, followers.profile_url), \
             is_active    = TRUE, \
             last_seen_at = NOW(), \
             updated_at   = NOW() \
         RETURNING id, (xmax = 0) AS is_new",
    )
    .bind(profile_id)
    .bind(follower.key.to_string())
    .bind(&follower.handle)
    .bind(&follower.display_name)
    .bind(&follower.profile_url)
    .fetch_one(pool)
    .await?;

    Ok(UpsertOutcome { id, was_new })
}

/// Returns `true` if `key` is a stored follower of the profile.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn follower_exists(
    pool: &PgPool,
    profile_external_id: &str,
    key: &CanonicalKey,
) -> Result<bool, DbError> {
    let exists = sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS ( \
             SELECT 1 FROM followers f JOIN profiles p ON p.id = f.profile_id \
             WHERE p.external_id = $1 AND f.follower_key = $2)",
    )
    .bind(profile_external_id)
    .bind(key.to_string())
    .fetch_one(pool)
    .await?;

    Ok(exists)
}

/// Marks the profile's followers not seen since `seen_before` as inactive.
///
/// Rows are never deleted; a later rediscovery reactivates them. Returns the
/// number of rows deactivated.
///
/// # Errors
///
/// Returns [`DbError::MissingParent`] if the profile is not stored, or
/// [`DbError::Sqlx`] if the update fails.
pub async fn deactivate_unseen_followers(
    pool: &PgPool,
    profile_external_id: &str,
    seen_before: DateTime<Utc>,
) -> Result<u64, DbError> {
    let profile_id = require_profile_id(pool, profile_external_id).await?;

    let result = sqlx::query(
        "UPDATE followers SET is_active = FALSE, updated_at = NOW() \
         WHERE profile_id = $1 AND is_active = TRUE AND last_seen_at < $2",
    )
    .bind(profile_id)
    .bind(seen_before)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Counts the profile's active followers.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn count_active_followers(
    pool: &PgPool,
    profile_external_id: &str,
) -> Result<i64, DbError> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM followers f JOIN profiles p ON p.id = f.profile_id \
         WHERE p.external_id = $1 AND f.is_active",
    )
    .bind(profile_external_id)
    .fetch_one(pool)
    .await?;

    Ok(count)
}
