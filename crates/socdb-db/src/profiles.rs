//! Database operations for `profiles`.

use chrono::{DateTime, Utc};
use socdb_core::{ProfileRecord, UpsertOutcome};
use sqlx::PgPool;

use crate::DbError;

/// A row from the `profiles` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProfileRow {
    pub id: i64,
    pub external_id: String,
    pub platform: String,
    pub username: Option<String>,
    pub display_name: Option<String>,
    pub bio: Option<String>,
    pub profile_url: Option<String>,
    pub follower_count: Option<i64>,
    pub following_count: Option<i64>,
    pub like_count: Option<i64>,
    pub post_count: Option<i64>,
    pub is_verified: Option<bool>,
    pub attributes: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Creates or merges a profile keyed by `external_id`.
///
/// `platform` and `created_at` are fixed by the first write. Every other
/// column is overwritten only when the incoming value is non-null, so a
/// partial fetch never blanks previously stored data.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the upsert fails.
pub async fn upsert_profile(
    pool: &PgPool,
    profile: &ProfileRecord,
) -> Result<UpsertOutcome, DbError> {
    let (id, was_new): (i64, bool) = sqlx::query_as(
        "INSERT INTO profiles \
             (external_id, platform, username, display_name, bio, profile_url, \
              follower_count, following_count, like_count, post_count, is_verified, attributes) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
         ON CONFLICT (external_id) DO UPDATE SET \
             username        = COALESCE(EXCLUDED.username, profiles.username), \
             display_name    = COALESCE(EXCLUDED.display_name, profiles.display_name), \
             bio             = COALESCE(EXCLUDED.bio, profiles.bio), \
             profile_url     = COALESCE(EXCLUDED.profile_url, profiles.profile_url), \
             follower_count  = COALESCE(EXCLUDED.follower_count, profiles.follower_count), \
             following_count = COALESCE(EXCLUDED.following_count, profiles.following_count), \
             like_count      = COALESCE(EXCLUDED.like_count, profiles.like_count), \
             post_count      = COALESCE(EXCLUDED.post_count, profiles.post_count), \
             is_verified     = COALESCE(EXCLUDED.is_verified, profiles.is_verified), \
             attributes      = COALESCE(EXCLUDED.attributes, profiles.attributes), \
             updated_at      = NOW() \
         RETURNING id, (xmax = 0) AS is_new",
    )
    .bind(&profile.external_id)
    .bind(&profile.platform)
    .bind(&profile.username)
    .bind(&profile.display_name)
    .bind(&profile.bio)
    .bind(&profile.profile_url)
    .bind(profile.follower_count)
    .bind(profile.following_count)
    .bind(profile.like_count)
    .bind(profile.post_count)
    .bind(profile.is_verified)
    .bind(&profile.attributes)
    .fetch_one(pool)
    .await?;

    Ok(UpsertOutcome { id, was_new })
}

/// Returns the profile with the given external id, if stored.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn get_profile_by_external_id(
    pool: &PgPool,
    external_id: &str,
) -> Result<Option<ProfileRow>, DbError> {
    let row = sqlx::query_as::<_, ProfileRow>(
        "SELECT id, external_id, platform, username, display_name, bio, profile_url, \
                follower_count, following_count, like_count, post_count, is_verified, \
                attributes, created_at, updated_at \
         FROM profiles WHERE external_id = $1",
    )
    .bind(external_id)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Looks up a profile's internal id, failing with [`DbError::MissingParent`]
/// when the profile has not been stored yet.
pub(crate) async fn require_profile_id<'e, E>(executor: E, external_id: &str) -> Result<i64, DbError>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query_scalar::<_, i64>("SELECT id FROM profiles WHERE external_id = $1")
        .bind(external_id)
        .fetch_optional(executor)
        .await?
        .ok_or_else(|| DbError::MissingParent {
            parent: format!("profile {external_id}"),
        })
}
