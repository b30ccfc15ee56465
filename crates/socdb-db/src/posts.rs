//! Database operations for `posts`.
//!
//! A post can be matched by three identities: its canonical key, its
//! external post id, and its canonical URL. Each is unique per profile, and
//! an upsert merges into whichever existing row matches first, preferring the
//! external id.

use chrono::{DateTime, Utc};
use socdb_core::{CanonicalKey, KeyKind, PostRecord, UpsertOutcome};
use sqlx::{PgPool, Postgres, Transaction};

use crate::profiles::require_profile_id;
use crate::DbError;

/// Insert attempts before a post upsert gives up on a contended key.
const MAX_INSERT_RACES: u32 = 3;

/// A row from the `posts` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PostRow {
    pub id: i64,
    pub profile_id: i64,
    pub post_key: String,
    pub canonical_url: Option<String>,
    pub external_post_id: Option<String>,
    /// Feed position at last observation. Not stable across fetches.
    pub ordinal: Option<i32>,
    pub content: Option<String>,
    pub hashtags: Vec<String>,
    pub thumbnail_url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub like_count: Option<i64>,
    pub comment_count: Option<i64>,
    pub share_count: Option<i64>,
    pub view_count: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Creates or merges a post under its owning profile.
///
/// Runs in a transaction: the matching row (if any) is locked and merged;
/// otherwise a new row is inserted with `ON CONFLICT DO NOTHING`. Losing an
/// insert race to a concurrent writer rolls back and retries the match, so
/// exactly one caller observes `was_new = true` for a given post.
///
/// # Errors
///
/// Returns [`DbError::MissingParent`] if the profile is not stored,
/// [`DbError::UpsertContention`] if every insert attempt lost a race, or
/// [`DbError::Sqlx`] on query failure.
pub async fn upsert_post(pool: &PgPool, post: &PostRecord) -> Result<UpsertOutcome, DbError> {
    let key = post.key.to_string();

    for _ in 0..MAX_INSERT_RACES {
        let mut tx = pool.begin().await?;
        let profile_id = require_profile_id(&mut *tx, &post.profile_external_id).await?;

        let existing: Option<i64> = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM posts \
             WHERE profile_id = $1 \
               AND (post_key = $2 \
                    OR ($3::text IS NOT NULL AND external_post_id = $3) \
                    OR ($4::text IS NOT NULL AND canonical_url = $4)) \
             ORDER BY CASE WHEN external_post_id = $3 THEN 0 \
                           WHEN post_key = $2 THEN 1 \
                           ELSE 2 END, id \
             LIMIT 1 \
             FOR UPDATE",
        )
        .bind(profile_id)
        .bind(&key)
        .bind(&post.external_post_id)
        .bind(&post.canonical_url)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(id) = existing {
            merge_post(&mut tx, id, post).await?;
            tx.commit().await?;
            return Ok(UpsertOutcome { id, was_new: false });
        }

        let inserted: Option<i64> = sqlx::query_scalar::<_, i64>(
            "INSERT INTO posts \
                 (profile_id, post_key, canonical_url, external_post_id, ordinal, content, \
                  hashtags, thumbnail_url, published_at, \
                  like_count, comment_count, share_count, view_count) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
             ON CONFLICT DO NOTHING \
             RETURNING id",
        )
        .bind(profile_id)
        .bind(&key)
        .bind(&post.canonical_url)
        .bind(&post.external_post_id)
        .bind(post.ordinal)
        .bind(&post.content)
        .bind(&post.hashtags)
        .bind(&post.thumbnail_url)
        .bind(post.published_at)
        .bind(post.counts.likes)
        .bind(post.counts.comments)
        .bind(post.counts.shares)
        .bind(post.counts.views)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(id) = inserted {
            tx.commit().await?;
            return Ok(UpsertOutcome { id, was_new: true });
        }

        // A concurrent writer committed a row matching one of our identities.
        tx.rollback().await?;
    }

    Err(DbError::UpsertContention {
        key,
        attempts: MAX_INSERT_RACES,
    })
}

/// Merges `post` into the locked row `id`.
///
/// `post_key`, `created_at` and `published_at` are fixed once written. A
/// missing URL or external id is filled in unless another row of the same
/// profile already owns that value. Counters and content are refreshed only
/// by non-null incoming values.
async fn merge_post(
    tx: &mut Transaction<'_, Postgres>,
    id: i64,
    post: &PostRecord,
) -> Result<(), DbError> {
    sqlx::query(
        "UPDATE posts SET \
             canonical_url = COALESCE(posts.canonical_url, \
                 CASE WHEN NOT EXISTS (SELECT 1 FROM posts o \
                                       WHERE o.profile_id = posts.profile_id \
                                         AND o.canonical_url = $2::text) \
                      THEN $2::text END), \
             external_post_id = COALESCE(posts.external_post_id, \
                 CASE WHEN NOT EXISTS (SELECT 1 FROM posts o \
                                       WHERE o.profile_id = posts.profile_id \
                                         AND o.external_post_id = $3::text) \
                      THEN $3::text END), \
             ordinal       = COALESCE($4, posts.ordinal), \
             content       = COALESCE(NULLIF($5, ''), posts.content), \
             hashtags      = CASE WHEN cardinality($6::text[]) > 0 THEN $6::text[] \
                                  ELSE posts.hashtags END, \
             thumbnail_url = COALESCE($7, posts.thumbnail_url), \
             published_at  = COALESCE(posts.published_at, $8), \
             like_count    = COALESCE($9, posts.like_count), \
             comment_count = COALESCE($10, posts.comment_count), \
             share_count   = COALESCE($11, posts.share_count), \
             view_count    = COALESCE($12, posts.view_count), \
             updated_at    = NOW() \
         WHERE id = $1",
    )
    .bind(id)
    .bind(&post.canonical_url)
    .bind(&post.external_post_id)
    .bind(post.ordinal)
    .bind(&post.content)
    .bind(&post.hashtags)
    .bind(&post.thumbnail_url)
    .bind(post.published_at)
    .bind(post.counts.likes)
    .bind(post.counts.comments)
    .bind(post.counts.shares)
    .bind(post.counts.views)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Returns `true` if the profile has a post matching `key`.
///
/// An external-id key also matches a row stored under a different key that
/// has since learned that external id; likewise for URL keys.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails. A missing profile is not an
/// error: it simply has no posts.
pub async fn post_exists(
    pool: &PgPool,
    profile_external_id: &str,
    key: &CanonicalKey,
) -> Result<bool, DbError> {
    let (external_post_id, canonical_url) = match key.kind() {
        KeyKind::ExternalId => (Some(key.value()), None),
        KeyKind::Url => (None, Some(key.value())),
        KeyKind::Composite => (None, None),
    };

    let exists: bool = sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS ( \
             SELECT 1 FROM posts p JOIN profiles pr ON pr.id = p.profile_id \
             WHERE pr.external_id = $1 \
               AND (p.post_key = $2 \
                    OR ($3::text IS NOT NULL AND p.external_post_id = $3) \
                    OR ($4::text IS NOT NULL AND p.canonical_url = $4)))",
    )
    .bind(profile_external_id)
    .bind(key.to_string())
    .bind(external_post_id)
    .bind(canonical_url)
    .fetch_one(pool)
    .await?;

    Ok(exists)
}

/// Returns the post stored under `key` for the given profile.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn get_post_by_key(
    pool: &PgPool,
    profile_external_id: &str,
    key: &CanonicalKey,
) -> Result<Option<PostRow>, DbError> {
    let row = sqlx::query_as::<_, PostRow>(
        "SELECT p.id, p.profile_id, p.post_key, p.canonical_url, p.external_post_id, \
                p.ordinal, p.content, p.hashtags, p.thumbnail_url, p.published_at, \
                p.like_count, p.comment_count, p.share_count, p.view_count, \
                p.created_at, p.updated_at \
         FROM posts p JOIN profiles pr ON pr.id = p.profile_id \
         WHERE pr.external_id = $1 AND p.post_key = $2",
    )
    .bind(profile_external_id)
    .bind(key.to_string())
    .fetch_optional(pool)
    .await?;

    Ok(row)
}
