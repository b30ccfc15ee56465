//! Database operations for `comments`.

use chrono::{DateTime, Utc};
use socdb_core::{CanonicalKey, CommentRecord, PostRef, UpsertOutcome};
use sqlx::PgPool;

use crate::DbError;

/// A row from the `comments` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CommentRow {
    pub id: i64,
    pub post_id: i64,
    pub comment_key: String,
    pub parent_comment_id: Option<i64>,
    pub external_comment_id: Option<String>,
    pub author: Option<String>,
    pub body: Option<String>,
    pub like_count: Option<i64>,
    pub reply_count: Option<i64>,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Resolves a [`PostRef`] to the stored post's id.
///
/// The external post id is tried first, then the canonical URL.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn find_post_id<'e, E>(executor: E, post: &PostRef) -> Result<Option<i64>, DbError>
where
    E: sqlx::PgExecutor<'e>,
{
    if post.external_post_id.is_none() && post.canonical_url.is_none() {
        return Ok(None);
    }

    let id = sqlx::query_scalar::<_, i64>(
        "SELECT id FROM posts \
         WHERE ($1::text IS NOT NULL AND external_post_id = $1) \
            OR ($2::text IS NOT NULL AND canonical_url = $2) \
         ORDER BY CASE WHEN external_post_id = $1 THEN 0 ELSE 1 END, id \
         LIMIT 1",
    )
    .bind(&post.external_post_id)
    .bind(&post.canonical_url)
    .fetch_optional(executor)
    .await?;

    Ok(id)
}

/// Creates or merges a comment (or reply) under its post.
///
/// Fails with [`DbError::MissingParent`] when the post, or for replies the
/// parent comment, has not been stored yet. `parent_comment_id` is only ever
/// filled, never cleared.
///
/// # Errors
///
/// Returns [`DbError::MissingParent`] or [`DbError::Sqlx`].
pub async fn upsert_comment(
    pool: &PgPool,
    comment: &CommentRecord,
) -> Result<UpsertOutcome, DbError> {
    let mut tx = pool.begin().await?;

    let post_id = find_post_id(&mut *tx, &comment.post)
        .await?
        .ok_or_else(|| DbError::MissingParent {
            parent: comment.post.to_string(),
        })?;

    let parent_comment_id = match &comment.parent_key {
        None => None,
        Some(parent_key) => Some(
            sqlx::query_scalar::<_, i64>(
                "SELECT id FROM comments WHERE post_id = $1 AND comment_key = $2",
            )
            .bind(post_id)
            .bind(parent_key.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| DbError::MissingParent {
                parent: format!("parent comment {parent_key}"),
            })?,
        ),
    };

    let (id, was_new): (i64, bool) = sqlx::query_as(
        "INSERT INTO comments \
             (post_id, comment_key, parent_comment_id, external_comment_id, author, body, \
              like_count, reply_count, published_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         ON CONFLICT (post_id, comment_key) DO UPDATE SET \
             parent_comment_id   = COALESCE(comments.parent_comment_id, EXCLUDED.parent_comment_id), \
             external_comment_id = COALESCE(comments.external_comment_id, EXCLUDED.external_comment_id), \
             author              = COALESCE(EXCLUDED.author, comments.author), \
             body                = COALESCE(NULLIF(EXCLUDED.body, ''), comments.body), \
             like_count          = COALESCE(EXCLUDED.like_count, comments.like_count), \
             reply_count         = COALESCE(EXCLUDED.reply_count, comments.reply_count), \
             published_at        = COALESCE(comments.published_at, EXCLUDED.published_at), \
             updated_at          = NOW() \
         RETURNING id, (xmax = 0) AS is_new",
    )
    .bind(post_id)
    .bind(comment.key.to_string())
    .bind(parent_comment_id)
    .bind(&comment.external_comment_id)
    .bind(&comment.author)
    .bind(&comment.text)
    .bind(comment.like_count)
    .bind(comment.reply_count)
    .bind(comment.published_at)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(UpsertOutcome { id, was_new })
}

/// Returns `true` if the post has a comment stored under `key`.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails. An unknown post has no
/// comments and yields `false`.
pub async fn comment_exists(
    pool: &PgPool,
    post: &PostRef,
    key: &CanonicalKey,
) -> Result<bool, DbError> {
    let Some(post_id) = find_post_id(pool, post).await? else {
        return Ok(false);
    };

    let exists = sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS (SELECT 1 FROM comments WHERE post_id = $1 AND comment_key = $2)",
    )
    .bind(post_id)
    .bind(key.to_string())
    .fetch_one(pool)
    .await?;

    Ok(exists)
}
