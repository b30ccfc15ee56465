//! Entity records handed to the persistence sink.
//!
//! Records carry optional fields throughout: `None` means "not observed by
//! this fetch", which the sink treats as "keep what is already stored".

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checkpoint::CollectionType;

/// How a [`CanonicalKey`] was derived, in resolver priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    ExternalId,
    Url,
    Composite,
}

impl KeyKind {
    fn prefix(self) -> &'static str {
        match self {
            KeyKind::ExternalId => "id",
            KeyKind::Url => "url",
            KeyKind::Composite => "fp",
        }
    }
}

/// Deterministic identity of a harvested item.
///
/// The `Display` form (`id:…`, `url:…`, `fp:…`) is what gets stored in key
/// columns, so two keys of different kinds never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanonicalKey {
    kind: KeyKind,
    value: String,
}

impl CanonicalKey {
    #[must_use]
    pub fn external_id(value: impl Into<String>) -> Self {
        Self {
            kind: KeyKind::ExternalId,
            value: value.into(),
        }
    }

    #[must_use]
    pub fn url(value: impl Into<String>) -> Self {
        Self {
            kind: KeyKind::Url,
            value: value.into(),
        }
    }

    #[must_use]
    pub fn composite(value: impl Into<String>) -> Self {
        Self {
            kind: KeyKind::Composite,
            value: value.into(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.prefix(), self.value)
    }
}

/// Root content owner. `attributes` is opaque display data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileRecord {
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
}

impl ProfileRecord {
    /// A bare profile row: enough to anchor posts and followers.
    #[must_use]
    pub fn bare(external_id: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            platform: platform.into(),
            ..Self::default()
        }
    }
}

/// Engagement counters as observed on one fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementCounts {
    pub likes: Option<i64>,
    pub comments: Option<i64>,
    pub shares: Option<i64>,
    pub views: Option<i64>,
}

/// Locates a post independent of its owning profile.
///
/// Comment harvests are addressed by post, and either field may be the only
/// one the caller knows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PostRef {
    pub external_post_id: Option<String>,
    pub canonical_url: Option<String>,
}

impl fmt::Display for PostRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.external_post_id, &self.canonical_url) {
            (Some(id), _) => write!(f, "post {id}"),
            (None, Some(url)) => write!(f, "post {url}"),
            (None, None) => f.write_str("post <unaddressed>"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostRecord {
    pub profile_external_id: String,
    pub key: CanonicalKey,
    pub canonical_url: Option<String>,
    pub external_post_id: Option<String>,
    /// Position in the parent feed when observed. Not stable across fetches.
    pub ordinal: Option<i32>,
    pub content: Option<String>,
    pub hashtags: Vec<String>,
    pub thumbnail_url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub counts: EngagementCounts,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentRecord {
    pub post: PostRef,
    pub key: CanonicalKey,
    /// Set for replies. A non-owning reference to the parent comment.
    pub parent_key: Option<CanonicalKey>,
    pub external_comment_id: Option<String>,
    pub author: Option<String>,
    pub text: Option<String>,
    pub like_count: Option<i64>,
    pub reply_count: Option<i64>,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowerRecord {
    pub profile_external_id: String,
    pub key: CanonicalKey,
    pub handle: Option<String>,
    pub display_name: Option<String>,
    pub profile_url: Option<String>,
}

/// One resolved item ready for the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Entity {
    Post(PostRecord),
    Comment(CommentRecord),
    Follower(FollowerRecord),
}

impl Entity {
    #[must_use]
    pub fn key(&self) -> &CanonicalKey {
        match self {
            Entity::Post(p) => &p.key,
            Entity::Comment(c) => &c.key,
            Entity::Follower(f) => &f.key,
        }
    }

    #[must_use]
    pub fn collection(&self) -> CollectionType {
        match self {
            Entity::Post(_) => CollectionType::Posts,
            Entity::Comment(_) => CollectionType::Comments,
            Entity::Follower(_) => CollectionType::Followers,
        }
    }

    /// The identity used for existence checks.
    #[must_use]
    pub fn entity_ref(&self) -> EntityRef {
        match self {
            Entity::Post(p) => EntityRef::Post {
                profile_external_id: p.profile_external_id.clone(),
                key: p.key.clone(),
            },
            Entity::Comment(c) => EntityRef::Comment {
                post: c.post.clone(),
                key: c.key.clone(),
            },
            Entity::Follower(f) => EntityRef::Follower {
                profile_external_id: f.profile_external_id.clone(),
                key: f.key.clone(),
            },
        }
    }
}

/// A canonical key scoped to its owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityRef {
    Post {
        profile_external_id: String,
        key: CanonicalKey,
    },
    Comment {
        post: PostRef,
        key: CanonicalKey,
    },
    Follower {
        profile_external_id: String,
        key: CanonicalKey,
    },
}

impl EntityRef {
    #[must_use]
    pub fn key(&self) -> &CanonicalKey {
        match self {
            EntityRef::Post { key, .. }
            | EntityRef::Comment { key, .. }
            | EntityRef::Follower { key, .. } => key,
        }
    }
}

/// Result of a single upsert: the stored row id and whether the row was
/// created by this call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub id: i64,
    pub was_new: bool,
}
