//! Identity resolution: raw item → canonical key → entity record.
//!
//! Key priority is fixed: a stable external id, then a normalized URL, then
//! a SHA-256 fingerprint over the item's stable fields. An item offering none
//! of the three is rejected rather than given a key that could collide.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use socdb_core::{
    CanonicalKey, CollectionType, CommentRecord, EngagementCounts, Entity, FollowerRecord,
    PostRecord, PostRef,
};

use crate::error::MalformedItemError;
use crate::source::{RawCount, RawItem};

static HASHTAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#([\p{L}\p{N}_]+)").expect("valid hashtag regex"));

/// Characters of normalized text that feed a composite fingerprint.
pub const DEFAULT_FINGERPRINT_CHARS: usize = 100;

/// What a harvest walks: a profile's posts or followers, or a post's comments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestTarget {
    pub id: String,
    pub platform: String,
    pub collection: CollectionType,
}

impl HarvestTarget {
    pub fn new(
        id: impl Into<String>,
        platform: impl Into<String>,
        collection: CollectionType,
    ) -> Self {
        Self {
            id: id.into(),
            platform: platform.into(),
            collection,
        }
    }

    /// The post a comments target addresses. The target id may be a
    /// permalink or a bare post id.
    #[must_use]
    pub fn post_ref(&self) -> PostRef {
        match normalize_url(&self.id) {
            Some(url) => PostRef {
                external_post_id: derive_post_id(&url),
                canonical_url: Some(url),
            },
            None => PostRef {
                external_post_id: Some(self.id.trim().to_owned()),
                canonical_url: None,
            },
        }
    }
}

/// Normalizes a URL-like identifier: scheme and host lowercased, query and
/// fragment dropped, trailing slash trimmed. Returns `None` for anything
/// that is not an absolute http(s) URL.
#[must_use]
pub fn normalize_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut url = reqwest::Url::parse(trimmed).ok()?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return None;
    }
    url.set_query(None);
    url.set_fragment(None);

    let path = url.path().trim_end_matches('/').to_owned();
    url.set_path(if path.is_empty() { "/" } else { &path });

    let mut normalized = url.to_string();
    if normalized.ends_with('/') && url.path() == "/" {
        normalized.pop();
    }
    Some(normalized)
}

/// Derives a post id from a known permalink shape: `/video/<digits>`,
/// `/p/<code>`, `/reel/<code>`.
#[must_use]
pub fn derive_post_id(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let segments: Vec<&str> = parsed.path_segments()?.filter(|s| !s.is_empty()).collect();
    segments.windows(2).find_map(|pair| match pair {
        ["video", id] if id.chars().all(|c| c.is_ascii_digit()) => Some((*id).to_owned()),
        ["p" | "reel" | "reels", code] => Some((*code).to_owned()),
        _ => None,
    })
}

/// Strips a leading `@` and lowercases a handle.
#[must_use]
pub fn normalize_handle(raw: &str) -> Option<String> {
    let handle = raw.trim().trim_start_matches('@').trim().to_lowercase();
    (!handle.is_empty()).then_some(handle)
}

/// Hashtags in first-seen order, lowercased, without duplicates.
#[must_use]
pub fn extract_hashtags(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    HASHTAG_RE
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_lowercase())
        .filter(|tag| seen.insert(tag.clone()))
        .collect()
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

/// Reply parents of `"0"` are how several APIs spell "top-level".
fn parent_id(item: &RawItem) -> Option<String> {
    non_empty(item.parent_id.as_ref()).filter(|p| p != "0")
}

fn count(raw: Option<&RawCount>) -> Option<i64> {
    raw.and_then(RawCount::value)
}

#[derive(Debug, Clone)]
pub struct IdentityResolver {
    fingerprint_chars: usize,
}

impl Default for IdentityResolver {
    fn default() -> Self {
        Self {
            fingerprint_chars: DEFAULT_FINGERPRINT_CHARS,
        }
    }
}

impl IdentityResolver {
    #[must_use]
    pub fn new(fingerprint_chars: usize) -> Self {
        Self {
            fingerprint_chars: fingerprint_chars.max(1),
        }
    }

    /// SHA-256 over scope, author, whitespace-normalized truncated text and
    /// parent key, NUL-separated. Returns `None` if both author and text are
    /// empty, since such a fingerprint would collide across items.
    fn fingerprint(
        &self,
        scope: &str,
        author: Option<&str>,
        text: Option<&str>,
        parent: Option<&str>,
    ) -> Option<String> {
        let author = author.map(str::trim).unwrap_or_default().to_lowercase();
        let text: String = text
            .unwrap_or_default()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
            .chars()
            .take(self.fingerprint_chars)
            .collect();
        if author.is_empty() && text.is_empty() {
            return None;
        }
        let input = format!(
            "{scope}\x00{author}\x00{text}\x00{}",
            parent.unwrap_or_default()
        );
        Some(format!("{:x}", Sha256::digest(input.as_bytes())))
    }

    /// Canonical key from the item's own fields, in priority order.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedItemError`] if the item has no external id, no
    /// usable URL and nothing stable to fingerprint.
    pub fn resolve_key(
        &self,
        scope: &str,
        item: &RawItem,
    ) -> Result<CanonicalKey, MalformedItemError> {
        let url = item.url.as_deref().and_then(normalize_url);
        self.key_from(scope, non_empty(item.external_id.as_ref()), url, item)
    }

    fn key_from(
        &self,
        scope: &str,
        external_id: Option<String>,
        url: Option<String>,
        item: &RawItem,
    ) -> Result<CanonicalKey, MalformedItemError> {
        if let Some(id) = external_id {
            return Ok(CanonicalKey::external_id(id));
        }
        if let Some(url) = url {
            return Ok(CanonicalKey::url(url));
        }
        let parent = parent_id(item).map(|p| CanonicalKey::external_id(p).to_string());
        self.fingerprint(
            scope,
            item.author.as_deref(),
            item.text.as_deref(),
            parent.as_deref(),
        )
        .map(CanonicalKey::composite)
        .ok_or_else(|| MalformedItemError::new("no external id, no usable URL, no author or text"))
    }

    /// Resolves a raw item into the entity the target's collection stores.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedItemError`] if no canonical key can be derived.
    pub fn resolve(
        &self,
        target: &HarvestTarget,
        item: &RawItem,
    ) -> Result<Entity, MalformedItemError> {
        match target.collection {
            CollectionType::Posts => self.resolve_post(target, item).map(Entity::Post),
            CollectionType::Comments => self.resolve_comment(target, item).map(Entity::Comment),
            CollectionType::Followers => {
                self.resolve_follower(target, item).map(Entity::Follower)
            }
        }
    }

    fn resolve_post(
        &self,
        target: &HarvestTarget,
        item: &RawItem,
    ) -> Result<PostRecord, MalformedItemError> {
        let canonical_url = item.url.as_deref().and_then(normalize_url);
        let external_post_id = non_empty(item.external_id.as_ref())
            .or_else(|| canonical_url.as_deref().and_then(derive_post_id));
        let key = self.key_from(
            &target.id,
            external_post_id.clone(),
            canonical_url.clone(),
            item,
        )?;
        let content = non_empty(item.text.as_ref());

        Ok(PostRecord {
            profile_external_id: target.id.clone(),
            key,
            canonical_url,
            external_post_id,
            ordinal: item.ordinal,
            hashtags: content.as_deref().map(extract_hashtags).unwrap_or_default(),
            content,
            thumbnail_url: non_empty(item.thumbnail_url.as_ref()),
            published_at: item.published_at,
            counts: EngagementCounts {
                likes: count(item.counts.likes.as_ref()),
                comments: count(item.counts.comments.as_ref()),
                shares: count(item.counts.shares.as_ref()),
                views: count(item.counts.views.as_ref()),
            },
        })
    }

    fn resolve_comment(
        &self,
        target: &HarvestTarget,
        item: &RawItem,
    ) -> Result<CommentRecord, MalformedItemError> {
        let post = target.post_ref();
        let key = self.resolve_key(&post.to_string(), item)?;

        Ok(CommentRecord {
            post,
            key,
            parent_key: parent_id(item).map(CanonicalKey::external_id),
            external_comment_id: non_empty(item.external_id.as_ref()),
            author: item.author.as_deref().and_then(normalize_handle),
            text: non_empty(item.text.as_ref()),
            like_count: count(item.counts.likes.as_ref()),
            reply_count: count(item.counts.comments.as_ref()),
            published_at: item.published_at,
        })
    }

    /// Followers are identified by external id, else by handle, else by
    /// profile URL.
    fn resolve_follower(
        &self,
        target: &HarvestTarget,
        item: &RawItem,
    ) -> Result<FollowerRecord, MalformedItemError> {
        let handle = item.author.as_deref().and_then(normalize_handle);
        let profile_url = item.url.as_deref().and_then(normalize_url);
        let key = match (non_empty(item.external_id.as_ref()), &handle, &profile_url) {
            (Some(id), _, _) => CanonicalKey::external_id(id),
            (None, Some(h), _) => CanonicalKey::external_id(h.clone()),
            (None, None, Some(url)) => CanonicalKey::url(url.clone()),
            (None, None, None) => {
                return Err(MalformedItemError::new("follower has no id, handle or URL"))
            }
        };

        Ok(FollowerRecord {
            profile_external_id: target.id.clone(),
            key,
            handle,
            display_name: non_empty(item.display_name.as_ref()),
            profile_url,
        })
    }
}

#[cfg(test)]
#[path = "resolve_test.rs"]
mod tests;
