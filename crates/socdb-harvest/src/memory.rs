//! In-process store with the same merge rules as the Postgres one.
//!
//! Used by tests and by `socdb harvest --dry-run`. Nothing survives the
//! process.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use socdb_core::{
    CanonicalKey, CheckpointStore, CommentRecord, Entity, EntityRef, FollowerRecord,
    HarvestCheckpoint, HarvestKey, KeyKind, PersistenceSink, PostRecord, PostRef, ProfileRecord,
    SinkError, UpsertOutcome,
};

#[derive(Debug, Clone)]
struct Stored<T> {
    id: i64,
    record: T,
}

#[derive(Debug, Clone)]
struct StoredFollower {
    id: i64,
    record: FollowerRecord,
    is_active: bool,
    last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Tables {
    next_id: i64,
    profiles: Vec<Stored<ProfileRecord>>,
    posts: Vec<Stored<PostRecord>>,
    /// Comments with the id of the post they hang off.
    comments: Vec<(i64, Stored<CommentRecord>)>,
    followers: Vec<StoredFollower>,
    checkpoints: HashMap<HarvestKey, HarvestCheckpoint>,
}

/// Row counts per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub profiles: usize,
    pub posts: usize,
    pub comments: usize,
    pub followers: usize,
}

fn fill<T: Clone>(current: &mut Option<T>, incoming: Option<&T>) {
    if current.is_none() {
        *current = incoming.cloned();
    }
}

fn refresh<T: Clone>(current: &mut Option<T>, incoming: Option<&T>) {
    if incoming.is_some() {
        *current = incoming.cloned();
    }
}

fn refresh_text(current: &mut Option<String>, incoming: Option<&String>) {
    if let Some(text) = incoming.filter(|t| !t.is_empty()) {
        *current = Some(text.clone());
    }
}

impl Tables {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn profile_id(&self, external_id: &str) -> Option<i64> {
        self.profiles
            .iter()
            .find(|p| p.record.external_id == external_id)
            .map(|p| p.id)
    }

    fn require_profile(&self, external_id: &str) -> Result<i64, SinkError> {
        self.profile_id(external_id)
            .ok_or_else(|| SinkError::ReferentialGap {
                parent: format!("profile {external_id}"),
            })
    }

    fn find_post(&self, post: &PostRef) -> Option<i64> {
        let by_id = post.external_post_id.as_ref().and_then(|ext| {
            self.posts
                .iter()
                .find(|p| p.record.external_post_id.as_ref() == Some(ext))
        });
        let by_url = || {
            post.canonical_url.as_ref().and_then(|url| {
                self.posts
                    .iter()
                    .find(|p| p.record.canonical_url.as_ref() == Some(url))
            })
        };
        by_id.or_else(by_url).map(|p| p.id)
    }

    /// The row matching any of the post's identities, external id first.
    fn matching_post(&self, post: &PostRecord) -> Option<usize> {
        let rows: Vec<(usize, &PostRecord)> = self
            .posts
            .iter()
            .map(|p| &p.record)
            .enumerate()
            .filter(|(_, r)| r.profile_external_id == post.profile_external_id)
            .collect();
        let by_ext = post.external_post_id.as_ref().and_then(|ext| {
            rows.iter()
                .find(|(_, r)| r.external_post_id.as_ref() == Some(ext))
        });
        let by_key = || rows.iter().find(|(_, r)| r.key == post.key);
        let by_url = || {
            post.canonical_url.as_ref().and_then(|url| {
                rows.iter()
                    .find(|(_, r)| r.canonical_url.as_ref() == Some(url))
            })
        };
        by_ext.or_else(by_key).or_else(by_url).map(|(i, _)| *i)
    }

    fn url_taken(&self, profile: &str, url: &str) -> bool {
        self.posts.iter().any(|p| {
            p.record.profile_external_id == profile && p.record.canonical_url.as_deref() == Some(url)
        })
    }

    fn external_id_taken(&self, profile: &str, ext: &str) -> bool {
        self.posts.iter().any(|p| {
            p.record.profile_external_id == profile
                && p.record.external_post_id.as_deref() == Some(ext)
        })
    }

    fn upsert_profile(&mut self, profile: &ProfileRecord) -> UpsertOutcome {
        if let Some(row) = self
            .profiles
            .iter_mut()
            .find(|p| p.record.external_id == profile.external_id)
        {
            let stored = &mut row.record;
            refresh(&mut stored.username, profile.username.as_ref());
            refresh(&mut stored.display_name, profile.display_name.as_ref());
            refresh(&mut stored.bio, profile.bio.as_ref());
            refresh(&mut stored.profile_url, profile.profile_url.as_ref());
            refresh(&mut stored.follower_count, profile.follower_count.as_ref());
            refresh(&mut stored.following_count, profile.following_count.as_ref());
            refresh(&mut stored.like_count, profile.like_count.as_ref());
            refresh(&mut stored.post_count, profile.post_count.as_ref());
            refresh(&mut stored.is_verified, profile.is_verified.as_ref());
            refresh(&mut stored.attributes, profile.attributes.as_ref());
            return UpsertOutcome {
                id: row.id,
                was_new: false,
            };
        }
        let id = self.allocate_id();
        self.profiles.push(Stored {
            id,
            record: profile.clone(),
        });
        UpsertOutcome { id, was_new: true }
    }

    fn upsert_post(&mut self, post: &PostRecord) -> Result<UpsertOutcome, SinkError> {
        self.require_profile(&post.profile_external_id)?;

        let Some(index) = self.matching_post(post) else {
            let id = self.allocate_id();
            self.posts.push(Stored {
                id,
                record: post.clone(),
            });
            return Ok(UpsertOutcome { id, was_new: true });
        };

        let url_free = post
            .canonical_url
            .as_deref()
            .is_some_and(|url| !self.url_taken(&post.profile_external_id, url));
        let ext_free = post
            .external_post_id
            .as_deref()
            .is_some_and(|ext| !self.external_id_taken(&post.profile_external_id, ext));

        let row = &mut self.posts[index];
        let stored = &mut row.record;
        if url_free {
            fill(&mut stored.canonical_url, post.canonical_url.as_ref());
        }
        if ext_free {
            fill(&mut stored.external_post_id, post.external_post_id.as_ref());
        }
        refresh(&mut stored.ordinal, post.ordinal.as_ref());
        refresh_text(&mut stored.content, post.content.as_ref());
        if !post.hashtags.is_empty() {
            stored.hashtags.clone_from(&post.hashtags);
        }
        refresh(&mut stored.thumbnail_url, post.thumbnail_url.as_ref());
        fill(&mut stored.published_at, post.published_at.as_ref());
        refresh(&mut stored.counts.likes, post.counts.likes.as_ref());
        refresh(&mut stored.counts.comments, post.counts.comments.as_ref());
        refresh(&mut stored.counts.shares, post.counts.shares.as_ref());
        refresh(&mut stored.counts.views, post.counts.views.as_ref());

        Ok(UpsertOutcome {
            id: row.id,
            was_new: false,
        })
    }

    fn comment_index(&self, post_id: i64, key: &CanonicalKey) -> Option<usize> {
        self.comments
            .iter()
            .position(|(pid, c)| *pid == post_id && &c.record.key == key)
    }

    fn upsert_comment(&mut self, comment: &CommentRecord) -> Result<UpsertOutcome, SinkError> {
        let post_id = self
            .find_post(&comment.post)
            .ok_or_else(|| SinkError::ReferentialGap {
                parent: comment.post.to_string(),
            })?;
        if let Some(parent) = &comment.parent_key {
            if self.comment_index(post_id, parent).is_none() {
                return Err(SinkError::ReferentialGap {
                    parent: format!("comment {parent}"),
                });
            }
        }

        let Some(index) = self.comment_index(post_id, &comment.key) else {
            let id = self.allocate_id();
            self.comments.push((
                post_id,
                Stored {
                    id,
                    record: comment.clone(),
                },
            ));
            return Ok(UpsertOutcome { id, was_new: true });
        };

        let (_, row) = &mut self.comments[index];
        let stored = &mut row.record;
        fill(&mut stored.parent_key, comment.parent_key.as_ref());
        fill(&mut stored.external_comment_id, comment.external_comment_id.as_ref());
        refresh(&mut stored.author, comment.author.as_ref());
        refresh_text(&mut stored.text, comment.text.as_ref());
        refresh(&mut stored.like_count, comment.like_count.as_ref());
        refresh(&mut stored.reply_count, comment.reply_count.as_ref());
        fill(&mut stored.published_at, comment.published_at.as_ref());

        Ok(UpsertOutcome {
            id: row.id,
            was_new: false,
        })
    }

    fn upsert_follower(&mut self, follower: &FollowerRecord) -> Result<UpsertOutcome, SinkError> {
        self.require_profile(&follower.profile_external_id)?;
        let now = Utc::now();

        if let Some(row) = self.followers.iter_mut().find(|f| {
            f.record.profile_external_id == follower.profile_external_id
                && f.record.key == follower.key
        }) {
            refresh(&mut row.record.handle, follower.handle.as_ref());
            refresh(&mut row.record.display_name, follower.display_name.as_ref());
            refresh(&mut row.record.profile_url, follower.profile_url.as_ref());
            row.is_active = true;
            row.last_seen_at = now;
            return Ok(UpsertOutcome {
                id: row.id,
                was_new: false,
            });
        }

        let id = self.allocate_id();
        self.followers.push(StoredFollower {
            id,
            record: follower.clone(),
            is_active: true,
            last_seen_at: now,
        });
        Ok(UpsertOutcome { id, was_new: true })
    }

    fn exists(&self, entity: &EntityRef) -> bool {
        match entity {
            EntityRef::Post {
                profile_external_id,
                key,
            } => self.posts.iter().any(|p| {
                let r = &p.record;
                &r.profile_external_id == profile_external_id
                    && (&r.key == key
                        || match key.kind() {
                            KeyKind::ExternalId => {
                                r.external_post_id.as_deref() == Some(key.value())
                            }
                            KeyKind::Url => r.canonical_url.as_deref() == Some(key.value()),
                            KeyKind::Composite => false,
                        })
            }),
            EntityRef::Comment { post, key } => self
                .find_post(post)
                .is_some_and(|post_id| self.comment_index(post_id, key).is_some()),
            EntityRef::Follower {
                profile_external_id,
                key,
            } => self.followers.iter().any(|f| {
                &f.record.profile_external_id == profile_external_id && &f.record.key == key
            }),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn counts(&self) -> StoreCounts {
        let t = self.tables();
        StoreCounts {
            profiles: t.profiles.len(),
            posts: t.posts.len(),
            comments: t.comments.len(),
            followers: t.followers.len(),
        }
    }

    #[must_use]
    pub fn profiles(&self) -> Vec<ProfileRecord> {
        self.tables().profiles.iter().map(|p| p.record.clone()).collect()
    }

    /// Posts in insertion order.
    #[must_use]
    pub fn posts(&self) -> Vec<PostRecord> {
        self.tables().posts.iter().map(|p| p.record.clone()).collect()
    }

    #[must_use]
    pub fn comments(&self) -> Vec<CommentRecord> {
        self.tables()
            .comments
            .iter()
            .map(|(_, c)| c.record.clone())
            .collect()
    }

    #[must_use]
    pub fn followers(&self) -> Vec<FollowerRecord> {
        self.tables()
            .followers
            .iter()
            .map(|f| f.record.clone())
            .collect()
    }

    #[must_use]
    pub fn active_followers(&self, profile_external_id: &str) -> usize {
        self.tables()
            .followers
            .iter()
            .filter(|f| f.is_active && f.record.profile_external_id == profile_external_id)
            .count()
    }

    /// Marks followers of a profile not seen since `seen_before` inactive.
    pub fn deactivate_unseen_followers(
        &self,
        profile_external_id: &str,
        seen_before: DateTime<Utc>,
    ) -> u64 {
        let mut t = self.tables();
        let mut changed = 0;
        for f in &mut t.followers {
            if f.is_active
                && f.record.profile_external_id == profile_external_id
                && f.last_seen_at < seen_before
            {
                f.is_active = false;
                changed += 1;
            }
        }
        changed
    }

    #[must_use]
    pub fn checkpoint(&self, key: &HarvestKey) -> Option<HarvestCheckpoint> {
        self.tables().checkpoints.get(key).cloned()
    }
}

impl PersistenceSink for MemoryStore {
    async fn upsert_profile(&self, profile: &ProfileRecord) -> Result<UpsertOutcome, SinkError> {
        Ok(self.tables().upsert_profile(profile))
    }

    async fn upsert(&self, entity: &Entity) -> Result<UpsertOutcome, SinkError> {
        let mut t = self.tables();
        match entity {
            Entity::Post(post) => t.upsert_post(post),
            Entity::Comment(comment) => t.upsert_comment(comment),
            Entity::Follower(follower) => t.upsert_follower(follower),
        }
    }

    async fn exists(&self, entity: &EntityRef) -> Result<bool, SinkError> {
        Ok(self.tables().exists(entity))
    }
}

impl CheckpointStore for MemoryStore {
    async fn load_checkpoint(
        &self,
        key: &HarvestKey,
    ) -> Result<Option<HarvestCheckpoint>, SinkError> {
        Ok(self.checkpoint(key))
    }

    async fn save_checkpoint(&self, checkpoint: &HarvestCheckpoint) -> Result<(), SinkError> {
        self.tables()
            .checkpoints
            .insert(checkpoint.key(), checkpoint.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use socdb_core::EngagementCounts;

    fn post(key: CanonicalKey) -> PostRecord {
        PostRecord {
            profile_external_id: "creator_1".to_owned(),
            key,
            canonical_url: None,
            external_post_id: None,
            ordinal: None,
            content: None,
            hashtags: Vec::new(),
            thumbnail_url: None,
            published_at: None,
            counts: EngagementCounts::default(),
        }
    }

    async fn store_with_profile() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .upsert_profile(&ProfileRecord::bare("creator_1", "tiktok"))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn post_without_profile_is_a_referential_gap() {
        let store = MemoryStore::new();
        let err = store
            .upsert(&Entity::Post(post(CanonicalKey::external_id("1"))))
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::ReferentialGap { .. }));
    }

    #[tokio::test]
    async fn partial_then_full_upsert_is_a_union() {
        let store = store_with_profile().await;
        let url = "https://www.tiktok.com/@creator_1/video/77".to_owned();

        let mut first = post(CanonicalKey::url(url.clone()));
        first.canonical_url = Some(url.clone());
        first.counts.likes = Some(10);
        assert!(store.upsert(&Entity::Post(first)).await.unwrap().was_new);

        let mut second = post(CanonicalKey::external_id("77"));
        second.canonical_url = Some(url.clone());
        second.external_post_id = Some("77".to_owned());
        second.content = Some("full caption #tag".to_owned());
        second.hashtags = vec!["tag".to_owned()];
        assert!(!store.upsert(&Entity::Post(second)).await.unwrap().was_new);

        let posts = store.posts();
        assert_eq!(posts.len(), 1);
        let stored = &posts[0];
        assert_eq!(stored.key, CanonicalKey::url(url), "key is fixed once written");
        assert_eq!(stored.external_post_id.as_deref(), Some("77"));
        assert_eq!(stored.content.as_deref(), Some("full caption #tag"));
        assert_eq!(stored.counts.likes, Some(10), "missing counters do not blank");
    }

    #[tokio::test]
    async fn empty_content_does_not_overwrite() {
        let store = store_with_profile().await;
        let mut first = post(CanonicalKey::external_id("5"));
        first.content = Some("caption".to_owned());
        store.upsert(&Entity::Post(first)).await.unwrap();

        let mut second = post(CanonicalKey::external_id("5"));
        second.content = Some(String::new());
        store.upsert(&Entity::Post(second)).await.unwrap();

        assert_eq!(store.posts()[0].content.as_deref(), Some("caption"));
    }

    #[tokio::test]
    async fn reply_waits_for_its_parent() {
        let store = store_with_profile().await;
        let mut p = post(CanonicalKey::external_id("9"));
        p.external_post_id = Some("9".to_owned());
        store.upsert(&Entity::Post(p)).await.unwrap();

        let post_ref = PostRef {
            external_post_id: Some("9".to_owned()),
            canonical_url: None,
        };
        let comment = |key: &str, parent: Option<&str>| CommentRecord {
            post: post_ref.clone(),
            key: CanonicalKey::external_id(key),
            parent_key: parent.map(CanonicalKey::external_id),
            external_comment_id: Some(key.to_owned()),
            author: None,
            text: None,
            like_count: None,
            reply_count: None,
            published_at: None,
        };

        let err = store
            .upsert(&Entity::Comment(comment("c2", Some("c1"))))
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::ReferentialGap { .. }));

        store.upsert(&Entity::Comment(comment("c1", None))).await.unwrap();
        assert!(store
            .upsert(&Entity::Comment(comment("c2", Some("c1"))))
            .await
            .unwrap()
            .was_new);
        assert_eq!(store.counts().comments, 2);
    }

    #[tokio::test]
    async fn exists_matches_post_by_external_id_key() {
        let store = store_with_profile().await;
        let mut p = post(CanonicalKey::url("https://x.test/p/abc"));
        p.external_post_id = Some("abc".to_owned());
        store.upsert(&Entity::Post(p)).await.unwrap();

        let probe = EntityRef::Post {
            profile_external_id: "creator_1".to_owned(),
            key: CanonicalKey::external_id("abc"),
        };
        assert!(store.exists(&probe).await.unwrap());

        let other_profile = EntityRef::Post {
            profile_external_id: "creator_2".to_owned(),
            key: CanonicalKey::external_id("abc"),
        };
        assert!(!store.exists(&other_profile).await.unwrap());
    }

    #[tokio::test]
    async fn unseen_followers_are_deactivated_then_reactivated() {
        let store = store_with_profile().await;
        let follower = FollowerRecord {
            profile_external_id: "creator_1".to_owned(),
            key: CanonicalKey::external_id("fan"),
            handle: Some("fan".to_owned()),
            display_name: None,
            profile_url: None,
        };
        store.upsert(&Entity::Follower(follower.clone())).await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(5);
        assert_eq!(store.deactivate_unseen_followers("creator_1", later), 1);
        assert_eq!(store.active_followers("creator_1"), 0);

        let outcome = store.upsert(&Entity::Follower(follower)).await.unwrap();
        assert!(!outcome.was_new);
        assert_eq!(store.active_followers("creator_1"), 1);
        assert_eq!(store.counts().followers, 1);
    }
}
