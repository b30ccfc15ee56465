//! Harvest checkpoints: the durable per-(target, collection) progress record.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of collection a harvest walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionType {
    /// Posts in a profile's feed. Target is the profile's external id.
    Posts,
    /// Comments and replies under one post. Target is the post URL or id.
    Comments,
    /// Accounts following a profile. Target is the profile's external id.
    Followers,
}

impl CollectionType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CollectionType::Posts => "posts",
            CollectionType::Comments => "comments",
            CollectionType::Followers => "followers",
        }
    }
}

impl fmt::Display for CollectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CollectionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "posts" => Ok(CollectionType::Posts),
            "comments" => Ok(CollectionType::Comments),
            "followers" => Ok(CollectionType::Followers),
            other => Err(format!("unknown collection type '{other}'")),
        }
    }
}

/// Persisted checkpoint status.
///
/// `InProgress` covers running, cancelled, and crashed harvests alike: all
/// three resume from the stored token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    InProgress,
    Done,
    Capped,
    Stalled,
    Errored,
}

impl CheckpointStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CheckpointStatus::InProgress => "in_progress",
            CheckpointStatus::Done => "done",
            CheckpointStatus::Capped => "capped",
            CheckpointStatus::Stalled => "stalled",
            CheckpointStatus::Errored => "errored",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, CheckpointStatus::InProgress)
    }
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(CheckpointStatus::InProgress),
            "done" => Ok(CheckpointStatus::Done),
            "capped" => Ok(CheckpointStatus::Capped),
            "stalled" => Ok(CheckpointStatus::Stalled),
            "errored" => Ok(CheckpointStatus::Errored),
            other => Err(format!("unknown checkpoint status '{other}'")),
        }
    }
}

/// Identifies one harvest: a target and the collection walked for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HarvestKey {
    pub target_id: String,
    pub collection: CollectionType,
}

impl HarvestKey {
    #[must_use]
    pub fn new(target_id: impl Into<String>, collection: CollectionType) -> Self {
        Self {
            target_id: target_id.into(),
            collection,
        }
    }
}

impl fmt::Display for HarvestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.target_id, self.collection)
    }
}

/// Durable progress record for one harvest.
///
/// `continuation_token` is the serialized token the next fetch starts from;
/// `None` means "start of collection". Only the harvest controller mutates
/// a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestCheckpoint {
    pub target_id: String,
    pub collection: CollectionType,
    pub continuation_token: Option<String>,
    pub accepted_count: u64,
    pub no_progress_streak: u32,
    pub status: CheckpointStatus,
    pub updated_at: DateTime<Utc>,
}

impl HarvestCheckpoint {
    /// A fresh checkpoint positioned at the start of the collection.
    #[must_use]
    pub fn start(key: &HarvestKey) -> Self {
        Self {
            target_id: key.target_id.clone(),
            collection: key.collection,
            continuation_token: None,
            accepted_count: 0,
            no_progress_streak: 0,
            status: CheckpointStatus::InProgress,
            updated_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn key(&self) -> HarvestKey {
        HarvestKey::new(self.target_id.clone(), self.collection)
    }
}
