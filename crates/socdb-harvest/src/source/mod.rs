//! Page Sources: where raw batches come from.
//!
//! A source is handed the last [`ContinuationToken`] (or `None` at the start
//! of a collection) and returns one [`RawBatch`]. Two families exist:
//! cursor sources, whose token is an opaque API cursor, and view sources,
//! whose token is a snapshot of how far a rendered feed has been scrolled.
//! [`AnySource`] lets one controller drive either.

pub mod cursor;
pub mod http;
pub mod view;

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use socdb_core::parse_count;

use crate::error::SourceError;

pub use cursor::{
    CursorEndpoint, CursorPage, CursorSource, NoSigning, RequestSigner, RequestTemplate,
    SignedRequest,
};
pub use http::HttpCursorEndpoint;
pub use view::{AdvanceAction, ViewSession, ViewSource};

/// A counter as the source rendered it: a number, or text like `"1.2K"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawCount {
    Number(i64),
    Text(String),
}

impl RawCount {
    /// The counter's integer value. Unreadable text yields `None`.
    #[must_use]
    pub fn value(&self) -> Option<i64> {
        match self {
            RawCount::Number(n) => Some(*n),
            RawCount::Text(s) => parse_count(s),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawCounts {
    pub likes: Option<RawCount>,
    pub comments: Option<RawCount>,
    pub shares: Option<RawCount>,
    pub views: Option<RawCount>,
}

/// One item as extracted from a source, before identity resolution.
///
/// Every field is optional: sources are inconsistent about what they expose,
/// and the resolver decides whether an item carries enough to be keyed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawItem {
    pub external_id: Option<String>,
    pub url: Option<String>,
    pub author: Option<String>,
    pub display_name: Option<String>,
    pub text: Option<String>,
    /// External id of the parent comment, for replies.
    pub parent_id: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub thumbnail_url: Option<String>,
    /// Position in the feed when observed.
    pub ordinal: Option<i32>,
    pub counts: RawCounts,
}

/// How far a rendered feed has been advanced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewSnapshot {
    pub visible_items: u64,
    pub scroll_extent: u64,
}

impl ViewSnapshot {
    /// `true` if `self` shows more of the feed than `other`.
    #[must_use]
    pub fn advanced_past(&self, other: &ViewSnapshot) -> bool {
        self.visible_items > other.visible_items || self.scroll_extent > other.scroll_extent
    }
}

/// Resume position within a collection. Persisted in the checkpoint as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContinuationToken {
    Cursor { cursor: String },
    Snapshot(ViewSnapshot),
}

impl ContinuationToken {
    #[must_use]
    pub fn cursor(cursor: impl Into<String>) -> Self {
        ContinuationToken::Cursor {
            cursor: cursor.into(),
        }
    }

    /// Whether `self`, returned after fetching from `previous`, fails to move
    /// the harvest forward.
    ///
    /// Cursors repeat on an exact match. Snapshots repeat when neither the
    /// visible item count nor the scroll extent grew.
    #[must_use]
    pub fn repeats(&self, previous: Option<&ContinuationToken>) -> bool {
        match (self, previous) {
            (ContinuationToken::Cursor { cursor }, Some(ContinuationToken::Cursor { cursor: prev })) => {
                cursor == prev
            }
            (ContinuationToken::Snapshot(now), Some(ContinuationToken::Snapshot(prev))) => {
                !now.advanced_past(prev)
            }
            _ => false,
        }
    }

    /// Serializes the token for the checkpoint's `continuation_token` column.
    #[must_use]
    pub fn encode(&self) -> String {
        // Serializing a plain enum of strings and integers cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parses a token previously produced by [`ContinuationToken::encode`].
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::InvalidToken`] if `raw` is not a stored token.
    pub fn decode(raw: &str) -> Result<Self, SourceError> {
        serde_json::from_str(raw).map_err(|e| SourceError::InvalidToken(e.to_string()))
    }
}

/// One fetched page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawBatch {
    pub items: Vec<RawItem>,
    /// Where the next fetch starts. `None` means the source could not say.
    pub next: Option<ContinuationToken>,
    /// The source explicitly reported that no more items exist.
    pub complete: bool,
    /// End-of-feed sentinel phrase found in the rendered view, if any.
    pub matched_sentinel: Option<String>,
}

/// A paginated collection.
pub trait PageSource: Send + Sync {
    /// Fetches the batch at `token` (`None` = start of collection).
    fn fetch(
        &self,
        token: Option<&ContinuationToken>,
    ) -> impl Future<Output = Result<RawBatch, SourceError>> + Send;

    /// Source-specific end-of-collection signal, checked after each batch.
    fn is_end_signal(&self, _batch: &RawBatch) -> bool {
        false
    }

    /// Whether comments from this source carry fetchable reply threads.
    fn has_reply_threads(&self) -> bool {
        false
    }

    /// Fetches one page of the reply thread under the comment `parent_id`.
    ///
    /// `Ok(None)` means the source has no reply threads.
    fn fetch_replies(
        &self,
        _parent_id: &str,
        _token: Option<&ContinuationToken>,
    ) -> impl Future<Output = Result<Option<RawBatch>, SourceError>> + Send {
        async { Ok(None) }
    }
}

/// The two source families behind one type.
pub enum AnySource<C, V> {
    Cursor(C),
    View(V),
}

impl<C: PageSource, V: PageSource> PageSource for AnySource<C, V> {
    async fn fetch(&self, token: Option<&ContinuationToken>) -> Result<RawBatch, SourceError> {
        match self {
            AnySource::Cursor(source) => source.fetch(token).await,
            AnySource::View(source) => source.fetch(token).await,
        }
    }

    fn is_end_signal(&self, batch: &RawBatch) -> bool {
        match self {
            AnySource::Cursor(source) => source.is_end_signal(batch),
            AnySource::View(source) => source.is_end_signal(batch),
        }
    }

    fn has_reply_threads(&self) -> bool {
        match self {
            AnySource::Cursor(source) => source.has_reply_threads(),
            AnySource::View(source) => source.has_reply_threads(),
        }
    }

    async fn fetch_replies(
        &self,
        parent_id: &str,
        token: Option<&ContinuationToken>,
    ) -> Result<Option<RawBatch>, SourceError> {
        match self {
            AnySource::Cursor(source) => source.fetch_replies(parent_id, token).await,
            AnySource::View(source) => source.fetch_replies(parent_id, token).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_count_parses_abbreviated_text() {
        assert_eq!(RawCount::Text("1.5K".to_owned()).value(), Some(1_500));
        assert_eq!(RawCount::Number(12).value(), Some(12));
        assert_eq!(RawCount::Text("n/a".to_owned()).value(), None);
    }

    #[test]
    fn raw_count_deserializes_either_shape() {
        let counts: RawCounts =
            serde_json::from_str(r#"{"likes": 40, "views": "2.3M"}"#).unwrap();
        assert_eq!(counts.likes, Some(RawCount::Number(40)));
        assert_eq!(counts.views.and_then(|v| v.value()), Some(2_300_000));
        assert_eq!(counts.shares, None);
    }

    #[test]
    fn token_survives_checkpoint_encoding() {
        let token = ContinuationToken::Snapshot(ViewSnapshot {
            visible_items: 48,
            scroll_extent: 9_600,
        });
        assert_eq!(ContinuationToken::decode(&token.encode()).unwrap(), token);
    }

    #[test]
    fn garbage_token_is_rejected() {
        assert!(matches!(
            ContinuationToken::decode("not json"),
            Err(SourceError::InvalidToken(_))
        ));
    }

    #[test]
    fn cursor_repeats_on_exact_match_only() {
        let prev = ContinuationToken::cursor("abc");
        assert!(ContinuationToken::cursor("abc").repeats(Some(&prev)));
        assert!(!ContinuationToken::cursor("abd").repeats(Some(&prev)));
        assert!(!ContinuationToken::cursor("abc").repeats(None));
    }

    #[test]
    fn snapshot_repeats_when_nothing_grew() {
        let prev = ContinuationToken::Snapshot(ViewSnapshot {
            visible_items: 10,
            scroll_extent: 2_000,
        });
        let same = ContinuationToken::Snapshot(ViewSnapshot {
            visible_items: 10,
            scroll_extent: 2_000,
        });
        let scrolled = ContinuationToken::Snapshot(ViewSnapshot {
            visible_items: 10,
            scroll_extent: 2_400,
        });
        assert!(same.repeats(Some(&prev)));
        assert!(!scrolled.repeats(Some(&prev)));
    }
}
