//! View sources: feeds that are only reachable by scrolling a rendered page.
//!
//! The rendering session itself is external; [`ViewSession`] is the narrow
//! surface this crate needs from it. The token is a [`ViewSnapshot`] taken
//! after advancing, so a scroll that loads nothing shows up as a repeated
//! token rather than as fake progress.

use std::future::Future;

use super::{ContinuationToken, PageSource, RawBatch, RawItem, ViewSnapshot};
use crate::error::SourceError;

/// Ways to move a rendered feed forward, mildest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceAction {
    /// Scroll by roughly one viewport.
    Step,
    /// Scroll by several viewports.
    Large,
    /// Jump to the current end of the document.
    ToBottom,
    /// Activate a "load more" control, if the page has one.
    LoadMore,
}

/// A ready, authenticated rendered view.
pub trait ViewSession: Send + Sync {
    /// All items currently rendered, in feed order.
    fn extract_items(&self) -> impl Future<Output = Result<Vec<RawItem>, SourceError>> + Send;

    fn snapshot(&self) -> impl Future<Output = Result<ViewSnapshot, SourceError>> + Send;

    fn advance(
        &self,
        action: AdvanceAction,
    ) -> impl Future<Output = Result<(), SourceError>> + Send;

    /// Visible page text, searched for end-of-feed sentinel phrases.
    fn page_text(&self) -> impl Future<Output = Result<String, SourceError>> + Send;
}

const DEFAULT_ESCALATION: [AdvanceAction; 4] = [
    AdvanceAction::Step,
    AdvanceAction::Large,
    AdvanceAction::ToBottom,
    AdvanceAction::LoadMore,
];

/// Upper bound on advances spent catching a fresh session up to a stored snapshot.
const DEFAULT_MAX_RESTORE_STEPS: u32 = 200;

pub struct ViewSource<S> {
    session: S,
    escalation: Vec<AdvanceAction>,
    sentinels: Vec<String>,
    max_restore_steps: u32,
}

impl<S: ViewSession> ViewSource<S> {
    pub fn new(session: S) -> Self {
        Self {
            session,
            escalation: DEFAULT_ESCALATION.to_vec(),
            sentinels: Vec::new(),
            max_restore_steps: DEFAULT_MAX_RESTORE_STEPS,
        }
    }

    /// Phrases that mark the end of the feed (matched case-insensitively).
    #[must_use]
    pub fn with_sentinels<I, T>(mut self, phrases: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.sentinels = phrases
            .into_iter()
            .map(|p| p.into().to_lowercase())
            .filter(|p| !p.trim().is_empty())
            .collect();
        self
    }

    /// Replaces the advance escalation order.
    #[must_use]
    pub fn with_escalation(mut self, actions: Vec<AdvanceAction>) -> Self {
        if !actions.is_empty() {
            self.escalation = actions;
        }
        self
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    /// Scrolls a fresh session until both metrics reach `target`.
    ///
    /// Virtualized feeds keep a fixed window of rendered items while the
    /// scroll extent grows, so neither metric alone marks the position.
    async fn restore(&self, target: &ViewSnapshot) -> Result<(), SourceError> {
        let mut current = self.session.snapshot().await?;
        let mut steps = 0;
        while steps < self.max_restore_steps
            && (current.scroll_extent < target.scroll_extent
                || current.visible_items < target.visible_items)
        {
            self.session.advance(AdvanceAction::ToBottom).await?;
            let next = self.session.snapshot().await?;
            if !next.advanced_past(&current) {
                tracing::debug!(
                    reached = current.scroll_extent,
                    wanted = target.scroll_extent,
                    "view stopped growing while restoring position"
                );
                break;
            }
            current = next;
            steps += 1;
        }
        Ok(())
    }

    async fn matched_sentinel(&self) -> Result<Option<String>, SourceError> {
        if self.sentinels.is_empty() {
            return Ok(None);
        }
        let text = self.session.page_text().await?.to_lowercase();
        Ok(self.sentinels.iter().find(|p| text.contains(p.as_str())).cloned())
    }

    /// Tries each escalation step until the view grows. Returns the snapshot
    /// after the last attempt, grown or not.
    async fn advance(&self) -> Result<ViewSnapshot, SourceError> {
        let before = self.session.snapshot().await?;
        let mut after = before;
        for action in &self.escalation {
            self.session.advance(*action).await?;
            after = self.session.snapshot().await?;
            if after.advanced_past(&before) {
                tracing::debug!(?action, visible = after.visible_items, "view advanced");
                break;
            }
        }
        Ok(after)
    }
}

impl<S: ViewSession> PageSource for ViewSource<S> {
    async fn fetch(&self, token: Option<&ContinuationToken>) -> Result<RawBatch, SourceError> {
        match token {
            None => {}
            Some(ContinuationToken::Snapshot(target)) => self.restore(target).await?,
            Some(other) => {
                return Err(SourceError::InvalidToken(format!(
                    "view source cannot resume from {other:?}"
                )))
            }
        }

        let mut items = self.session.extract_items().await?;
        for (i, item) in items.iter_mut().enumerate() {
            if item.ordinal.is_none() {
                item.ordinal = i32::try_from(i).ok();
            }
        }

        let matched_sentinel = self.matched_sentinel().await?;
        let next = if matched_sentinel.is_some() {
            self.session.snapshot().await?
        } else {
            self.advance().await?
        };

        Ok(RawBatch {
            items,
            next: Some(ContinuationToken::Snapshot(next)),
            complete: false,
            matched_sentinel,
        })
    }

    fn is_end_signal(&self, batch: &RawBatch) -> bool {
        batch.matched_sentinel.is_some()
    }
}
