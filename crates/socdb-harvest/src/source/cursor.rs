//! Cursor-paginated sources.
//!
//! A [`CursorSource`] asks its [`CursorEndpoint`] for a request template,
//! passes it through a [`RequestSigner`] exactly once, and sends the signed
//! request. The cursor returned by the endpoint becomes the next token.
//! Endpoints that expose comment reply threads walk them the same way.

use std::future::Future;

use super::{ContinuationToken, PageSource, RawBatch, RawItem};
use crate::error::SourceError;

/// An unsigned request for one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTemplate {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
}

/// A request ready to send. Signing may add query parameters and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
}

impl From<RequestTemplate> for SignedRequest {
    fn from(template: RequestTemplate) -> Self {
        Self {
            url: template.url,
            query: template.query,
            headers: template.headers,
        }
    }
}

/// One page as reported by the endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CursorPage {
    pub items: Vec<RawItem>,
    pub cursor: Option<String>,
    pub has_more: bool,
}

/// Provider-specific request construction and response decoding.
pub trait CursorEndpoint: Send + Sync {
    fn template(&self, cursor: Option<&str>) -> RequestTemplate;

    fn send(
        &self,
        request: &SignedRequest,
    ) -> impl Future<Output = Result<CursorPage, SourceError>> + Send;

    fn has_reply_threads(&self) -> bool {
        false
    }

    /// The request for one page of the reply thread under `parent_id`, or
    /// `None` when the endpoint has no reply threads.
    fn reply_template(&self, _parent_id: &str, _cursor: Option<&str>) -> Option<RequestTemplate> {
        None
    }

    fn send_replies(
        &self,
        request: &SignedRequest,
    ) -> impl Future<Output = Result<CursorPage, SourceError>> + Send {
        self.send(request)
    }
}

/// Turns a request template into signed parameters and headers.
pub trait RequestSigner: Send + Sync {
    fn sign(
        &self,
        template: RequestTemplate,
    ) -> impl Future<Output = Result<SignedRequest, SourceError>> + Send;
}

/// Sends templates unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSigning;

impl RequestSigner for NoSigning {
    async fn sign(&self, template: RequestTemplate) -> Result<SignedRequest, SourceError> {
        Ok(template.into())
    }
}

pub struct CursorSource<E, G = NoSigning> {
    endpoint: E,
    signer: G,
}

impl<E: CursorEndpoint> CursorSource<E, NoSigning> {
    pub fn new(endpoint: E) -> Self {
        Self {
            endpoint,
            signer: NoSigning,
        }
    }
}

impl<E: CursorEndpoint, G: RequestSigner> CursorSource<E, G> {
    pub fn with_signer(endpoint: E, signer: G) -> Self {
        Self { endpoint, signer }
    }
}

/// Next cursor when the endpoint reports more items but omits the cursor:
/// a numeric offset cursor advanced by the batch size. Non-numeric cursors
/// cannot be advanced and yield `None`.
fn fallback_cursor(previous: Option<&str>, batch_len: usize) -> Option<String> {
    let offset = match previous {
        None => 0,
        Some(prev) => prev.trim().parse::<u64>().ok()?,
    };
    let len = u64::try_from(batch_len).ok()?;
    Some(offset.saturating_add(len).to_string())
}

fn cursor_of(token: Option<&ContinuationToken>) -> Result<Option<&str>, SourceError> {
    match token {
        None => Ok(None),
        Some(ContinuationToken::Cursor { cursor }) => Ok(Some(cursor.as_str())),
        Some(other) => Err(SourceError::InvalidToken(format!(
            "cursor source cannot resume from {other:?}"
        ))),
    }
}

fn into_batch(page: CursorPage, cursor: Option<&str>) -> RawBatch {
    let next_cursor = match page.cursor.filter(|c| !c.trim().is_empty()) {
        Some(c) => Some(c),
        None if page.has_more && !page.items.is_empty() => {
            fallback_cursor(cursor, page.items.len())
        }
        None => None,
    };

    RawBatch {
        complete: !page.has_more,
        next: next_cursor.map(ContinuationToken::cursor),
        items: page.items,
        matched_sentinel: None,
    }
}

impl<E: CursorEndpoint, G: RequestSigner> PageSource for CursorSource<E, G> {
    async fn fetch(&self, token: Option<&ContinuationToken>) -> Result<RawBatch, SourceError> {
        let cursor = cursor_of(token)?;
        let template = self.endpoint.template(cursor);
        let signed = self.signer.sign(template).await?;
        let page = self.endpoint.send(&signed).await?;
        Ok(into_batch(page, cursor))
    }

    fn has_reply_threads(&self) -> bool {
        self.endpoint.has_reply_threads()
    }

    async fn fetch_replies(
        &self,
        parent_id: &str,
        token: Option<&ContinuationToken>,
    ) -> Result<Option<RawBatch>, SourceError> {
        let cursor = cursor_of(token)?;
        let Some(template) = self.endpoint.reply_template(parent_id, cursor) else {
            return Ok(None);
        };
        let signed = self.signer.sign(template).await?;
        let page = self.endpoint.send_replies(&signed).await?;
        Ok(Some(into_batch(page, cursor)))
    }
}
