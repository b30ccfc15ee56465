//! [`HttpCursorEndpoint`]: a JSON cursor endpoint described by an
//! [`EndpointConfig`].
//!
//! Items, the next cursor and the has-more flag are located with JSON
//! pointers, so one implementation covers any provider whose pages are plain
//! JSON. Request signing, when a provider needs it, is a separate
//! [`RequestSigner`](super::RequestSigner).
//!
//! A configured `replies` endpoint keeps its `{parent}` placeholders until
//! a reply-thread request is built for one parent comment.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::Value;
use socdb_core::{CollectionType, EndpointConfig, FieldMap};

use super::cursor::{CursorEndpoint, CursorPage, RequestTemplate, SignedRequest};
use super::{RawCount, RawCounts, RawItem};
use crate::error::SourceError;

pub struct HttpCursorEndpoint {
    client: Client,
    url: String,
    cursor_param: String,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    items_pointer: String,
    cursor_pointer: Option<String>,
    has_more_pointer: Option<String>,
    fields: FieldMap,
    replies: Option<Box<HttpCursorEndpoint>>,
}

impl HttpCursorEndpoint {
    /// Creates an endpoint with its own client, configured timeout and `User-Agent`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Http`] if the underlying `reqwest::Client`
    /// cannot be constructed.
    pub fn new(
        config: &EndpointConfig,
        target_id: &str,
        collection: CollectionType,
        timeout_secs: u64,
        user_agent: &str,
    ) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .user_agent(user_agent)
            .build()?;
        Ok(Self::with_client(client, config, target_id, collection))
    }

    /// Creates an endpoint sharing an existing client.
    #[must_use]
    pub fn with_client(
        client: Client,
        config: &EndpointConfig,
        target_id: &str,
        collection: CollectionType,
    ) -> Self {
        Self {
            client: client.clone(),
            url: config.url_for(target_id, collection),
            cursor_param: config.cursor_param.clone(),
            query: config
                .query
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            headers: config
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            items_pointer: config.items_pointer.clone(),
            cursor_pointer: config.cursor_pointer.clone(),
            has_more_pointer: config.has_more_pointer.clone(),
            fields: config.fields.clone(),
            replies: config.replies.as_deref().map(|r| {
                Box::new(Self::with_client(client.clone(), r, target_id, collection))
            }),
        }
    }

    fn decode_page(&self, body: &Value, url: &str) -> Result<CursorPage, SourceError> {
        let raw_items = match body.pointer(&self.items_pointer) {
            None | Some(Value::Null) => Vec::new(),
            Some(v) => serde_json::from_value::<Vec<Value>>(v.clone()).map_err(|e| {
                SourceError::Deserialize {
                    context: format!("items at {} from {url}", self.items_pointer),
                    source: e,
                }
            })?,
        };

        let items: Vec<RawItem> = raw_items
            .iter()
            .enumerate()
            .map(|(i, item)| self.decode_item(item, i))
            .collect();

        let cursor = self
            .cursor_pointer
            .as_deref()
            .and_then(|p| text_at(body, p));

        let has_more = match self.has_more_pointer.as_deref() {
            Some(p) => flag_at(body, p),
            None => cursor.is_some() && !items.is_empty(),
        };

        Ok(CursorPage {
            items,
            cursor,
            has_more,
        })
    }

    fn decode_item(&self, item: &Value, index: usize) -> RawItem {
        let f = &self.fields;
        let text = |p: &Option<String>| p.as_deref().and_then(|p| text_at(item, p));
        let count = |p: &Option<String>| p.as_deref().and_then(|p| count_at(item, p));

        RawItem {
            external_id: text(&f.external_id),
            url: text(&f.url),
            author: text(&f.author),
            display_name: text(&f.display_name),
            text: text(&f.text),
            parent_id: text(&f.parent_id),
            published_at: f
                .published_at
                .as_deref()
                .and_then(|p| item.pointer(p))
                .and_then(timestamp),
            thumbnail_url: text(&f.thumbnail_url),
            ordinal: i32::try_from(index).ok(),
            counts: RawCounts {
                likes: count(&f.likes),
                comments: count(&f.comments),
                shares: count(&f.shares),
                views: count(&f.views),
            },
        }
    }
}

/// Reads a string or number at `pointer` as text. Empty strings are absent.
fn text_at(value: &Value, pointer: &str) -> Option<String> {
    match value.pointer(pointer)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn count_at(value: &Value, pointer: &str) -> Option<RawCount> {
    match value.pointer(pointer)? {
        Value::Number(n) => n.as_i64().map(RawCount::Number),
        Value::String(s) if !s.trim().is_empty() => Some(RawCount::Text(s.clone())),
        _ => None,
    }
}

fn flag_at(value: &Value, pointer: &str) -> bool {
    match value.pointer(pointer) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().is_some_and(|n| n != 0),
        Some(Value::String(s)) => matches!(s.trim(), "true" | "1"),
        _ => false,
    }
}

/// Epoch seconds, epoch milliseconds, or an RFC 3339 string.
fn timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let from_epoch = |n: i64| {
        if n > 100_000_000_000 {
            DateTime::from_timestamp_millis(n)
        } else {
            DateTime::from_timestamp(n, 0)
        }
    };
    match value {
        Value::Number(n) => n.as_i64().and_then(from_epoch),
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| s.trim().parse::<i64>().ok().and_then(from_epoch)),
        _ => None,
    }
}

impl CursorEndpoint for HttpCursorEndpoint {
    fn template(&self, cursor: Option<&str>) -> RequestTemplate {
        let mut query = self.query.clone();
        if let Some(c) = cursor {
            query.push((self.cursor_param.clone(), c.to_owned()));
        }
        RequestTemplate {
            url: self.url.clone(),
            query,
            headers: self.headers.clone(),
        }
    }

    fn has_reply_threads(&self) -> bool {
        self.replies.is_some()
    }

    fn reply_template(&self, parent_id: &str, cursor: Option<&str>) -> Option<RequestTemplate> {
        let replies = self.replies.as_ref()?;
        let mut template = replies.template(cursor);
        template.url = template.url.replace("{parent}", parent_id);
        for (_, value) in &mut template.query {
            *value = value.replace("{parent}", parent_id);
        }
        Some(template)
    }

    async fn send_replies(&self, request: &SignedRequest) -> Result<CursorPage, SourceError> {
        match &self.replies {
            Some(replies) => replies.send(request).await,
            None => Err(SourceError::InvalidToken(
                "endpoint has no reply threads".to_owned(),
            )),
        }
    }

    async fn send(&self, request: &SignedRequest) -> Result<CursorPage, SourceError> {
        let mut builder = self
            .client
            .get(&request.url)
            .query(&request.query)
            .header(reqwest::header::ACCEPT, "application/json");
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok());
            return Err(SourceError::RateLimited { retry_after_secs });
        }

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(SourceError::AuthenticationExpired(format!(
                "HTTP {} from {}",
                status.as_u16(),
                request.url
            )));
        }

        if status.is_server_error() {
            return Err(SourceError::Transient(format!(
                "HTTP {} from {}",
                status.as_u16(),
                request.url
            )));
        }

        if !status.is_success() {
            return Err(SourceError::Rejected {
                status: status.as_u16(),
                url: request.url.clone(),
            });
        }

        let body = response.text().await?;
        let value: Value =
            serde_json::from_str(&body).map_err(|e| SourceError::Deserialize {
                context: format!("page from {}", request.url),
                source: e,
            })?;

        self.decode_page(&value, &request.url)
    }
}
