use std::time::Duration;

use socdb_core::{HarvestKey, SinkError};
use thiserror::Error;

/// Failure of a single Page Source call.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("transient source failure: {0}")]
    Transient(String),

    #[error("rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("source call timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("authentication expired: {0}")]
    AuthenticationExpired(String),

    #[error("source rejected request with HTTP {status} from {url}")]
    Rejected { status: u16, url: String },

    #[error("JSON deserialization error for {context}: {source}")]
    Deserialize {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("continuation token does not fit this source: {0}")]
    InvalidToken(String),
}

impl SourceError {
    /// Returns `true` for errors that are worth retrying after a back-off delay.
    ///
    /// **Retriable:** timeouts, rate limits, network-level failures, 5xx.
    ///
    /// **Not retriable:** expired authentication, other rejected statuses,
    /// malformed responses, mismatched tokens.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            SourceError::Http(e) => {
                e.is_timeout() || e.is_connect() || e.status().is_some_and(|s| s.is_server_error())
            }
            SourceError::Transient(_)
            | SourceError::RateLimited { .. }
            | SourceError::Timeout { .. } => true,
            SourceError::AuthenticationExpired(_)
            | SourceError::Rejected { .. }
            | SourceError::Deserialize { .. }
            | SourceError::InvalidToken(_) => false,
        }
    }

    /// The server-requested minimum wait, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SourceError::RateLimited {
                retry_after_secs: Some(secs),
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }
}

/// An item that cannot be given a canonical key. Skipped and counted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed item: {reason}")]
pub struct MalformedItemError {
    pub reason: String,
}

impl MalformedItemError {
    pub(crate) fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum HarvestError {
    /// A harvest for this (target, collection) is already active in this process.
    #[error("harvest {key} is already running")]
    AlreadyRunning { key: HarvestKey },

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("harvest task for {key} failed: {reason}")]
    Task { key: HarvestKey, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limits_and_timeouts_are_retriable() {
        assert!(SourceError::RateLimited {
            retry_after_secs: None
        }
        .is_retriable());
        assert!(SourceError::Timeout { elapsed_ms: 5 }.is_retriable());
        assert!(SourceError::Transient("reset".to_owned()).is_retriable());
    }

    #[test]
    fn auth_and_shape_errors_are_not_retriable() {
        assert!(!SourceError::AuthenticationExpired("401".to_owned()).is_retriable());
        assert!(!SourceError::Rejected {
            status: 404,
            url: "https://example.com".to_owned()
        }
        .is_retriable());
        let e = serde_json::from_str::<serde_json::Value>("nope").unwrap_err();
        assert!(!SourceError::Deserialize {
            context: "page".to_owned(),
            source: e
        }
        .is_retriable());
    }

    #[test]
    fn retry_after_only_from_rate_limit_hint() {
        assert_eq!(
            SourceError::RateLimited {
                retry_after_secs: Some(7)
            }
            .retry_after(),
            Some(Duration::from_secs(7))
        );
        assert_eq!(
            SourceError::RateLimited {
                retry_after_secs: None
            }
            .retry_after(),
            None
        );
        assert_eq!(SourceError::Timeout { elapsed_ms: 1 }.retry_after(), None);
    }
}
