//! Call pacing, deadlines, and retry with exponential back-off and jitter.
//!
//! Every Page Source call goes through [`Governor::call_source`], every sink
//! write through [`Governor::call_sink`]. One governor is owned by one
//! harvest loop, so spacing is per target.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use socdb_core::{AppConfig, SinkError};
use tokio::time::Instant;

use crate::error::SourceError;

/// Back-off never sleeps longer than this, whatever the server asks for.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GovernorConfig {
    /// Minimum gap between the starts of two source calls.
    pub min_call_spacing: Duration,
    pub source_timeout: Duration,
    pub sink_timeout: Duration,
    /// Total attempts per call, the first one included. At least 1.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub max_delay: Duration,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            min_call_spacing: Duration::from_secs(1),
            source_timeout: Duration::from_secs(30),
            sink_timeout: Duration::from_secs(10),
            max_attempts: 4,
            backoff_base: Duration::from_secs(1),
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl GovernorConfig {
    #[must_use]
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            min_call_spacing: Duration::from_millis(config.harvest_min_call_spacing_ms),
            source_timeout: Duration::from_secs(config.harvest_request_timeout_secs),
            sink_timeout: Duration::from_secs(config.harvest_sink_timeout_secs),
            max_attempts: config.harvest_max_attempts.max(1),
            backoff_base: Duration::from_millis(config.harvest_backoff_base_ms),
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

/// Errors a governed call can return.
trait GovernedError: Display {
    fn timed_out(elapsed_ms: u64) -> Self;
    fn is_retriable(&self) -> bool;
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl GovernedError for SourceError {
    fn timed_out(elapsed_ms: u64) -> Self {
        SourceError::Timeout { elapsed_ms }
    }

    fn is_retriable(&self) -> bool {
        SourceError::is_retriable(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        SourceError::retry_after(self)
    }
}

impl GovernedError for SinkError {
    fn timed_out(elapsed_ms: u64) -> Self {
        SinkError::Timeout { elapsed_ms }
    }

    fn is_retriable(&self) -> bool {
        self.is_transient()
    }
}

/// Delay before retry number `retry` (1-based).
///
/// `base × 2^(retry-1)` with ±25 % jitter. A server hint raises the delay
/// to at least the hinted value. The result never exceeds `max_delay`.
pub(crate) fn backoff_delay(
    base: Duration,
    retry: u32,
    max_delay: Duration,
    hint: Option<Duration>,
) -> Duration {
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let max_ms = u64::try_from(max_delay.as_millis()).unwrap_or(u64::MAX);
    let computed = base_ms
        .saturating_mul(1u64 << retry.saturating_sub(1).min(20))
        .min(max_ms);
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    let jittered = (computed as f64 * (rand::random::<f64>() * 0.5 + 0.75)) as u64;
    let hinted = hint.map_or(0, |h| u64::try_from(h.as_millis()).unwrap_or(u64::MAX));
    Duration::from_millis(jittered.max(hinted).min(max_ms))
}

#[derive(Debug)]
pub struct Governor {
    config: GovernorConfig,
    last_source_call: Option<Instant>,
}

impl Governor {
    #[must_use]
    pub fn new(config: GovernorConfig) -> Self {
        Self {
            config,
            last_source_call: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// Runs a source call with spacing, a deadline, and retries.
    ///
    /// # Errors
    ///
    /// Returns the last [`SourceError`] once attempts are exhausted, or the
    /// first non-retriable one.
    pub async fn call_source<T, F, Fut>(&mut self, operation: F) -> Result<T, SourceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let timeout = self.config.source_timeout;
        self.run("source", true, timeout, operation).await
    }

    /// Runs a sink write with a deadline, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Returns the last [`SinkError`] once attempts are exhausted, or the
    /// first non-transient one.
    pub async fn call_sink<T, F, Fut>(&mut self, operation: F) -> Result<T, SinkError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SinkError>>,
    {
        let timeout = self.config.sink_timeout;
        self.run("sink", false, timeout, operation).await
    }

    async fn wait_for_slot(&mut self) {
        let spacing = self.config.min_call_spacing;
        if let Some(last) = self.last_source_call.filter(|_| !spacing.is_zero()) {
            tokio::time::sleep_until(last + spacing).await;
        }
        self.last_source_call = Some(Instant::now());
    }

    async fn run<T, E, F, Fut>(
        &mut self,
        kind: &'static str,
        spaced: bool,
        timeout: Duration,
        mut operation: F,
    ) -> Result<T, E>
    where
        E: GovernedError,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if spaced {
                self.wait_for_slot().await;
            }

            let err = match tokio::time::timeout(timeout, operation()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => err,
                Err(_) => E::timed_out(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)),
            };

            if !err.is_retriable() || attempt >= max_attempts {
                return Err(err);
            }

            let delay = backoff_delay(
                self.config.backoff_base,
                attempt,
                self.config.max_delay,
                err.retry_after(),
            );
            tracing::warn!(
                kind,
                attempt,
                max_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "transient failure, retrying after back-off"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_attempts: u32) -> GovernorConfig {
        GovernorConfig {
            min_call_spacing: Duration::ZERO,
            source_timeout: Duration::from_secs(5),
            sink_timeout: Duration::from_secs(5),
            max_attempts,
            backoff_base: Duration::ZERO,
            max_delay: Duration::from_millis(50),
        }
    }

    #[test]
    fn backoff_grows_within_jitter_bounds() {
        let base = Duration::from_millis(1_000);
        let max = Duration::from_secs(60);
        let first = backoff_delay(base, 1, max, None);
        let third = backoff_delay(base, 3, max, None);
        assert!((750..=1_250).contains(&first.as_millis()), "{first:?}");
        assert!((3_000..=5_000).contains(&third.as_millis()), "{third:?}");
    }

    #[test]
    fn backoff_never_exceeds_max_delay() {
        let delay = backoff_delay(
            Duration::from_secs(1),
            30,
            Duration::from_secs(60),
            Some(Duration::from_secs(3_600)),
        );
        assert_eq!(delay, Duration::from_secs(60));
    }

    #[test]
    fn retry_after_hint_is_a_lower_bound() {
        let delay = backoff_delay(
            Duration::from_millis(10),
            1,
            Duration::from_secs(60),
            Some(Duration::from_secs(5)),
        );
        assert_eq!(delay, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn succeeds_immediately_on_first_try() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let mut governor = Governor::new(fast_config(3));
        let result = governor
            .call_source(|| {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok::<u32, SourceError>(42)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_rate_limits_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let mut governor = Governor::new(fast_config(4));
        let result = governor
            .call_source(|| {
                let c = Arc::clone(&c);
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(SourceError::RateLimited {
                            retry_after_secs: None,
                        })
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn returns_last_error_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let mut governor = Governor::new(fast_config(3));
        let result = governor
            .call_source(|| {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<u32, _>(SourceError::Transient("connection reset".to_owned()))
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3, "max_attempts counts the first try");
        assert!(matches!(result, Err(SourceError::Transient(_))));
    }

    #[tokio::test]
    async fn does_not_retry_expired_authentication() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let mut governor = Governor::new(fast_config(5));
        let result = governor
            .call_source(|| {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<u32, _>(SourceError::AuthenticationExpired("401".to_owned()))
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(SourceError::AuthenticationExpired(_))));
    }

    #[tokio::test]
    async fn slow_source_call_times_out() {
        let mut governor = Governor::new(GovernorConfig {
            source_timeout: Duration::from_millis(20),
            ..fast_config(1)
        });
        let result = governor
            .call_source(|| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok::<u32, SourceError>(1)
            })
            .await;
        assert!(matches!(result, Err(SourceError::Timeout { elapsed_ms: 20 })));
    }

    #[tokio::test]
    async fn sink_retries_only_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let mut governor = Governor::new(fast_config(4));
        let result = governor
            .call_sink(|| {
                let c = Arc::clone(&c);
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(SinkError::Unavailable("pool timed out".to_owned()))
                    } else {
                        Err::<u32, _>(SinkError::ReferentialGap {
                            parent: "post 1".to_owned(),
                        })
                    }
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(result, Err(SinkError::ReferentialGap { .. })));
    }

    #[tokio::test]
    async fn source_calls_are_spaced() {
        let mut governor = Governor::new(GovernorConfig {
            min_call_spacing: Duration::from_millis(40),
            ..fast_config(1)
        });
        let started = Instant::now();
        for _ in 0..3 {
            governor
                .call_source(|| async { Ok::<(), SourceError>(()) })
                .await
                .unwrap();
        }
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn sink_calls_are_not_spaced() {
        let mut governor = Governor::new(GovernorConfig {
            min_call_spacing: Duration::from_secs(30),
            ..fast_config(1)
        });
        governor
            .call_source(|| async { Ok::<(), SourceError>(()) })
            .await
            .unwrap();
        let started = Instant::now();
        governor
            .call_sink(|| async { Ok::<(), SinkError>(()) })
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
