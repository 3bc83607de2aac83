//! Bounded retries with exponential backoff and a per-attempt deadline.
//!
//! Used around RAG queries and moderation calls. Chat completions are never
//! retried here; the completion port applies only its own deadline.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use rondo_config::RetrySettings;
use rondo_core::error::{ProviderError, StoreError};
use tracing::warn;

/// Upper bound for a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Errors that can be retried and synthesized on deadline expiry.
pub trait Retryable: std::fmt::Display + Sized {
    fn is_transient(&self) -> bool;
    fn timed_out(message: String) -> Self;
}

impl Retryable for ProviderError {
    fn is_transient(&self) -> bool {
        ProviderError::is_transient(self)
    }

    fn timed_out(message: String) -> Self {
        ProviderError::Timeout(message)
    }
}

impl Retryable for StoreError {
    fn is_transient(&self) -> bool {
        StoreError::is_transient(self)
    }

    fn timed_out(message: String) -> Self {
        StoreError::Timeout(message)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            call_timeout: Duration::from_secs(settings.call_timeout_secs),
        }
    }

    /// A single attempt bounded by `call_timeout`.
    pub fn no_retry(call_timeout: Duration) -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::ZERO,
            call_timeout,
        }
    }

    /// Sleep before retry number `attempt + 1`: doubles each attempt, ±25% jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(MAX_BACKOFF);
        let quarter = base.as_millis() as u64 / 4;
        if quarter == 0 {
            return base;
        }
        let offset = rand::rng().random_range(0..=2 * quarter);
        Duration::from_millis(base.as_millis() as u64 - quarter + offset)
    }

    /// Run `op` until it succeeds, fails permanently, or retries run out.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        E: Retryable,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            let outcome = match tokio::time::timeout(self.call_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(E::timed_out(format!(
                    "{label} timed out after {}ms",
                    self.call_timeout.as_millis()
                ))),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let delay = self.backoff(attempt);
                    attempt += 1;
                    warn!(
                        call = label,
                        attempt,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            call_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<&str, ProviderError> = fast(2)
            .run("moderation", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProviderError::Network("reset".into()))
                } else {
                    Ok("ok")
                }
            })
            .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<(), StoreError> = fast(2)
            .run("rag query", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Timeout("slow".into()))
            })
            .await;
        assert!(matches!(result, Err(StoreError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), ProviderError> = fast(5)
            .run("moderation", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::AuthenticationFailed("bad key".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn deadline_becomes_timeout_error() {
        let policy = RetryPolicy::no_retry(Duration::from_millis(10));
        let result: Result<(), ProviderError> = policy
            .run("moderation", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        match result {
            Err(ProviderError::Timeout(msg)) => assert!(msg.contains("moderation")),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn backoff_doubles_within_jitter() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(200),
            call_timeout: Duration::from_secs(1),
        };
        let second = policy.backoff(1).as_millis();
        assert!((300..=500).contains(&second), "{second}");
        assert!(policy.backoff(20) <= MAX_BACKOFF + MAX_BACKOFF / 4);
    }
}
