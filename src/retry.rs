use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tracing::warn;

use crate::error::{ProviderError, Transient};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Retry(Duration),
    GiveUp,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_ms: u64, max_ms: u64) -> Self {
        Self {
            max_attempts,
            base: Duration::from_millis(base_ms),
            max: Duration::from_millis(max_ms),
        }
    }

    /// What to do after attempt number `attempt` (1-based) failed with `error`.
    /// Exponential backoff capped at `max`; a rate-limit hint from the
    /// provider is honoured when it asks for longer.
    pub fn decide(&self, attempt: u32, error: &ProviderError) -> Decision {
        let ProviderError::Retryable(kind) = error else {
            return Decision::GiveUp;
        };
        if attempt >= self.max_attempts {
            return Decision::GiveUp;
        }
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let backoff = self.base.saturating_mul(factor).min(self.max);
        match kind {
            Transient::RateLimited {
                retry_after: Some(hint),
            } => Decision::Retry(backoff.max(*hint)),
            _ => Decision::Retry(backoff),
        }
    }
}

/// Run `op` until it succeeds, fails fatally, or the policy gives up. Each
/// attempt is bounded by `timeout`; every retry bumps `retries`.
pub async fn with_retry<T, F, Fut>(
    label: &str,
    policy: &RetryPolicy,
    timeout: Duration,
    retries: &AtomicU32,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 1;
    loop {
        let result = match tokio::time::timeout(timeout, op(attempt)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Retryable(Transient::Timeout(timeout))),
        };
        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        match policy.decide(attempt, &err) {
            Decision::Retry(wait) => {
                warn!(
                    operation = label,
                    attempt,
                    backoff_ms = wait.as_millis() as u64,
                    "{} failed: {}, retrying",
                    label,
                    err
                );
                retries.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Decision::GiveUp => {
                warn!(operation = label, attempt, "{} gave up: {}", label, err);
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(4, 100, 350)
    }

    fn server_error() -> ProviderError {
        ProviderError::Retryable(Transient::Server {
            status: 503,
            body: String::new(),
        })
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let p = policy();
        assert_eq!(p.decide(1, &server_error()), Decision::Retry(Duration::from_millis(100)));
        assert_eq!(p.decide(2, &server_error()), Decision::Retry(Duration::from_millis(200)));
        assert_eq!(p.decide(3, &server_error()), Decision::Retry(Duration::from_millis(350)));
        assert_eq!(p.decide(4, &server_error()), Decision::GiveUp);
    }

    #[test]
    fn test_fatal_never_retries() {
        let err = ProviderError::Fatal("bad voice".into());
        assert_eq!(policy().decide(1, &err), Decision::GiveUp);
    }

    #[test]
    fn test_rate_limit_hint_wins_when_longer() {
        let err = ProviderError::Retryable(Transient::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        });
        assert_eq!(policy().decide(1, &err), Decision::Retry(Duration::from_secs(2)));
        let err = ProviderError::Retryable(Transient::RateLimited { retry_after: None });
        assert_eq!(policy().decide(2, &err), Decision::Retry(Duration::from_millis(200)));
    }

    #[tokio::test]
    async fn test_with_retry_recovers() {
        let retries = AtomicU32::new(0);
        let p = RetryPolicy::new(3, 1, 5);
        let result = with_retry("flaky", &p, Duration::from_secs(1), &retries, |attempt| async move {
            if attempt < 3 {
                Err(server_error())
            } else {
                Ok(attempt)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(retries.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_with_retry_times_out_each_attempt() {
        let retries = AtomicU32::new(0);
        let p = RetryPolicy::new(2, 1, 1);
        let result: Result<(), _> =
            with_retry("slow", &p, Duration::from_millis(10), &retries, |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(
            result,
            Err(ProviderError::Retryable(Transient::Timeout(_)))
        ));
        assert_eq!(retries.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_with_retry_stops_on_fatal() {
        let retries = AtomicU32::new(0);
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry("fatal", &policy(), Duration::from_secs(1), &retries, |_| {
            calls.fetch_add(1, Ordering::Relaxed);
            async { Err(ProviderError::Fatal("nope".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(retries.load(Ordering::Relaxed), 0);
    }
}
