//! Bounded retry with linear backoff for calls into network-backed wallet backends.
//!
//! The combinator does not know whether an operation is safe to repeat. Callers only wrap
//! operations that are idempotent (balance checks, invoice lookups) or that present the same
//! idempotency key on every attempt.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_BACKOFF_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_ms: DEFAULT_BACKOFF_MS,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff_ms: backoff.as_millis() as u64,
        }
    }

    /// Wait after failed attempt `attempt` (1-based): `backoff * attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(attempt as u64))
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Cooperative cancellation shared between a retrying call site and whoever abandons it.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    Cancelled,
    Failed(E),
}

/// Run `operation` up to `policy.max_attempts` times. The last error is returned unchanged.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    with_retry_if(policy, operation, |_| true).await
}

/// Like [`with_retry`], but errors rejected by `should_retry` are returned immediately.
pub async fn with_retry_if<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let attempts = policy.attempts();
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if attempt < attempts && should_retry(&error) => {
                let delay = policy.delay_for(attempt);
                log::debug!(
                    "attempt {}/{} failed ({}), retrying in {:?}",
                    attempt,
                    attempts,
                    error,
                    delay
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

/// Retry loop that observes `flag` before every attempt.
pub async fn with_retry_cancellable<T, E, F, Fut>(
    policy: &RetryPolicy,
    flag: &CancellationFlag,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.attempts();
    for attempt in 1..=attempts {
        if flag.is_cancelled() {
            log::debug!("retry loop cancelled before attempt {}", attempt);
            return Err(RetryError::Cancelled);
        }
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if attempt == attempts => return Err(RetryError::Failed(error)),
            Err(_) => sleep(policy.delay_for(attempt)).await,
        }
    }
    Err(RetryError::Cancelled)
}

#[cfg(feature = "native")]
pub(crate) async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await
}

#[cfg(all(feature = "web", not(feature = "native")))]
pub(crate) async fn sleep(duration: Duration) {
    gloo_timers::future::sleep(duration).await
}

/// Boxed timer a hand-written future can poll. Browser timers are not `Send`.
#[cfg(feature = "native")]
pub(crate) type Delay = futures::future::BoxFuture<'static, ()>;

#[cfg(all(feature = "web", not(feature = "native")))]
pub(crate) type Delay = futures::future::LocalBoxFuture<'static, ()>;

pub(crate) fn delay(duration: Duration) -> Delay {
    Box::pin(sleep(duration))
}

#[cfg(not(any(feature = "native", feature = "web")))]
compile_error!("enable either the `native` or the `web` feature of wallet-bridge");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::BridgeError;
    use std::sync::atomic::AtomicU32;

    fn flaky(failures: u32, calls: Arc<AtomicU32>) -> impl FnMut() -> futures::future::Ready<Result<u32, BridgeError>> {
        move || {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= failures {
                futures::future::ready(Err(BridgeError::BackendUnreachable(format!(
                    "attempt {}",
                    call
                ))))
            } else {
                futures::future::ready(Ok(call))
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_two_linear_waits() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        let started = tokio::time::Instant::now();

        let value = with_retry(&policy, flaky(2, calls.clone())).await.unwrap();

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn last_error_is_returned_unchanged() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(3, Duration::from_millis(100));

        let err = with_retry(&policy, flaky(u32::MAX, calls.clone()))
            .await
            .unwrap_err();

        assert_eq!(err, BridgeError::BackendUnreachable("attempt 3".into()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_errors_short_circuit() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let policy = RetryPolicy::new(5, Duration::from_millis(10));

        let err = with_retry_if(
            &policy,
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                futures::future::ready(Err::<(), _>(BridgeError::InvalidInvoice("x".into())))
            },
            BridgeError::is_retryable,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, BridgeError::InvalidInvoice(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_is_observed_before_next_attempt() {
        let flag = CancellationFlag::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let cancel = flag.clone();
        let policy = RetryPolicy::new(10, Duration::from_millis(50));

        let result = with_retry_cancellable(&policy, &flag, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            cancel.cancel();
            futures::future::ready(Err::<(), _>(BridgeError::BackendUnreachable("down".into())))
        })
        .await;

        assert_eq!(result, Err(RetryError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_attempts_still_runs_once() {
        let policy = RetryPolicy::new(0, Duration::from_millis(1));
        assert_eq!(policy.attempts(), 1);
        assert_eq!(RetryPolicy::default().delay_for(3), Duration::from_secs(3));
    }
}
