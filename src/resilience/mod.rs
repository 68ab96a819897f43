//! Fault tolerance for host calls and whole validation runs: per-call
//! timeout, retry with exponential backoff and jitter, a shared circuit
//! breaker, and recovery strategies tried between attempts.

pub mod circuit_breaker;
pub mod recovery;
pub mod retry;

pub use circuit_breaker::{BreakerPhase, BreakerSettings, CircuitBreaker, CircuitState};
pub use recovery::{RecoveryRegistry, RecoveryStrategy, ReinitializeHost};
pub use retry::RetryPolicy;

use crate::error::GuardError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

/// How often a caller re-checks a half-open breaker while its trial call runs.
const HALF_OPEN_POLL: Duration = Duration::from_millis(5);
/// Upper bound on waiting for a trial call when no per-call timeout is set.
const HALF_OPEN_MAX_WAIT: Duration = Duration::from_secs(10);

/// Wraps an async operation in the configured timeout, retry, breaker and
/// recovery behaviour.
#[derive(Debug, Clone)]
pub struct ResilientCaller {
    policy: RetryPolicy,
    call_timeout: Option<Duration>,
    breaker: Option<Arc<CircuitBreaker>>,
    recovery: Arc<RecoveryRegistry>,
}

impl ResilientCaller {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            call_timeout: None,
            breaker: None,
            recovery: Arc::new(RecoveryRegistry::new()),
        }
    }

    pub fn with_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = Some(call_timeout);
        self
    }

    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn with_recovery(mut self, recovery: Arc<RecoveryRegistry>) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. An open breaker fails the call immediately.
    pub async fn call<F, Fut, T>(&self, operation: &str, mut op: F) -> Result<T, GuardError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GuardError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            if let Some(breaker) = &self.breaker {
                self.acquire(breaker, operation).await?;
            }

            let outcome = match self.call_timeout {
                Some(limit) => match timeout(limit, op()).await {
                    Ok(result) => result,
                    Err(_) => Err(GuardError::Timeout {
                        operation: operation.to_string(),
                        timeout: limit,
                    }),
                },
                None => op().await,
            };

            let error = match outcome {
                Ok(value) => {
                    if let Some(breaker) = &self.breaker {
                        breaker.record_success();
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if let Some(breaker) = &self.breaker {
                breaker.record_failure();
            }

            if !error.is_retryable() || attempt >= max_attempts {
                log::debug!("{operation} failed after {attempt} attempt(s): {error}");
                return Err(error);
            }

            self.recovery.attempt(&error).await;
            let delay = self.policy.delay_for(attempt);
            log::debug!(
                "{operation} attempt {attempt}/{max_attempts} failed: {error}; retrying in {delay:?}"
            );
            sleep(delay).await;
            attempt += 1;
        }
    }

    /// Pass the breaker gate. While a half-open trial is in flight, wait for
    /// its outcome instead of failing: success closes the breaker and lets
    /// this call through, failure reopens it with a real cooldown.
    async fn acquire(&self, breaker: &CircuitBreaker, operation: &str) -> Result<(), GuardError> {
        let deadline = Instant::now() + self.call_timeout.unwrap_or(HALF_OPEN_MAX_WAIT);
        loop {
            match breaker.try_acquire(operation) {
                Err(GuardError::CircuitOpen { retry_after, .. })
                    if retry_after.is_zero() && Instant::now() < deadline =>
                {
                    sleep(HALF_OPEN_POLL).await;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, HostErrorCode};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            jitter: Duration::ZERO,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_with_backoff_until_success() {
        let calls = AtomicUsize::new(0);
        let start = Instant::now();
        let result = ResilientCaller::new(policy(3))
            .call("fetch", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(GuardError::host(HostErrorCode::Network, "flaky"))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_errors_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = ResilientCaller::new(policy(5))
            .call("fetch", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(GuardError::host(HostErrorCode::PermissionDenied, "denied"))
            })
            .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::PermissionDenied);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = ResilientCaller::new(policy(2))
            .with_timeout(Duration::from_millis(50))
            .call("fetch", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Timeout);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_fails_fast() {
        let breaker = Arc::new(CircuitBreaker::new(
            "host",
            BreakerSettings {
                failure_threshold: 2,
                cooldown: Duration::from_secs(30),
            },
        ));
        let caller = ResilientCaller::new(policy(1)).with_breaker(breaker.clone());
        let calls = AtomicUsize::new(0);
        let failing = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(GuardError::host(HostErrorCode::Network, "down"))
        };

        assert!(caller.call("fetch", failing).await.is_err());
        assert!(caller.call("fetch", failing).await.is_err());
        assert!(breaker.state().is_open);

        let err = caller.call("fetch", failing).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        tokio::time::advance(Duration::from_secs(30)).await;
        let ok = caller.call("fetch", || async { Ok::<_, GuardError>(1) }).await;
        assert_eq!(ok.unwrap(), 1);
        assert!(!breaker.state().is_open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_wait_for_half_open_trial() {
        let breaker = Arc::new(CircuitBreaker::new(
            "host",
            BreakerSettings {
                failure_threshold: 1,
                cooldown: Duration::from_secs(5),
            },
        ));
        let caller = ResilientCaller::new(policy(1))
            .with_timeout(Duration::from_secs(1))
            .with_breaker(breaker.clone());
        breaker.record_failure();
        assert!(breaker.state().is_open);
        tokio::time::advance(Duration::from_secs(5)).await;

        let calls = AtomicUsize::new(0);
        let slow_ok = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            sleep(Duration::from_millis(20)).await;
            Ok::<_, GuardError>(())
        };
        let (a, b) = tokio::join!(caller.call("first", slow_ok), caller.call("second", slow_ok));
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(breaker.state().phase, BreakerPhase::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_fails_waiting_call() {
        let breaker = Arc::new(CircuitBreaker::new(
            "host",
            BreakerSettings {
                failure_threshold: 1,
                cooldown: Duration::from_secs(5),
            },
        ));
        let caller = ResilientCaller::new(policy(1)).with_breaker(breaker.clone());
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(5)).await;

        let calls = AtomicUsize::new(0);
        let slow_fail = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            sleep(Duration::from_millis(20)).await;
            Err::<(), _>(GuardError::host(HostErrorCode::Network, "still down"))
        };
        let (a, b) = tokio::join!(caller.call("first", slow_fail), caller.call("second", slow_fail));
        assert_eq!(a.unwrap_err().kind(), ErrorKind::Network);
        assert_eq!(b.unwrap_err().kind(), ErrorKind::CircuitOpen);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.state().phase, BreakerPhase::Open);
    }

    struct Remedy(AtomicUsize);

    #[async_trait]
    impl RecoveryStrategy for Remedy {
        fn name(&self) -> &str {
            "remedy"
        }

        fn can_recover(&self, _error: &GuardError) -> bool {
            true
        }

        async fn recover(&self, _error: &GuardError) -> Result<(), GuardError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_runs_between_attempts() {
        let remedy = Arc::new(Remedy(AtomicUsize::new(0)));
        let mut registry = RecoveryRegistry::new();
        registry.register(ErrorKind::HostInternal, remedy.clone());

        let calls = AtomicUsize::new(0);
        let result = ResilientCaller::new(policy(3))
            .with_recovery(Arc::new(registry))
            .call("fetch", || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(GuardError::host(HostErrorCode::Internal, "stale"))
                } else {
                    Ok(())
                }
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(remedy.0.load(Ordering::SeqCst), 1);
    }
}
