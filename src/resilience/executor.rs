//! Retry plus circuit breaking around an upstream call.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use super::backoff::RetryPolicy;
use super::breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitOpenError, CircuitState};

/// Why [`ResilientExecutor::execute`] gave up.
#[derive(Debug, Error)]
pub enum ExecuteError<E> {
    /// The breaker is open; the operation was not attempted.
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    /// The final attempt exceeded the per-attempt timeout.
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    /// The final attempt failed with the operation's own error.
    #[error("{0}")]
    Operation(E),
}

impl<E> ExecuteError<E> {
    /// Whether the breaker rejected the call without attempting it.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen(_))
    }
}

/// Runs an operation with exponential-backoff retries behind a circuit breaker.
///
/// One `execute` call counts as a single success or failure towards the
/// breaker no matter how many attempts it made. The half-open trial is a
/// single attempt.
#[derive(Debug)]
pub struct ResilientExecutor {
    policy: RetryPolicy,
    breaker: CircuitBreaker,
    attempt_timeout: Option<Duration>,
}

impl ResilientExecutor {
    /// Create an executor.
    pub fn new(policy: RetryPolicy, breaker: CircuitBreakerConfig) -> Self {
        Self {
            policy,
            breaker: CircuitBreaker::new(breaker),
            attempt_timeout: None,
        }
    }

    /// Abort and count as failed any attempt running longer than `timeout`.
    #[must_use]
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// The retry policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// The circuit breaker.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Current breaker state.
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Run `operation` until it succeeds, retries run out, or the breaker refuses.
    pub async fn execute<T, E, F, Fut>(&self, mut operation: F) -> Result<T, ExecuteError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let permit = self.breaker.try_acquire()?;
        let max_retries = if permit.is_trial() {
            0
        } else {
            self.policy.max_retries
        };

        let mut attempt: u32 = 0;
        loop {
            match self.attempt(&mut operation).await {
                Ok(value) => {
                    permit.record_success();
                    return Ok(value);
                }
                Err(err) => {
                    if attempt >= max_retries {
                        warn!(
                            attempts = attempt + 1,
                            error = %err,
                            "Upstream call failed, giving up"
                        );
                        permit.record_failure();
                        return Err(err);
                    }

                    attempt += 1;
                    let delay = self.policy.delay_for(attempt);
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Upstream call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn attempt<T, E, F, Fut>(&self, operation: &mut F) -> Result<T, ExecuteError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.attempt_timeout {
            Some(limit) => match tokio::time::timeout(limit, operation()).await {
                Ok(result) => result.map_err(ExecuteError::Operation),
                Err(_) => Err(ExecuteError::Timeout(limit)),
            },
            None => operation().await.map_err(ExecuteError::Operation),
        }
    }
}

impl Default for ResilientExecutor {
    fn default() -> Self {
        Self::new(RetryPolicy::default(), CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_test::{assert_err, assert_ok};

    fn executor(max_retries: u32, threshold: u32, reset_ms: u64) -> ResilientExecutor {
        ResilientExecutor::new(
            RetryPolicy::exponential(max_retries, Duration::from_millis(100), Duration::from_secs(5)),
            CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_timeout: Duration::from_millis(reset_ms),
            },
        )
    }

    async fn always_fail(calls: &AtomicU32) -> Result<(), String> {
        calls.fetch_add(1, Ordering::SeqCst);
        Err("upstream down".to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let executor = executor(3, 5, 1000);
        let calls = AtomicU32::new(0);

        let result = executor
            .execute(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("transient")
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(assert_ok!(result), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(executor.breaker().consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_surface_operation_error() {
        let executor = executor(2, 5, 1000);
        let calls = AtomicU32::new(0);

        let err = assert_err!(executor.execute(|| always_fail(&calls)).await);

        assert!(matches!(err, ExecuteError::Operation(ref e) if e == "upstream down"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // A whole exhausted sequence is one breaker failure
        assert_eq!(executor.breaker().consecutive_failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_waits_between_attempts() {
        let executor = ResilientExecutor::new(
            RetryPolicy::exponential(2, Duration::from_millis(100), Duration::from_secs(5)).with_jitter(0.0),
            CircuitBreakerConfig::default(),
        );
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();

        let _ = executor.execute(|| always_fail(&calls)).await;

        // 100ms then 200ms
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_fails_fast() {
        let executor = executor(0, 2, 1000);
        let calls = AtomicU32::new(0);

        let _ = executor.execute(|| always_fail(&calls)).await;
        let _ = executor.execute(|| always_fail(&calls)).await;
        assert_eq!(executor.circuit_state(), CircuitState::Open);

        let err = assert_err!(executor.execute(|| always_fail(&calls)).await);
        assert!(err.is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_success_closes_circuit() {
        let executor = executor(3, 1, 1000);
        let calls = AtomicU32::new(0);

        let _ = executor.execute(|| always_fail(&calls)).await;
        assert_eq!(executor.circuit_state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(1000)).await;

        let result = executor
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>("recovered")
            })
            .await;

        assert_eq!(assert_ok!(result), "recovered");
        assert_eq!(executor.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_is_single_attempt_and_reopens() {
        let executor = executor(3, 1, 1000);
        let calls = AtomicU32::new(0);

        let _ = executor.execute(|| always_fail(&calls)).await;
        let before_trial = calls.load(Ordering::SeqCst);

        tokio::time::advance(Duration::from_millis(1000)).await;
        let err = assert_err!(executor.execute(|| always_fail(&calls)).await);

        assert!(matches!(err, ExecuteError::Operation(_)));
        assert_eq!(calls.load(Ordering::SeqCst), before_trial + 1);
        assert_eq!(executor.circuit_state(), CircuitState::Open);
        assert!(executor.execute(|| always_fail(&calls)).await.unwrap_err().is_circuit_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_call_rejected_during_trial() {
        let executor = executor(0, 1, 1000);
        let calls = AtomicU32::new(0);

        let _ = executor.execute(|| always_fail(&calls)).await;
        tokio::time::advance(Duration::from_millis(1000)).await;

        let slow_trial = executor.execute(|| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, String>(())
        });
        let concurrent = async {
            tokio::task::yield_now().await;
            executor.execute(|| always_fail(&calls)).await
        };

        let (trial, other) = tokio::join!(slow_trial, concurrent);
        assert!(trial.is_ok());
        assert!(other.unwrap_err().is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_counts_as_failure() {
        let executor = executor(1, 5, 1000).with_attempt_timeout(Duration::from_millis(50));
        let calls = AtomicU32::new(0);

        let err = assert_err!(
            executor
                .execute(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok::<_, String>(())
                })
                .await
        );

        assert!(matches!(err, ExecuteError::Timeout(d) if d == Duration::from_millis(50)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(executor.breaker().consecutive_failures(), 1);
    }
}
