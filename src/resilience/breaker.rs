//! Circuit breaker for fail-fast on a failing dependency.

use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Failing, rejecting all requests
    Open,
    /// Letting one trial request through
    HalfOpen,
}

/// Returned instead of calling the dependency while the breaker is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("circuit breaker is open, retry in {retry_after:?}")]
pub struct CircuitOpenError {
    /// Time until the breaker will admit a trial request
    pub retry_after: Duration,
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failed executions before opening
    pub failure_threshold: u32,
    /// Time spent open before a trial is allowed
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Tracks consecutive failures across calls and trips open past a threshold.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config: CircuitBreakerConfig {
                failure_threshold: config.failure_threshold.max(1),
                ..config
            },
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Ask to make a call.
    ///
    /// While open, fails fast until `reset_timeout` has elapsed; the first
    /// caller after that gets the single half-open trial permit.
    pub fn try_acquire(&self) -> Result<CircuitPermit<'_>, CircuitOpenError> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => Ok(CircuitPermit::new(self, false)),
            CircuitState::Open => {
                let opened_at = inner.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= self.config.reset_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    debug!("Circuit breaker half-open, allowing trial request");
                    Ok(CircuitPermit::new(self, true))
                } else {
                    Err(CircuitOpenError {
                        retry_after: self.config.reset_timeout - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(CircuitOpenError {
                        retry_after: Duration::ZERO,
                    })
                } else {
                    inner.trial_in_flight = true;
                    Ok(CircuitPermit::new(self, true))
                }
            }
        }
    }

    /// Current state. An open breaker past its timeout still reports `Open`
    /// until a caller takes the trial.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Consecutive failed executions since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Force the breaker closed.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.inner.lock();
        if trial {
            inner.trial_in_flight = false;
            if inner.state == CircuitState::HalfOpen {
                info!("Circuit breaker closed after successful trial");
            }
        } else if inner.state != CircuitState::Closed {
            // Permit predates the open state; only the trial may close it
            debug!(state = ?inner.state, "Ignoring late success on open circuit breaker");
            return;
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    fn on_failure(&self, trial: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        if trial {
            inner.trial_in_flight = false;
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
            warn!(
                failures = inner.consecutive_failures,
                "Circuit breaker trial failed, reopening"
            );
            return;
        }

        if inner.state == CircuitState::Closed
            && inner.consecutive_failures >= self.config.failure_threshold
        {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
            warn!(
                failures = inner.consecutive_failures,
                reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
                "Circuit breaker opened"
            );
        }
    }

    fn on_abandoned(&self, trial: bool) {
        if trial {
            self.inner.lock().trial_in_flight = false;
        }
    }
}

/// Permission to make one call, obtained from [`CircuitBreaker::try_acquire`].
///
/// Report the outcome with [`record_success`](Self::record_success) or
/// [`record_failure`](Self::record_failure). Dropping it unreported (for
/// example when the caller's future is cancelled) records nothing and
/// frees the half-open trial slot.
#[derive(Debug)]
#[must_use = "report the call outcome on the permit"]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    reported: bool,
}

impl<'a> CircuitPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            reported: false,
        }
    }

    /// Whether this permit is the half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// The call succeeded.
    pub fn record_success(mut self) {
        self.reported = true;
        self.breaker.on_success(self.trial);
    }

    /// The call failed.
    pub fn record_failure(mut self) {
        self.reported = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.reported {
            self.breaker.on_abandoned(self.trial);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            reset_timeout: Duration::from_millis(reset_ms),
        })
    }

    fn fail(breaker: &CircuitBreaker) {
        breaker.try_acquire().unwrap().record_failure();
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let breaker = breaker(3, 1000);

        fail(&breaker);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Closed);

        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);

        let err = breaker.try_acquire().unwrap_err();
        assert_eq!(err.retry_after, Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let breaker = breaker(3, 1000);

        fail(&breaker);
        fail(&breaker);
        breaker.try_acquire().unwrap().record_success();
        fail(&breaker);

        assert_eq!(breaker.consecutive_failures(), 1);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_success_does_not_close_open_breaker() {
        let breaker = breaker(1, 1000);

        let slow = breaker.try_acquire().unwrap();
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);

        slow.record_success();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.consecutive_failures(), 1);
        assert_eq!(
            breaker.try_acquire().unwrap_err().retry_after,
            Duration::from_millis(1000)
        );

        // The trial is still the way out
        tokio::time::advance(Duration::from_millis(1000)).await;
        let trial = breaker.try_acquire().unwrap();
        assert!(trial.is_trial());
        trial.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_success_during_trial_keeps_half_open() {
        let breaker = breaker(1, 1000);

        let slow = breaker.try_acquire().unwrap();
        fail(&breaker);
        tokio::time::advance(Duration::from_millis(1000)).await;
        let trial = breaker.try_acquire().unwrap();

        slow.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_acquire().is_err());

        trial.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trial_after_timeout() {
        let breaker = breaker(1, 1000);
        fail(&breaker);

        tokio::time::advance(Duration::from_millis(1000)).await;

        let trial = breaker.try_acquire().unwrap();
        assert!(trial.is_trial());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Only one trial at a time
        assert!(breaker.try_acquire().is_err());

        trial.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
        assert!(breaker.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let breaker = breaker(1, 1000);
        fail(&breaker);

        tokio::time::advance(Duration::from_millis(1000)).await;
        breaker.try_acquire().unwrap().record_failure();

        assert_eq!(breaker.state(), CircuitState::Open);
        // The open period restarts from the failed trial
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(
            breaker.try_acquire().unwrap_err().retry_after,
            Duration::from_millis(500)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_frees_slot() {
        let breaker = breaker(1, 1000);
        fail(&breaker);
        tokio::time::advance(Duration::from_millis(1000)).await;

        drop(breaker.try_acquire().unwrap());

        let retry = breaker.try_acquire().unwrap();
        assert!(retry.is_trial());
        retry.record_success();
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_reset() {
        let breaker = breaker(1, 60_000);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire().is_ok());
    }
}
