//! Resilience for calls to the upstream RPC provider.
//!
//! [`ResilientExecutor`] retries failed calls with exponential backoff and
//! jitter, and stops calling altogether while its [`CircuitBreaker`] is open.

mod backoff;
mod breaker;
mod executor;

pub use backoff::RetryPolicy;
pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitOpenError, CircuitPermit, CircuitState};
pub use executor::{ExecuteError, ResilientExecutor};
