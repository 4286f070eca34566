//! Stoppable periodic background tasks.
//!
//! Limiter cleanup, store sweeps and ring membership sync all run on a fixed
//! interval owned by the component that needs them. Each one is a
//! [`PeriodicTask`] that can be cancelled and joined during shutdown.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// A background loop that runs a tick function on a fixed interval.
#[derive(Debug)]
pub struct PeriodicTask {
    name: &'static str,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Spawn a task that calls `tick` every `period`.
    ///
    /// The first tick happens one full period after spawning. A panicking
    /// tick is logged and the loop keeps going.
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let child = token.clone();
        let period = period.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(panic) = AssertUnwindSafe(tick()).catch_unwind().await {
                            error!(
                                task = name,
                                panic = %panic_message(&panic),
                                "Periodic task tick panicked"
                            );
                        }
                    }
                }
            }

            debug!(task = name, "Periodic task stopped");
        });

        debug!(task = name, period_ms = period.as_millis() as u64, "Periodic task started");

        Self { name, token, handle }
    }

    /// Name given at spawn time.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the loop has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel the loop and wait for it to exit.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            error!(task = self.name, error = %e, "Periodic task did not exit cleanly");
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
