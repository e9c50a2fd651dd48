//! Backoff and polling for services that take a while to come up.

use std::future::Future;
use std::time::{Duration, Instant};

/// Doubling delay between readiness probes, capped at `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    max: Duration,
    current: Duration,
}

impl ExponentialBackoff {
    /// Creates a new backoff starting at `initial`, capping at `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            max,
            current: initial,
        }
    }

    /// Returns the current backoff duration.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Advances to the next backoff interval (doubles, capped at max).
    pub fn next(&mut self) {
        self.current = (self.current * 2).min(self.max);
    }
}

/// Polls `probe` until it returns true or `timeout` elapses.
///
/// Returns whether the probe succeeded.
pub async fn wait_until<F, Fut>(
    mut backoff: ExponentialBackoff,
    timeout: Duration,
    mut probe: F,
) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;

    loop {
        if probe().await {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(backoff.current().min(deadline - now)).await;
        backoff.next();
    }
}
