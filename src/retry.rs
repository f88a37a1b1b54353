use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::RetrySettings;
use crate::error::{ErrorKind, HarvestError, Result};

/// Exponential backoff around a fallible operation.
///
/// `tries` counts attempts, not retries: with `tries = 3` the operation runs at
/// most three times and the third failure is returned unchanged.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    tries: u32,
    delay: Duration,
    backoff: f64,
    transient: Vec<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::new(3, Duration::from_secs(1), 2.0)
    }
}

impl RetryPolicy {
    pub fn new(tries: u32, delay: Duration, backoff: f64) -> Self {
        RetryPolicy {
            tries: tries.max(1),
            delay,
            backoff,
            transient: ErrorKind::TRANSIENT.to_vec(),
        }
    }

    pub fn from_settings(s: &RetrySettings) -> Self {
        RetryPolicy::new(s.tries, Duration::from_millis(s.delay_ms), s.backoff)
    }

    pub fn with_transient(mut self, kinds: &[ErrorKind]) -> Self {
        self.transient = kinds.to_vec();
        self
    }

    pub fn with_tries(&self, tries: u32) -> Self {
        RetryPolicy {
            tries: tries.max(1),
            ..self.clone()
        }
    }

    pub fn with_delay(&self, delay: Duration) -> Self {
        RetryPolicy {
            delay,
            ..self.clone()
        }
    }

    pub fn is_transient(&self, err: &HarvestError) -> bool {
        self.transient.contains(&err.kind())
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempts run out. `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delay = self.delay;
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) if attempt < self.tries && self.is_transient(&e) => {
                    warn!(
                        "{}: {} (attempt {}/{}), retrying in {:.1}s",
                        label,
                        e,
                        attempt,
                        self.tries,
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.mul_f64(self.backoff);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Probe `condition` every `interval` until it yields a value or `timeout`
/// elapses. The probe always runs at least once, so a zero timeout is a
/// single non-blocking check.
///
/// Non-fatal probe errors count as "not yet"; fatal ones end the poll.
pub async fn poll_until<T, F, Fut>(
    timeout: Duration,
    interval: Duration,
    mut condition: F,
) -> Result<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        match condition().await {
            Ok(Some(v)) => return Ok(Some(v)),
            Ok(None) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => debug!("poll probe failed: {}", e),
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}
