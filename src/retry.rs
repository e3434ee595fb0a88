use backoff::{ExponentialBackoff, backoff::Backoff};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{RedditError, Result};

/// How hard to push on transient failures. `attempts: None` retries forever.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub attempts: Option<u32>,
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: None,
            initial_ms: 2000,
            max_ms: 2000,
            multiplier: 1.0,
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: Duration::from_millis(self.initial_ms),
            initial_interval: Duration::from_millis(self.initial_ms),
            max_interval: Duration::from_millis(self.max_ms.max(self.initial_ms)),
            multiplier: self.multiplier.max(1.0),
            randomization_factor: 0.0,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }
}

/// Run `op` until it succeeds, fails non-transiently, runs out of attempts, or
/// `cancel` fires. Cancellation interrupts both the in-flight call and the sleep.
pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut eb = policy.backoff();
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(RedditError::Cancelled),
            r = op() => r,
        };
        let err = match outcome {
            Ok(v) => {
                if attempt > 1 {
                    tracing::info!(what, attempt, "Recovered after transient failure");
                }
                return Ok(v);
            }
            Err(e) if e.is_transient() => e,
            Err(e) => return Err(e),
        };

        if policy.attempts.is_some_and(|max| attempt >= max) {
            tracing::error!(what, attempt, error = %err, "Giving up");
            return Err(RedditError::Exhausted {
                attempts: attempt,
                last: Box::new(err),
            });
        }

        let mut sleep = eb.next_backoff().unwrap_or(Duration::from_millis(policy.max_ms));
        if let RedditError::RateLimited {
            retry_after: Some(hint),
        } = &err
        {
            sleep = sleep.max(*hint);
        }
        tracing::warn!(
            what,
            attempt,
            backoff_ms = sleep.as_millis() as u64,
            error = %err,
            "Transient failure, backing off"
        );
        tokio::select! {
            _ = cancel.cancelled() => return Err(RedditError::Cancelled),
            _ = tokio::time::sleep(sleep) => {}
        }
    }
}
