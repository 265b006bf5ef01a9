// backuptool/src/utils/retry.rs
//! Bounded retry with a fixed delay between attempts.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

/// A bounded, fixed-delay retry schedule.
///
/// Attempts are synchronous from the caller's point of view: the whole
/// schedule blocks until one attempt succeeds or the budget is exhausted.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

/// Returned when every attempt of a [`RetryPolicy`] run failed.
#[derive(Debug)]
pub struct AttemptsExhausted {
    pub attempts: u32,
    pub last_error: String,
}

impl fmt::Display for AttemptsExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "operation failed after {} attempts, last error: {}",
            self.attempts, self.last_error
        )
    }
}

impl std::error::Error for AttemptsExhausted {}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Runs `op` until it succeeds or `max_attempts` failures accumulate.
    ///
    /// No delay is inserted after the final attempt.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, AttemptsExhausted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    warn!(
                        "attempt {}/{} failed: {}",
                        attempt, self.max_attempts, err
                    );
                    last_error = err.to_string();
                }
            }
            if attempt < self.max_attempts {
                sleep(self.delay).await;
            }
        }
        Err(AttemptsExhausted {
            attempts: self.max_attempts,
            last_error,
        })
    }
}
