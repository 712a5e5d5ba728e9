use std::future::Future;
use tokio::time::Duration;
use tracing::{error, warn};

use crate::error::TradeError;

/// Retries network-layer and ledger-state failures.
pub fn transient(error: &TradeError) -> bool {
    error.is_transient()
}

/// Also retries an inner policy's exhaustion when its last cause was transient.
pub fn transient_root(error: &TradeError) -> bool {
    error.root_cause().is_transient()
}

/// Bounded retry shared by trade submission and the monitor's sell path.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub retryable: fn(&TradeError) -> bool,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_factor", &self.backoff_factor)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_millis(1_000))
    }
}

impl RetryPolicy {
    /// Same delay between every attempt.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: delay,
            max_delay: delay,
            backoff_factor: 1.0,
            retryable: transient,
        }
    }

    pub fn exponential(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay,
            backoff_factor: 2.0,
            retryable: transient,
        }
    }

    pub fn retrying_on(mut self, retryable: fn(&TradeError) -> bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Delay slept after the failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.powi(attempt.saturating_sub(1) as i32);
        std::cmp::min(self.initial_delay.mul_f64(factor), self.max_delay)
    }

    pub fn should_retry(&self, error: &TradeError) -> bool {
        (self.retryable)(error)
    }

    /// Runs `operation` until it succeeds, fails with a non-transient error,
    /// or the attempt ceiling is reached. The closure receives the 1-based
    /// attempt number.
    ///
    /// Exhaustion surfaces `TradeFailed` carrying the last error.
    pub async fn run<F, Fut, T>(&self, label: &str, mut operation: F) -> Result<T, TradeError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, TradeError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation(attempt).await {
                Ok(result) => return Ok(result),
                Err(err) if !self.should_retry(&err) => {
                    error!("{} failed on attempt {} (not retryable): {}", label, attempt, err);
                    return Err(err);
                }
                Err(err) if attempt >= self.max_attempts => {
                    error!(
                        "{} failed after {} attempt(s), giving up: {}",
                        label, attempt, err
                    );
                    return Err(TradeError::TradeFailed {
                        attempts: attempt,
                        source: Box::new(err),
                    });
                }
                Err(err) => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {:?}...",
                        label, attempt, self.max_attempts, err, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
