//! Retry utilities with exponential backoff and jitter.
//!
//! Used for all external calls (Kubernetes API, cloud adapter) and for the
//! orchestrator's bounded waits: a replacement node becoming initialized,
//! and an old node disappearing from the API after deletion. Jitter keeps
//! many workers from backing off in lockstep.

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

// Jitter spreads each delay across [0.5x, 1.5x].
const JITTER_LOW: f64 = 0.5;
const JITTER_HIGH: f64 = 1.5;

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = retry forever)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Retry budget for waiting on node readiness or node disappearance.
    ///
    /// Readiness takes a while: the instance must boot, register, and have
    /// daemonset device plugins report their extended resources. Deletion
    /// is slow under restrictive PDBs that throttle the drain. 2s doubling
    /// to a 10s cap over 60 attempts comes to roughly 9.5 minutes.
    pub fn node_wait() -> Self {
        Self {
            max_attempts: 60,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }

    // The delay after `delay`, capped at max_delay.
    fn next_delay(&self, delay: Duration) -> Duration {
        let grown = delay.as_secs_f64() * self.backoff_multiplier;
        Duration::from_secs_f64(grown.min(self.max_delay.as_secs_f64()))
    }

    fn out_of_attempts(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries until the operation succeeds, or until the attempt budget is
/// exhausted, in which case the last error is returned.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = config.initial_delay;

    for attempt in 1u32.. {
        let err = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if config.out_of_attempts(attempt) {
            error!(
                operation = %operation_name,
                attempt,
                error = %err,
                "operation failed after max retries"
            );
            return Err(err);
        }

        let jitter = rand::thread_rng().gen_range(JITTER_LOW..JITTER_HIGH);
        let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
        warn!(
            operation = %operation_name,
            attempt,
            error = %err,
            delay_ms = jittered.as_millis(),
            "operation failed, retrying"
        );
        tokio::time::sleep(jittered).await;
        delay = config.next_delay(delay);
    }
    unreachable!("retry loop only exits via return")
}
