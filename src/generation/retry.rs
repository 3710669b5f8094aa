//! Bounded retries with exponential backoff and a per-call timeout.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::GenerationConfig;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Bound on a single call, independent of the retry budget.
    pub call_timeout: Duration,
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl From<&GenerationConfig> for RetryPolicy {
    fn from(config: &GenerationConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            call_timeout: Duration::from_secs(config.call_timeout_secs),
        }
    }
}

/// Errors that know whether another attempt could help.
pub trait Retryable {
    fn is_transient(&self) -> bool;
    fn timed_out() -> Self;
}

/// Run `call` until it succeeds, fails permanently or the attempt budget
/// is spent. `call` receives the 1-based attempt number.
pub async fn with_retries<T, E, F, Fut>(policy: &RetryPolicy, label: &str, mut call: F) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        let result = match tokio::time::timeout(policy.call_timeout, call(attempt)).await {
            Ok(result) => result,
            Err(_) => Err(E::timed_out()),
        };

        match result {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{label} succeeded on attempt {attempt}");
                }
                return Ok(value);
            }
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "{label} attempt {attempt}/{} failed: {e}, retrying in {}ms",
                    policy.max_attempts,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                warn!("{label} failed after {attempt} attempt(s): {e}");
                return Err(e);
            }
        }
    }
}
