//! Fixed-interval retry policy.
//!
//! Reconciliation tasks tolerate arbitrary startup ordering by polling: each
//! attempt either finishes, asks to be retried after one interval, or fails
//! fatally. Waiting always races the cancellation token, so a loop stops
//! within one interval of shutdown no matter which state it is in.

use crate::error::ProvisionError;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Default polling interval for reconciliation tasks
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Result of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step<T> {
    /// Done, stop looping
    Ready(T),
    /// Transient condition, try again after one interval
    Retry(String),
}

/// Interval and optional attempt bound for a polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay between attempts
    pub interval: Duration,
    /// Maximum attempts, `None` = unbounded
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_RETRY_INTERVAL)
    }
}

impl RetryPolicy {
    /// Unbounded retries every `interval`
    #[must_use]
    pub const fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
        }
    }

    /// Bound the number of attempts
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Sleep for one interval unless cancelled first.
    ///
    /// Returns `false` when the token was cancelled.
    pub async fn pause(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            () = cancel.cancelled() => false,
            () = tokio::time::sleep(self.interval) => true,
        }
    }

    /// Run `operation` until it is ready, fails fatally, runs out of
    /// attempts, or `cancel` fires.
    ///
    /// Cancellation is checked before every attempt; an attempt that is
    /// already in flight is allowed to finish.
    ///
    /// # Returns
    /// * `Ok(T)` - the value of the first `Step::Ready`
    /// * `Err(ProvisionError::Cancelled)` - the token fired
    /// * `Err(ProvisionError::RetriesExhausted)` - `max_attempts` reached
    /// * `Err(e)` - `operation` returned a fatal error
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        operation_name: &str,
        mut operation: F,
    ) -> Result<T, ProvisionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Step<T>, ProvisionError>>,
    {
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(ProvisionError::Cancelled);
            }
            attempt += 1;

            match operation().await? {
                Step::Ready(value) => return Ok(value),
                Step::Retry(reason) => {
                    if let Some(max) = self.max_attempts {
                        if attempt >= max {
                            return Err(ProvisionError::RetriesExhausted {
                                operation: operation_name.to_string(),
                                attempts: attempt,
                                last_error: reason,
                            });
                        }
                    }

                    info!(
                        operation = %operation_name,
                        attempt = attempt,
                        retry_ms = self.interval.as_millis(),
                        "{}",
                        reason
                    );

                    if !self.pause(cancel).await {
                        return Err(ProvisionError::Cancelled);
                    }
                }
            }
        }
    }
}
