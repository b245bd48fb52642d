//! Retry of transient datastore failures.
//!
//! Every statement goes through [`RetryDriver::run`]. Timeouts are retried
//! after a fixed backoff with the identical statement; anything else fails
//! immediately. Without bounds the driver retries forever.

use common::config::RetryConfig;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use crate::datastore::DatastoreError;
use crate::error::DownsampleError;
use crate::metrics::DownsampleMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff: Duration,
    pub max_attempts: Option<u32>,
    pub max_elapsed: Option<Duration>,
}

impl RetryPolicy {
    /// Retry forever with a fixed backoff.
    pub fn unbounded(backoff: Duration) -> Self {
        Self {
            backoff,
            max_attempts: None,
            max_elapsed: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = Some(max_elapsed);
        self
    }

    /// Whether another attempt is allowed after `attempts` failures.
    fn exhausted(&self, attempts: u32, elapsed: Duration) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
            || self.max_elapsed.is_some_and(|max| elapsed >= max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            backoff: config.backoff,
            max_attempts: config.max_attempts,
            max_elapsed: config.max_elapsed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryDriver {
    policy: RetryPolicy,
    metrics: DownsampleMetrics,
}

impl RetryDriver {
    pub fn new(policy: RetryPolicy, metrics: DownsampleMetrics) -> Self {
        Self { policy, metrics }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `attempt` until it succeeds, fails fatally, or the policy gives up.
    ///
    /// `operation` names the call in logs and errors.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        mut attempt: F,
    ) -> Result<T, DownsampleError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DatastoreError>>,
    {
        let started = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let error = match attempt().await {
                Ok(value) => {
                    if attempts > 1 {
                        tracing::info!(operation, attempts, "Succeeded after retrying");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !error.is_transient() {
                return Err(DownsampleError::Datastore {
                    operation: operation.to_string(),
                    source: error,
                });
            }

            let elapsed = started.elapsed();
            if self.policy.exhausted(attempts, elapsed) {
                tracing::error!(
                    operation,
                    attempts,
                    ?elapsed,
                    error = %error,
                    "Giving up on transient error"
                );
                return Err(DownsampleError::RetriesExhausted {
                    operation: operation.to_string(),
                    attempts,
                    elapsed,
                    source: error,
                });
            }

            tracing::warn!(
                operation,
                attempt = attempts,
                backoff = ?self.policy.backoff,
                error = %error,
                "Transient datastore error, retrying"
            );
            self.metrics.record_retry();
            tokio::time::sleep(self.policy.backoff).await;
        }
    }
}
