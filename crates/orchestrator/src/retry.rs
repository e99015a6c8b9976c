use crate::classify::classify;
use crate::error::{OrchestratorError, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 1000;
const MAX_BACKOFF_MS: u64 = 30000;

/// Bounded exponential backoff applied at retry boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(MAX_BACKOFF_MS),
        }
    }
}

impl RetryPolicy {
    /// A policy that runs the operation once.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    /// Delay before retrying after the given (1-based) failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error,
/// or exhausts the policy. `on_retry` is called before every backoff sleep.
pub async fn with_retry<T, F, Fut, R>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation_name: &str,
    mut operation: F,
    mut on_retry: R,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
    R: FnMut(u32, &OrchestratorError),
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let err = match operation(attempt).await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        let kind = classify(&err);
        if !kind.is_retryable() {
            if attempt > 1 {
                info!(
                    "{} failed after {} attempts: {}",
                    operation_name, attempt, err
                );
            }
            return Err(err);
        }
        if attempt >= max_attempts {
            error!(
                "{} failed after {} attempts ({}): {}",
                operation_name, attempt, kind, err
            );
            return Err(err);
        }

        let wait = policy.backoff(attempt);
        warn!(
            "{} failed ({}), retrying in {}ms (attempt {}/{})",
            operation_name,
            kind,
            wait.as_millis(),
            attempt + 1,
            max_attempts
        );
        on_retry(attempt, &err);

        tokio::select! {
            _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
            _ = tokio::time::sleep(wait) => {}
        }
        attempt += 1;
    }
}
