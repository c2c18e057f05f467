//! Retry-with-backoff around remote calls.
//!
//! The delay before retry `i` (1-indexed) is `backoff_factor * 2^(i-1)`,
//! without jitter. Only errors carrying a transient code are retried, and
//! only when that code is on the allow-list (if one is configured).

use crate::errors::{StorageError, StorageResult, TransientCode};
use std::{future::Future, time::Duration};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Caller-imposed bounds on a logical operation.
#[derive(Debug, Clone, Default)]
pub struct CallScope {
    pub token: Option<CancellationToken>,
    pub deadline: Option<Instant>,
}

impl CallScope {
    /// Race `fut` against cancellation and the deadline.
    pub async fn guard<T, Fut>(&self, fut: Fut) -> StorageResult<T>
    where
        Fut: Future<Output = StorageResult<T>>,
    {
        if self.token.as_ref().is_some_and(|t| t.is_cancelled()) {
            return Err(StorageError::Cancelled);
        }
        let cancelled = async {
            match &self.token {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            result = fut => result,
            _ = cancelled => Err(StorageError::Cancelled),
            _ = expired => Err(StorageError::DeadlineExceeded),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_factor: Duration,
    /// When set, only these transient codes are retried.
    pub retryable_codes: Option<Vec<TransientCode>>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500))
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_factor: Duration) -> Self {
        Self {
            max_retries,
            backoff_factor,
            retryable_codes: None,
        }
    }

    pub fn with_retryable_codes(mut self, codes: impl IntoIterator<Item = TransientCode>) -> Self {
        self.retryable_codes = Some(codes.into_iter().collect());
        self
    }

    /// Delay before retry number `retry` (1-indexed).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.backoff_factor.saturating_mul(1u32 << exponent)
    }

    pub fn should_retry(&self, err: &StorageError) -> bool {
        match err.transient_code() {
            Some(code) => self
                .retryable_codes
                .as_ref()
                .is_none_or(|allowed| allowed.contains(&code)),
            None => false,
        }
    }

    /// Run `op` until it succeeds, fails permanently, or the retry budget is
    /// spent. Each attempt and each backoff sleep is bounded by `scope`.
    pub async fn run<T, F, Fut>(
        &self,
        scope: &CallScope,
        operation: &'static str,
        mut op: F,
    ) -> StorageResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let err = match scope.guard(op()).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{} succeeded on attempt {}", operation, attempt);
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !self.should_retry(&err) {
                debug!("{} failed without retry: {}", operation, err);
                return Err(err);
            }
            if attempt > self.max_retries {
                error!(
                    "{} exhausted {} retries, last error: {}",
                    operation, self.max_retries, err
                );
                return Err(StorageError::RetriesExhausted {
                    operation,
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = self.delay_for(attempt);
            warn!(
                "{} attempt {}/{} failed ({}), retrying in {:?}",
                operation,
                attempt,
                self.max_retries + 1,
                err,
                delay
            );
            scope
                .guard(async {
                    tokio::time::sleep(delay).await;
                    Ok(())
                })
                .await?;
        }
    }
}
