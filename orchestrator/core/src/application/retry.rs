// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Bounded exponential backoff for idempotent repository reads.
//!
//! Writes never go through here: a failed write fails the operation and the
//! caller re-issues the whole request.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::domain::config::RetryConfig;
use crate::domain::error::CoordinationError;
use crate::domain::repository::RepositoryError;

#[derive(Debug, Clone, Copy)]
pub struct ReadRetry {
    attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl Default for ReadRetry {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl ReadRetry {
    pub fn new(attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            initial_backoff,
            max_backoff,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.read_attempts,
            Duration::from_millis(config.initial_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
        )
    }

    /// Single attempt, no backoff.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    fn next_backoff(&self, backoff: Duration) -> Duration {
        backoff.saturating_mul(2).min(self.max_backoff)
    }

    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, CoordinationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RepositoryError>>,
    {
        let mut backoff = self.initial_backoff;
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let err = CoordinationError::from(err);
                    if !err.is_retryable() || attempt >= self.attempts {
                        return Err(err);
                    }
                    warn!(
                        attempt,
                        max_attempts = self.attempts,
                        "Read '{}' failed, retrying in {:?}: {}",
                        what,
                        backoff,
                        err
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = self.next_backoff(backoff);
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retries_storage_errors_until_success() {
        let calls = AtomicU32::new(0);
        let retry = ReadRetry::new(3, Duration::from_millis(1), Duration::from_millis(2));
        let value = retry
            .run("lookup", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RepositoryError::Database("down".into()))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let retry = ReadRetry::new(2, Duration::from_millis(1), Duration::from_millis(1));
        let err = retry
            .run("lookup", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(RepositoryError::Database("down".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(err.error_kind(), "storage_unavailable");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_backoff_doubles_up_to_the_cap_without_overflow() {
        let retry = ReadRetry::new(3, Duration::from_millis(10), Duration::from_millis(25));
        assert_eq!(retry.next_backoff(Duration::from_millis(10)), Duration::from_millis(20));
        assert_eq!(retry.next_backoff(Duration::from_millis(20)), Duration::from_millis(25));

        let unbounded = ReadRetry::new(64, Duration::from_millis(1), Duration::MAX);
        let mut backoff = Duration::from_millis(1);
        for _ in 0..80 {
            backoff = unbounded.next_backoff(backoff);
        }
        assert_eq!(backoff, Duration::MAX);
    }

    #[tokio::test]
    async fn test_non_retryable_errors_fail_fast() {
        let calls = AtomicU32::new(0);
        let err = ReadRetry::default()
            .run("lookup", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(RepositoryError::Conflict {
                    constraint: "delegations_one_pending_per_task".into(),
                    message: "dup".into(),
                })
            })
            .await
            .unwrap_err();
        assert_eq!(err.error_kind(), "invalid_delegation");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
