// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Constant-interval bounded retry.
#[derive(Clone, Copy, Debug)]
pub struct RetryConfig {
    pub tries: u32,
    pub interval: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            tries: 30,
            interval: Duration::from_secs(1),
        }
    }
}

impl RetryConfig {
    pub fn new(tries: u32, interval: Duration) -> Self {
        RetryConfig { tries, interval }
    }
}

#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed; carries the last error.
    Exhausted { tries: u32, source: E },
    /// The token was cancelled before an attempt succeeded.
    Cancelled,
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Exhausted { tries, source } => {
                write!(f, "failed after {tries} attempts: {source}")
            }
            RetryError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl<E: fmt::Display + fmt::Debug> std::error::Error for RetryError<E> {}

/// Run `attempt` until it succeeds, the attempt budget is exhausted, or the
/// token is cancelled. Failures are logged at debug level with the operation
/// name; the interval is slept between attempts, never before the first.
pub async fn retry_constant<T, E, F, Fut>(
    cancel: &CancellationToken,
    config: RetryConfig,
    operation: &str,
    mut attempt: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let tries = config.tries.max(1);
    let mut last_err = None;
    for try_num in 1..=tries {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        let result = tokio::select! {
            result = attempt() => result,
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
        };
        match result {
            Ok(value) => return Ok(value),
            Err(err) => {
                log::debug!("{operation} attempt {try_num}/{tries} failed: {err}");
                last_err = Some(err);
            }
        }
        if try_num < tries {
            tokio::select! {
                _ = tokio::time::sleep(config.interval) => {}
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            }
        }
    }
    Err(RetryError::Exhausted {
        tries,
        source: last_err.expect("at least one attempt runs"),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::{retry_constant, RetryConfig, RetryError};

    fn quick(tries: u32) -> RetryConfig {
        RetryConfig::new(tries, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn succeeds_after_failures() {
        let cancel = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let attempts = &attempts;
        let result = retry_constant(&cancel, quick(5), "test", || async move {
            if attempts.fetch_add(1, Ordering::SeqCst) < 3 {
                Err("boom")
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn exhausts_attempt_budget() {
        let cancel = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let attempts = &attempts;
        let result: Result<u32, _> = retry_constant(&cancel, quick(2), "test", || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err("boom")
        })
        .await;
        assert!(matches!(
            result,
            Err(RetryError::Exhausted {
                tries: 2,
                source: "boom"
            })
        ));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancellation_returns_immediately() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<u32, RetryError<&str>> =
            retry_constant(&cancel, quick(5), "test", || async move { Err("boom") }).await;
        assert!(matches!(result, Err(RetryError::Cancelled)));
    }

    #[tokio::test]
    async fn cancellation_during_backoff() {
        let cancel = CancellationToken::new();
        let config = RetryConfig::new(5, Duration::from_secs(60));
        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel2.cancel();
        });
        let result: Result<u32, RetryError<&str>> =
            retry_constant(&cancel, config, "test", || async { Err("boom") }).await;
        assert!(matches!(result, Err(RetryError::Cancelled)));
    }
}
