// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry with exponential backoff for catalog connectivity.
//!
//! Used around pool connect, schema bootstrap and catalog reads. Captured
//! writes are never retried here: a failed write transaction is rolled back
//! and reported to the caller.
//!
//! # Example
//!
//! ```
//! use catalog_sync::RetryConfig;
//!
//! // Startup: fail fast on a bad connection string
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, Some(5));
//!
//! // Reads: quick retry, then hand the error back
//! let query = RetryConfig::query();
//! assert_eq!(query.max_retries, Some(3));
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};
use crate::storage::traits::StorageError;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Total attempts, `None` retries forever
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::query()
    }
}

impl RetryConfig {
    /// Five attempts over roughly five seconds. Connect and schema bootstrap.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Three quick attempts for a single catalog read.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        delay.mul_f64(self.factor).min(self.max_delay)
    }
}

impl StorageError {
    /// Connectivity-class failures worth another attempt. Rejections and
    /// malformed data fail the same way every time.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Backend(_) | StorageError::Timeout(_))
    }
}

/// Retry `operation` on every error until `config.max_retries` attempts.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_when(operation_name, config, |_| true, operation).await
}

/// Retry only the storage errors that [`StorageError::is_transient`] accepts.
pub async fn retry_transient<F, Fut, T>(
    operation_name: &str,
    config: &RetryConfig,
    operation: F,
) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    retry_when(operation_name, config, StorageError::is_transient, operation).await
}

async fn retry_when<F, Fut, T, E, P>(
    operation_name: &str,
    config: &RetryConfig,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!(operation = operation_name, retries = attempts, "Operation recovered");
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;
                if !should_retry(&err) {
                    return Err(err);
                }
                match config.max_retries {
                    Some(max) if attempts >= max => return Err(err),
                    Some(max) => warn!(
                        operation = operation_name,
                        attempt = attempts,
                        max_attempts = max,
                        error = %err,
                        next_delay = ?delay,
                        "Operation failed, retrying"
                    ),
                    None => warn!(
                        operation = operation_name,
                        attempt = attempts,
                        error = %err,
                        next_delay = ?delay,
                        "Operation failed, retrying indefinitely"
                    ),
                }
                sleep(delay).await;
                delay = config.next_delay(delay);
            }
        }
    }
}
