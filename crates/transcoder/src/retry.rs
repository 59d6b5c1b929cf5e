//! Retry policy and the generic retry-with-backoff primitive.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Configuration for retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Initial delay between retries in milliseconds.
    pub initial_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Timeout of a single stream health probe in milliseconds.
    pub health_check_timeout_ms: u64,
    /// Whether to add up to 25% jitter to delays.
    pub use_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay_ms: 2_000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            health_check_timeout_ms: 10_000,
            use_jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Check the policy invariants.
    pub fn validate(&self) -> Result<()> {
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(Error::config(format!(
                "max_delay_ms ({}) must not be lower than initial_delay_ms ({})",
                self.max_delay_ms, self.initial_delay_ms
            )));
        }
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier <= 1.0 {
            return Err(Error::config(format!(
                "backoff_multiplier must be greater than 1, got {}",
                self.backoff_multiplier
            )));
        }
        Ok(())
    }

    /// Calculate the delay before a given attempt. The first attempt never waits.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay_ms as f64
            * self
                .backoff_multiplier
                .powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32);

        let mut delay_ms = base_delay.min(self.max_delay_ms as f64);

        if self.use_jitter {
            delay_ms += delay_ms * 0.25 * rand::random::<f64>();
            delay_ms = delay_ms.min(self.max_delay_ms as f64);
        }

        Duration::from_millis(delay_ms as u64)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    /// Total number of attempts the policy allows.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Recoverability of one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Recoverable,
    NonRecoverable,
}

impl ErrorClass {
    pub fn from_recoverable(recoverable: bool) -> Self {
        if recoverable {
            Self::Recoverable
        } else {
            Self::NonRecoverable
        }
    }
}

/// Result of one guarded attempt, consumed immediately by the loop.
#[derive(Debug)]
pub enum AttemptOutcome<T, E> {
    Success(T),
    Failure { class: ErrorClass, error: E },
}

/// Why the retry loop gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Cancellation arrived while waiting between attempts.
    Cancelled,
    /// An attempt failed with a non-recoverable error.
    Aborted { attempts: u32, last_error: E },
    /// Every allowed attempt failed recoverably.
    Exhausted { attempts: u32, last_error: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Cancelled => 0,
            Self::Aborted { attempts, .. } | Self::Exhausted { attempts, .. } => *attempts,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => f.write_str("cancelled while waiting to retry"),
            Self::Aborted {
                attempts,
                last_error,
            } => write!(
                f,
                "stopped after {attempts} attempts on a non-recoverable error: {last_error}"
            ),
            Self::Exhausted {
                attempts,
                last_error,
            } => write!(f, "failed after {attempts} attempts, last error: {last_error}"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

impl RetryError<Error> {
    /// Fold into the crate error, tagging it with the operation name.
    pub fn into_error(self, operation: &'static str) -> Error {
        match self {
            Self::Cancelled => Error::Cancelled,
            Self::Aborted { last_error, .. } | Self::Exhausted { last_error, .. }
                if last_error.is_cancelled() =>
            {
                Error::Cancelled
            }
            Self::Aborted {
                attempts,
                last_error,
            } => Error::Aborted {
                operation,
                attempts,
                last_error: Box::new(last_error),
            },
            Self::Exhausted {
                attempts,
                last_error,
            } => Error::RetriesExhausted {
                operation,
                attempts,
                last_error: Box::new(last_error),
            },
        }
    }
}

/// Run `op` until it succeeds, fails non-recoverably, or the policy runs out.
///
/// `op` receives the zero-based attempt number. Between attempts the loop
/// sleeps for [`RetryPolicy::delay_for_attempt`]; cancelling `token` during
/// that sleep ends the loop with [`RetryError::Cancelled`]. On success the
/// value is returned together with the number of attempts used.
pub async fn retry_with_backoff<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    operation: &'static str,
    is_recoverable: C,
    mut op: F,
) -> std::result::Result<(T, u32), RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    C: Fn(&E) -> bool,
    E: fmt::Display,
{
    let mut attempt: u32 = 0;

    loop {
        if attempt > 0 {
            let delay = policy.delay_for_attempt(attempt);
            debug!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Waiting before retry"
            );
            tokio::select! {
                _ = token.cancelled() => {
                    info!(operation, attempt, "Retry cancelled during backoff");
                    return Err(RetryError::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let outcome = match op(attempt).await {
            Ok(value) => AttemptOutcome::Success(value),
            Err(error) => AttemptOutcome::Failure {
                class: ErrorClass::from_recoverable(is_recoverable(&error)),
                error,
            },
        };
        let attempts = attempt + 1;

        match outcome {
            AttemptOutcome::Success(value) => {
                if attempt > 0 {
                    info!(operation, attempts, "Succeeded after retry");
                }
                return Ok((value, attempts));
            }
            AttemptOutcome::Failure {
                class: ErrorClass::NonRecoverable,
                error,
            } => {
                warn!(operation, attempts, error = %error, "Non-recoverable failure, giving up");
                return Err(RetryError::Aborted {
                    attempts,
                    last_error: error,
                });
            }
            AttemptOutcome::Failure {
                class: ErrorClass::Recoverable,
                error,
            } => {
                if attempt >= policy.max_retries {
                    warn!(operation, attempts, error = %error, "Retries exhausted");
                    return Err(RetryError::Exhausted {
                        attempts,
                        last_error: error,
                    });
                }
                warn!(
                    operation,
                    attempt = attempts,
                    max_attempts = policy.max_attempts(),
                    error = %error,
                    "Attempt failed, will retry"
                );
                attempt += 1;
            }
        }
    }
}
