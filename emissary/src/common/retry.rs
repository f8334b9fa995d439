// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use std::{fmt::Display, future::Future, time::Duration};

use tokio_util::sync::CancellationToken;

/// Fixed-delay retry, optionally capped at a number of attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub delay: Duration,
  /// `None` retries until cancelled
  pub max_attempts: Option<u32>,
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
  #[error("gave up after {attempts} attempts; last error: {last}")]
  Exhausted { attempts: u32, last: E },
  #[error("non-retryable failure on attempt {attempt}: {error}")]
  Aborted { attempt: u32, error: E },
  #[error("cancelled before an attempt succeeded")]
  Cancelled,
}

impl<E> RetryError<E> {
  /// The error from the final attempt, if any attempt completed
  pub fn last_error(&self) -> Option<&E> {
    match self {
      RetryError::Exhausted { last, .. } => Some(last),
      RetryError::Aborted { error, .. } => Some(error),
      RetryError::Cancelled => None,
    }
  }
}

impl RetryPolicy {
  pub const fn unbounded(delay: Duration) -> Self {
    Self {
      delay,
      max_attempts: None,
    }
  }

  pub const fn bounded(delay: Duration, max_attempts: u32) -> Self {
    Self {
      delay,
      max_attempts: Some(max_attempts),
    }
  }

  fn is_exhausted(&self, attempt: u32) -> bool {
    matches!(self.max_attempts, Some(max) if attempt >= max)
  }

  /// Runs `attempt_fn` until it succeeds, retrying every failure
  pub async fn run<T, E, F, Fut>(
    &self,
    operation: &'static str,
    shutdown: &CancellationToken,
    attempt_fn: F,
  ) -> Result<T, RetryError<E>>
  where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
  {
    self
      .run_while(operation, shutdown, attempt_fn, |_| true)
      .await
  }

  /// Runs `attempt_fn` until it succeeds, the ceiling is hit, shutdown is
  /// requested, or it fails with an error `is_retryable` refuses.
  ///
  /// Attempts are numbered from 1. Cancellation interrupts both an in-flight
  /// attempt and the delay between attempts.
  pub async fn run_while<T, E, F, Fut, R>(
    &self,
    operation: &'static str,
    shutdown: &CancellationToken,
    mut attempt_fn: F,
    is_retryable: R,
  ) -> Result<T, RetryError<E>>
  where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    R: Fn(&E) -> bool,
  {
    let mut attempt = 0u32;
    loop {
      attempt = attempt.saturating_add(1);
      let error = tokio::select! {
        biased;
        _ = shutdown.cancelled() => return Err(RetryError::Cancelled),
        res = attempt_fn(attempt) => match res {
          Ok(value) => return Ok(value),
          Err(error) => error,
        },
      };
      if !is_retryable(&error) {
        return Err(RetryError::Aborted { attempt, error });
      }
      if self.is_exhausted(attempt) {
        tracing::warn!(operation, attempt, error = %error, "retry ceiling reached");
        return Err(RetryError::Exhausted {
          attempts: attempt,
          last: error,
        });
      }
      tracing::warn!(
        operation,
        attempt,
        error = %error,
        delay = ?self.delay,
        "attempt failed; retrying"
      );
      tokio::select! {
        biased;
        _ = shutdown.cancelled() => return Err(RetryError::Cancelled),
        _ = tokio::time::sleep(self.delay) => {}
      }
    }
  }
}
