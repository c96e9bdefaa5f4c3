//! Caller-directed retry for transient remote failures.
//!
//! Epistemic foundation:
//! - K_i: Only errors with `is_retryable()` are attempted again
//! - I^B: Network availability unknowable → retry with backoff
//! - B_i: A server `retry-after` hint is better than our own backoff guess

use crate::client::{ChatClient, Completion};
use crate::models::{ApiError, Conversation, CuratorError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Delay before the attempt after `attempt`: the server's hint when it is a
/// representable duration, otherwise `2^attempt` seconds.
pub fn retry_backoff(attempt: u32, error: &CuratorError) -> Duration {
    error
        .retry_after()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .unwrap_or_else(|| Duration::from_secs(2u64.saturating_pow(attempt)))
}

/// Wraps a [`ChatClient`] and retries transient failures with exponential
/// backoff.
///
/// Retries here bypass any rate limiter; under a [`Dispatcher`] use
/// `Dispatcher::with_max_retries` so each attempt takes its own grant.
///
/// [`Dispatcher`]: crate::pool::Dispatcher
#[derive(Debug, Clone)]
pub struct RetryingClient<C> {
    inner: C,
    max_retries: u32,
}

impl<C: ChatClient> RetryingClient<C> {
    /// `max_retries` counts attempts after the first one.
    pub fn new(inner: C, max_retries: u32) -> Self {
        Self { inner, max_retries }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

#[async_trait]
impl<C: ChatClient> ChatClient for RetryingClient<C> {
    async fn complete(&self, model: &str, conversation: &Conversation) -> Result<Completion> {
        let mut attempt = 0u32;
        loop {
            let error = match self.inner.complete(model, conversation).await {
                Ok(completion) => return Ok(completion),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => e,
            };

            if attempt >= self.max_retries {
                return Err(ApiError::MaxRetriesExceeded {
                    attempts: attempt + 1,
                    last_error: error.to_string(),
                }
                .into());
            }

            let backoff = retry_backoff(attempt, &error);
            debug!(
                attempt = attempt,
                backoff_secs = backoff.as_secs_f64(),
                error = %error,
                "Retrying after transient error"
            );
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }
}
