//! Rate-limited concurrent dispatch of chat requests.
//!
//! Epistemic foundation:
//! - K_i: One task per request; the rate limiter is the only throttle
//! - K_i: Outcomes come back in input index order, whatever the completion order
//! - B_i: Each remote call may fail → a failure outcome for that index only
//! - I^B: When the caller will give up is unknown → one cancellation scope per batch

use crate::client::{retry_backoff, ChatClient, RateLimiter};
use crate::curation::TokenEstimator;
use crate::models::{ApiError, CuratorError, DispatchOutcome, DispatchRequest, FailureKind, Result};
use futures::FutureExt;
use indicatif::ProgressBar;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// State shared by every task of a batch.
#[derive(Clone)]
struct DispatchContext {
    client: Arc<dyn ChatClient>,
    limiter: Arc<RateLimiter>,
    estimator: TokenEstimator,
    model: String,
    completion_reserve: u64,
    max_retries: u32,
}

impl DispatchContext {
    /// Acquire allowance for the request, then make the remote call.
    ///
    /// Every retry of a transient failure goes back through the limiter.
    async fn call(&self, request: &DispatchRequest) -> Result<String> {
        let estimate = self
            .estimator
            .estimate(&request.conversation)
            .saturating_add(self.completion_reserve);

        let mut attempt = 0u32;
        loop {
            let grant = self.limiter.acquire(estimate).await?;
            debug!(
                index = request.index,
                attempt = attempt,
                estimate = estimate,
                waited_ms = grant.waited().as_millis() as u64,
                "Dispatching request"
            );

            // On error the estimated charge stands.
            let error = match self.client.complete(&self.model, &request.conversation).await {
                Ok(completion) => {
                    if let Some(usage) = completion.usage {
                        self.limiter.release(grant, usage.total_tokens);
                    }
                    return Ok(completion.content);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if self.max_retries == 0 => return Err(e),
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
                index = request.index,
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

/// Issues chat requests concurrently, each gated by a shared [`RateLimiter`].
pub struct Dispatcher {
    context: DispatchContext,
    cancel: CancellationToken,
    deadline: Option<Duration>,
    progress: Option<ProgressBar>,
}

impl Dispatcher {
    /// Create a dispatcher that prices requests with `model`'s tokenizer.
    ///
    /// B_i(model supported) → Result
    pub fn new(client: Arc<dyn ChatClient>, limiter: Arc<RateLimiter>, model: &str) -> Result<Self> {
        Ok(Self::with_estimator(client, limiter, TokenEstimator::for_model(model)?))
    }

    /// Create a dispatcher from a ready estimator; requests go to the
    /// estimator's model.
    pub fn with_estimator(
        client: Arc<dyn ChatClient>,
        limiter: Arc<RateLimiter>,
        estimator: TokenEstimator,
    ) -> Self {
        Self {
            context: DispatchContext {
                client,
                limiter,
                model: estimator.model().to_string(),
                estimator,
                completion_reserve: 0,
                max_retries: 0,
            },
            cancel: CancellationToken::new(),
            deadline: None,
            progress: None,
        }
    }

    /// Tokens added to every estimate to cover the expected completion.
    pub fn with_completion_reserve(mut self, tokens: u64) -> Self {
        self.context.completion_reserve = tokens;
        self
    }

    /// Retry transient failures up to `max_retries` times with backoff,
    /// taking a fresh limiter grant for every attempt.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.context.max_retries = max_retries;
        self
    }

    /// Raise cancellation automatically once a batch has run for `deadline`.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Advance `progress` by one for each finished request.
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Cancelling this token ends every in-flight and future batch.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.context.limiter
    }

    /// Dispatch every request and return one outcome per request, ordered
    /// by index.
    ///
    /// Returns after every task has finished. Tasks still waiting for
    /// allowance or a response when cancellation is raised record a
    /// `cancelled` failure; finished tasks keep their outcome.
    pub async fn dispatch(&self, requests: Vec<DispatchRequest>) -> Vec<DispatchOutcome> {
        let total = requests.len();
        let cancel = self.cancel.child_token();
        let watchdog = self.deadline.map(|deadline| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                warn!(deadline_secs = deadline.as_secs_f64(), "Dispatch deadline reached, cancelling");
                cancel.cancel();
            })
        });

        let shared = Arc::new(self.context.clone());
        let indices: Vec<usize> = requests.iter().map(|r| r.index).collect();
        let mut tasks = JoinSet::new();
        for (slot, request) in requests.into_iter().enumerate() {
            let context = Arc::clone(&shared);
            let cancel = cancel.clone();
            tasks.spawn(async move { (slot, run_one(context, request, cancel).await) });
        }

        let mut slots: Vec<Option<DispatchOutcome>> = vec![None; total];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((slot, outcome)) => slots[slot] = Some(outcome),
                Err(e) => warn!(error = %e, "Dispatch task did not complete"),
            }
            if let Some(progress) = &self.progress {
                progress.inc(1);
            }
        }

        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }

        let mut outcomes: Vec<DispatchOutcome> = slots
            .into_iter()
            .zip(indices)
            .map(|(outcome, index)| {
                outcome.unwrap_or_else(|| {
                    DispatchOutcome::failure(index, FailureKind::Internal, "task did not complete")
                })
            })
            .collect();
        outcomes.sort_by_key(|o| o.index);

        let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
        info!(
            total = total,
            succeeded = succeeded,
            failed = total - succeeded,
            cancelled = cancel.is_cancelled(),
            "Dispatch complete"
        );

        outcomes
    }
}

async fn run_one(
    context: Arc<DispatchContext>,
    request: DispatchRequest,
    cancel: CancellationToken,
) -> DispatchOutcome {
    let index = request.index;
    let work = AssertUnwindSafe(context.call(&request)).catch_unwind();

    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CuratorError::Cancelled),
        finished = work => finished.unwrap_or_else(|panic| {
            Err(CuratorError::Internal(format!("task panicked: {}", panic_message(&*panic))))
        }),
    };

    match result {
        Ok(response) => DispatchOutcome::success(index, response),
        Err(e) => {
            let kind = e.kind();
            if kind == FailureKind::Cancelled {
                debug!(index = index, "Request cancelled");
            } else {
                warn!(index = index, kind = kind.as_str(), error = %e, "Request failed");
            }
            DispatchOutcome::failure(index, kind, e.to_string())
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
