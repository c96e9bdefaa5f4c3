//! Two-resource admission control for a chat-completion endpoint.
//!
//! Epistemic foundation:
//! - K_i: The endpoint limits both calls and tokens per rolling window
//! - K_i: A call is admitted only when both allowances are available at once
//! - K_i: Waiting callers are admitted in arrival order (no starvation)
//! - B_i: The estimate may differ from the true cost → `release` corrects it
//! - I^B: A cost above the token capacity can never be admitted → fail fast

use crate::models::{CuratorError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Float slack for continuous refill arithmetic.
const REFILL_EPSILON: f64 = 1e-9;

/// How consumed allowance comes back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Replenish {
    /// Each grant's charge is returned one window after it was granted.
    /// No sliding window ever holds more than the capacity.
    #[default]
    Rolling,
    /// Allowance regenerates at `capacity / window` per unit time, starting full.
    Continuous,
}

/// Capacities of the two shared resources.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateBudget {
    /// Calls per window
    pub request_capacity: u64,
    /// Tokens per window
    pub token_capacity: u64,
    pub window: Duration,
    pub replenish: Replenish,
}

impl RateBudget {
    pub fn new(request_capacity: u64, token_capacity: u64, window: Duration) -> Self {
        Self {
            request_capacity,
            token_capacity,
            window,
            replenish: Replenish::default(),
        }
    }

    pub fn with_replenish(mut self, replenish: Replenish) -> Self {
        self.replenish = replenish;
        self
    }

    /// Whether a call of `tokens` could ever be admitted.
    pub fn admits(&self, tokens: u64) -> bool {
        self.request_capacity > 0 && tokens <= self.token_capacity
    }
}

/// Proof of admission for one call.
#[derive(Debug)]
#[must_use = "a grant should be released with the actual token cost"]
pub struct Grant {
    id: u64,
    tokens: u64,
    granted_at: Instant,
    waited: Duration,
}

impl Grant {
    /// Tokens charged at admission.
    pub fn tokens(&self) -> u64 {
        self.tokens
    }

    pub fn granted_at(&self) -> Instant {
        self.granted_at
    }

    /// Time spent queued before admission.
    pub fn waited(&self) -> Duration {
        self.waited
    }
}

#[derive(Debug)]
struct Charge {
    id: u64,
    at: Instant,
    tokens: u64,
}

/// Allowance bookkeeping; only touched under the limiter's lock.
#[derive(Debug)]
enum Allowance {
    Rolling {
        charges: VecDeque<Charge>,
        tokens_in_window: u64,
    },
    Continuous {
        requests: f64,
        tokens: f64,
        refilled_at: Instant,
    },
}

impl Allowance {
    fn new(budget: &RateBudget, now: Instant) -> Self {
        match budget.replenish {
            Replenish::Rolling => Self::Rolling {
                charges: VecDeque::new(),
                tokens_in_window: 0,
            },
            Replenish::Continuous => Self::Continuous {
                requests: budget.request_capacity as f64,
                tokens: budget.token_capacity as f64,
                refilled_at: now,
            },
        }
    }

    /// Take one request and `cost` tokens together, or report how long
    /// until both are available.
    fn try_take(
        &mut self,
        budget: &RateBudget,
        id: u64,
        cost: u64,
        now: Instant,
    ) -> std::result::Result<(), Duration> {
        match self {
            Self::Rolling {
                charges,
                tokens_in_window,
            } => {
                while let Some(oldest) = charges.front() {
                    if oldest.at + budget.window > now {
                        break;
                    }
                    *tokens_in_window = tokens_in_window.saturating_sub(oldest.tokens);
                    charges.pop_front();
                }

                let fits = |count: usize, tokens: u64| {
                    (count as u64) < budget.request_capacity
                        && tokens.saturating_add(cost) <= budget.token_capacity
                };

                if fits(charges.len(), *tokens_in_window) {
                    charges.push_back(Charge { id, at: now, tokens: cost });
                    *tokens_in_window += cost;
                    return Ok(());
                }

                // Walk forward through expiries until enough has aged out.
                let mut count = charges.len();
                let mut tokens = *tokens_in_window;
                for charge in charges.iter() {
                    count -= 1;
                    tokens = tokens.saturating_sub(charge.tokens);
                    if fits(count, tokens) {
                        return Err((charge.at + budget.window).saturating_duration_since(now));
                    }
                }
                Err(budget.window)
            }
            Self::Continuous {
                requests,
                tokens,
                refilled_at,
            } => {
                let window = budget.window.as_secs_f64();
                let request_rate = budget.request_capacity as f64 / window;
                let token_rate = budget.token_capacity as f64 / window;
                let elapsed = now.saturating_duration_since(*refilled_at).as_secs_f64();

                *requests = (*requests + elapsed * request_rate).min(budget.request_capacity as f64);
                *tokens = (*tokens + elapsed * token_rate).min(budget.token_capacity as f64);
                *refilled_at = now;

                let cost = cost as f64;
                if *requests + REFILL_EPSILON >= 1.0 && *tokens + REFILL_EPSILON >= cost {
                    *requests -= 1.0;
                    *tokens -= cost;
                    return Ok(());
                }

                let request_wait = ((1.0 - *requests) / request_rate).max(0.0);
                let token_wait = ((cost - *tokens) / token_rate).max(0.0);
                Err(Duration::from_secs_f64(request_wait.max(token_wait)))
            }
        }
    }

    /// Replace the charge of grant `id` with the actual cost.
    fn settle(&mut self, budget: &RateBudget, id: u64, charged: u64, actual: u64) {
        match self {
            Self::Rolling {
                charges,
                tokens_in_window,
            } => {
                // A charge that already aged out no longer counts against anyone.
                if let Some(charge) = charges.iter_mut().find(|c| c.id == id) {
                    *tokens_in_window = tokens_in_window.saturating_sub(charge.tokens) + actual;
                    charge.tokens = actual;
                }
            }
            Self::Continuous { tokens, .. } => {
                *tokens = (*tokens + charged as f64 - actual as f64).min(budget.token_capacity as f64);
            }
        }
    }
}

/// Admission controller over a request allowance and a token allowance.
///
/// Constructed explicitly and shared by `Arc`; independent limiters never
/// interfere with one another.
#[derive(Debug)]
pub struct RateLimiter {
    budget: RateBudget,
    /// FIFO turn: only the head of the line waits on the allowance
    queue: tokio::sync::Mutex<()>,
    allowance: Mutex<Allowance>,
    next_grant_id: AtomicU64,
    // Stats
    total_grants: AtomicU64,
    total_rejected: AtomicU64,
    total_wait_ms: AtomicU64,
}

impl RateLimiter {
    /// Create a new rate limiter with full allowance.
    pub fn new(budget: RateBudget) -> Self {
        Self {
            allowance: Mutex::new(Allowance::new(&budget, Instant::now())),
            budget,
            queue: tokio::sync::Mutex::new(()),
            next_grant_id: AtomicU64::new(0),
            total_grants: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
            total_wait_ms: AtomicU64::new(0),
        }
    }

    pub fn budget(&self) -> &RateBudget {
        &self.budget
    }

    fn check_admissible(&self, tokens: u64) -> Result<()> {
        if self.budget.admits(tokens) {
            return Ok(());
        }
        self.total_rejected.fetch_add(1, Ordering::Relaxed);
        Err(CuratorError::CapacityExceeded {
            requested: tokens,
            capacity: self.budget.token_capacity,
        })
    }

    fn grant(&self, id: u64, tokens: u64, started: Instant) -> Grant {
        let granted_at = Instant::now();
        let waited = granted_at.saturating_duration_since(started);
        self.total_grants.fetch_add(1, Ordering::Relaxed);
        self.total_wait_ms
            .fetch_add(waited.as_millis() as u64, Ordering::Relaxed);
        Grant {
            id,
            tokens,
            granted_at,
            waited,
        }
    }

    /// Wait until one request and `tokens` tokens can be taken together.
    ///
    /// Callers are admitted in arrival order. Fails immediately with
    /// `CapacityExceeded` when `tokens` could never fit. Dropping the future
    /// gives up the place in line without consuming allowance.
    pub async fn acquire(&self, tokens: u64) -> Result<Grant> {
        self.check_admissible(tokens)?;

        let started = Instant::now();
        let id = self.next_grant_id.fetch_add(1, Ordering::Relaxed);
        let _turn = self.queue.lock().await;

        loop {
            let shortfall = self
                .allowance
                .lock()
                .try_take(&self.budget, id, tokens, Instant::now());

            match shortfall {
                Ok(()) => return Ok(self.grant(id, tokens, started)),
                Err(wait) => {
                    debug!(
                        tokens = tokens,
                        wait_ms = wait.as_millis() as u64,
                        "Waiting for rate limit allowance"
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Take allowance only if it is available now and nobody is queued.
    pub fn try_acquire(&self, tokens: u64) -> Result<Option<Grant>> {
        self.check_admissible(tokens)?;

        let Ok(_turn) = self.queue.try_lock() else {
            return Ok(None);
        };
        let started = Instant::now();
        let id = self.next_grant_id.fetch_add(1, Ordering::Relaxed);
        let taken = self
            .allowance
            .lock()
            .try_take(&self.budget, id, tokens, started);
        Ok(taken.ok().map(|()| self.grant(id, tokens, started)))
    }

    /// Correct a grant's charge once the true token cost is known.
    pub fn release(&self, grant: Grant, actual_tokens: u64) {
        if actual_tokens == grant.tokens {
            return;
        }
        debug!(
            estimated = grant.tokens,
            actual = actual_tokens,
            "Settling rate limit charge"
        );
        self.allowance
            .lock()
            .settle(&self.budget, grant.id, grant.tokens, actual_tokens);
    }

    /// Get statistics.
    pub fn stats(&self) -> RateLimiterStats {
        let total_grants = self.total_grants.load(Ordering::Relaxed);
        let total_wait_ms = self.total_wait_ms.load(Ordering::Relaxed);

        RateLimiterStats {
            total_grants,
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
            total_wait_secs: total_wait_ms as f64 / 1000.0,
            mean_wait_secs: if total_grants > 0 {
                total_wait_ms as f64 / 1000.0 / total_grants as f64
            } else {
                0.0
            },
        }
    }
}

/// Rate limiter statistics.
#[derive(Debug, Clone)]
pub struct RateLimiterStats {
    pub total_grants: u64,
    pub total_rejected: u64,
    pub total_wait_secs: f64,
    pub mean_wait_secs: f64,
}
