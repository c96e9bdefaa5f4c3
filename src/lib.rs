//! curator - Token-budgeted dataset curation and rate-limited chat dispatch.
//!
//! ## Architecture
//!
//! - **Curation**: Validate conversations, price them with the model's
//!   tokenizer, accept them in input order until the token budget is spent
//! - **Dispatch**: Send conversations concurrently to a chat-completion
//!   endpoint, gated by a shared request/token rate limiter, and collect one
//!   outcome per request in input order
//!
//! ## Epistemic Design
//!
//! - K_i (Knowledge): Compile-time enforced invariants (types, enums)
//! - B_i (Beliefs): Runtime fallible operations (Result, Option)
//! - I^R (Resolvable): User-configurable parameters
//! - I^B (Bounded): Network/API uncertainties (classification, cancellation)

pub mod client;
pub mod curation;
pub mod models;
pub mod pipeline;
pub mod pool;

// Re-exports for convenience
pub use client::{ChatClient, OpenAiClient, RateBudget, RateLimiter, Replenish, RetryingClient};
pub use curation::{curate, estimate_tokens, validate, BudgetCurator, FormatReport, TokenEstimator};
pub use models::{
    ChatMessage, Config, Conversation, CurationResult, CuratorError, DispatchOutcome, DispatchRequest,
    FailureKind, RejectReason, Result, Role,
};
pub use pipeline::{CurationPipeline, DispatchPipeline};
pub use pool::Dispatcher;
