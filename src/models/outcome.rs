//! Curation and dispatch result types.
//!
//! K_i: These types represent the data leaving the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{Conversation, RejectReason};

/// Outcome of a budgeted curation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CurationResult {
    /// Accepted conversations, preamble included, in input order
    pub accepted: Vec<Conversation>,

    /// Tokens consumed by the accepted conversations
    pub consumed_tokens: u64,

    /// Absolute token ceiling the pass ran against
    pub ceiling_tokens: u64,

    /// Rejected inputs grouped by reason
    pub rejections: BTreeMap<RejectReason, usize>,

    /// Input position of the first conversation that did not fit the budget
    pub stopped_at: Option<usize>,
}

impl CurationResult {
    pub fn total_rejected(&self) -> usize {
        self.rejections.values().sum()
    }

    /// Whether curation ended early on the budget rather than on input exhaustion.
    pub fn budget_exhausted(&self) -> bool {
        self.stopped_at.is_some()
    }
}

/// Experiment record written next to a curated dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurationManifest {
    pub experiment_id: String,
    pub created_at: DateTime<Utc>,
    pub model: String,
    pub budget_millions: f64,
    pub ceiling_tokens: u64,
    pub consumed_tokens: u64,
    pub accepted: usize,
    pub rejections: BTreeMap<String, usize>,
    pub budget_exhausted: bool,
}

impl CurationManifest {
    pub fn from_result(result: &CurationResult, model: &str, budget_millions: f64) -> Self {
        Self {
            experiment_id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            model: model.to_string(),
            budget_millions,
            ceiling_tokens: result.ceiling_tokens,
            consumed_tokens: result.consumed_tokens,
            accepted: result.accepted.len(),
            rejections: result
                .rejections
                .iter()
                .map(|(reason, count)| (reason.as_str().to_string(), *count))
                .collect(),
            budget_exhausted: result.budget_exhausted(),
        }
    }
}

/// One conversation queued for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRequest {
    /// Position in the original input, preserved through concurrent execution
    pub index: usize,
    pub conversation: Conversation,
}

impl DispatchRequest {
    pub fn new(index: usize, conversation: Conversation) -> Self {
        Self {
            index,
            conversation,
        }
    }

    /// Number an ordered list of conversations from zero.
    pub fn enumerate(conversations: impl IntoIterator<Item = Conversation>) -> Vec<Self> {
        conversations
            .into_iter()
            .enumerate()
            .map(|(index, conversation)| Self::new(index, conversation))
            .collect()
    }
}

/// Failure category of a dispatched request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Estimated cost can never fit the limiter
    CapacityExceeded,
    /// Throttling, timeouts, server-side errors: safe to retry later
    Transient,
    /// Will fail again unchanged
    Permanent,
    /// Cancellation was raised before the request completed
    Cancelled,
    /// A bug: panicked or vanished task
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CapacityExceeded => "capacity_exceeded",
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

/// Result of one dispatched request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchResult {
    Success { response: String },
    Failure { kind: FailureKind, detail: String },
}

/// Per-item dispatch outcome, created once and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub index: usize,
    #[serde(flatten)]
    pub result: DispatchResult,
}

impl DispatchOutcome {
    pub fn success(index: usize, response: impl Into<String>) -> Self {
        Self {
            index,
            result: DispatchResult::Success {
                response: response.into(),
            },
        }
    }

    pub fn failure(index: usize, kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            index,
            result: DispatchResult::Failure {
                kind,
                detail: detail.into(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.result, DispatchResult::Success { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match &self.result {
            DispatchResult::Failure { kind, .. } => Some(*kind),
            DispatchResult::Success { .. } => None,
        }
    }

    pub fn response(&self) -> Option<&str> {
        match &self.result {
            DispatchResult::Success { response } => Some(response),
            DispatchResult::Failure { .. } => None,
        }
    }
}

/// Statistics for a dispatch run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchStats {
    /// Total requests dispatched
    pub total: usize,

    /// Requests that produced a response
    pub succeeded: usize,

    /// Failed requests grouped by kind
    pub failed: BTreeMap<FailureKind, usize>,

    /// Total runtime in seconds
    pub runtime_secs: f64,

    /// Successful requests per hour
    pub throughput_per_hour: f64,
}

impl DispatchStats {
    pub fn from_outcomes(outcomes: &[DispatchOutcome], runtime_secs: f64) -> Self {
        let mut stats = Self {
            total: outcomes.len(),
            runtime_secs,
            ..Self::default()
        };
        for outcome in outcomes {
            match outcome.failure_kind() {
                None => stats.succeeded += 1,
                Some(kind) => *stats.failed.entry(kind).or_default() += 1,
            }
        }
        stats.finalize();
        stats
    }

    pub fn total_failed(&self) -> usize {
        self.failed.values().sum()
    }

    /// Calculate derived stats.
    pub fn finalize(&mut self) {
        if self.runtime_secs > 0.0 {
            self.throughput_per_hour = self.succeeded as f64 / self.runtime_secs * 3600.0;
        }
    }
}
