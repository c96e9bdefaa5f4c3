//! Budget-bounded curation of fine-tuning conversations.
//!
//! Pipeline flow:
//! Records → prepend preamble → Validator (skip invalid) → Estimator → accept while under budget
//!
//! Epistemic foundation:
//! - K_i: Output is a prefix of the valid inputs, so a larger budget never
//!   drops an example a smaller budget kept
//! - B_i: Each record may be malformed → counted rejection, curation continues
//! - I^B: Unsupported model → fatal before the first record is read

use crate::curation::{validator, TokenEstimator};
use crate::models::{CurationResult, CuratorError, RejectReason, Result};
use serde_json::{json, Value};
use tracing::{debug, info};

/// Tokens per budget unit: budgets are expressed in millions of tokens.
pub const TOKENS_PER_BUDGET_UNIT: f64 = 1_000_000.0;

/// Convert a budget in millions of tokens to an absolute ceiling.
pub fn ceiling_from_millions(budget_millions: f64) -> Result<u64> {
    if !budget_millions.is_finite() || budget_millions < 0.0 {
        return Err(CuratorError::InvalidInput(format!(
            "token budget must be a non-negative number of millions, got {budget_millions}"
        )));
    }
    Ok((budget_millions * TOKENS_PER_BUDGET_UNIT).round() as u64)
}

/// Accumulates valid conversations until the token ceiling is reached.
#[derive(Debug, Clone)]
pub struct BudgetCurator {
    estimator: TokenEstimator,
    preamble: String,
    ceiling: u64,
}

impl BudgetCurator {
    /// Create a curator pricing conversations with `model`'s tokenizer.
    ///
    /// B_i(model supported) → Result
    pub fn new(budget_millions: f64, model: &str, preamble: impl Into<String>) -> Result<Self> {
        let ceiling = ceiling_from_millions(budget_millions)?;
        let estimator = TokenEstimator::for_model(model)?;
        Ok(Self::with_ceiling(estimator, ceiling, preamble))
    }

    /// Create a curator from a ready estimator and an absolute token ceiling.
    pub fn with_ceiling(estimator: TokenEstimator, ceiling: u64, preamble: impl Into<String>) -> Self {
        Self {
            estimator,
            preamble: preamble.into(),
            ceiling,
        }
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    pub fn estimator(&self) -> &TokenEstimator {
        &self.estimator
    }

    /// Curate records in input order.
    ///
    /// A record is either a message list or an object with a `messages`
    /// list. The first valid conversation that would push the total past the
    /// ceiling ends the pass; nothing after it is considered.
    pub fn curate<I>(&self, records: I) -> CurationResult
    where
        I: IntoIterator<Item = Value>,
    {
        let preamble = json!({"role": "system", "content": self.preamble});
        let mut result = CurationResult {
            ceiling_tokens: self.ceiling,
            ..CurationResult::default()
        };

        for (position, record) in records.into_iter().enumerate() {
            let Some(raw) = raw_messages(record) else {
                reject(&mut result, position, RejectReason::MalformedRecord);
                continue;
            };

            let mut messages = Vec::with_capacity(raw.len() + 1);
            messages.push(preamble.clone());
            messages.extend(raw);

            let conversation = match validator::parse_conversation(messages) {
                Ok(conversation) => conversation,
                Err(reason) => {
                    reject(&mut result, position, reason);
                    continue;
                }
            };

            let tokens = self.estimator.estimate(&conversation);
            if result.consumed_tokens + tokens > self.ceiling {
                info!(
                    position = position,
                    item_tokens = tokens,
                    consumed = result.consumed_tokens,
                    ceiling = self.ceiling,
                    "Token budget reached, stopping curation"
                );
                result.stopped_at = Some(position);
                break;
            }

            result.consumed_tokens += tokens;
            result.accepted.push(conversation);
        }

        info!(
            accepted = result.accepted.len(),
            rejected = result.total_rejected(),
            consumed = result.consumed_tokens,
            ceiling = self.ceiling,
            model = self.estimator.model(),
            "Curation complete"
        );

        result
    }
}

/// Curate `records` under a budget of `budget_millions` million tokens.
pub fn curate<I>(records: I, budget_millions: f64, model: &str, preamble: &str) -> Result<CurationResult>
where
    I: IntoIterator<Item = Value>,
{
    Ok(BudgetCurator::new(budget_millions, model, preamble)?.curate(records))
}

fn reject(result: &mut CurationResult, position: usize, reason: RejectReason) {
    debug!(position = position, reason = %reason, "Rejected record");
    *result.rejections.entry(reason).or_default() += 1;
}

fn raw_messages(record: Value) -> Option<Vec<Value>> {
    match record {
        Value::Array(messages) => Some(messages),
        Value::Object(mut fields) => match fields.remove("messages") {
            Some(Value::Array(messages)) => Some(messages),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curation::TokenEncoder;
    use crate::models::Conversation;
    use std::sync::Arc;

    /// Each integer word costs its value; other words are free.
    struct PricedEncoder;

    impl TokenEncoder for PricedEncoder {
        fn count(&self, text: &str) -> usize {
            text.split_whitespace()
                .filter_map(|w| w.parse::<usize>().ok())
                .sum()
        }
    }

    /// Framing for preamble + user + assistant, plus reply priming.
    const BASE: u64 = 3 * 3 + 3;

    fn curator(ceiling: u64) -> BudgetCurator {
        let estimator = TokenEstimator::with_encoder("gpt-4o-mini", Arc::new(PricedEncoder)).unwrap();
        BudgetCurator::with_ceiling(estimator, ceiling, "sys")
    }

    fn record(cost: u64) -> Value {
        json!({"messages": [
            {"role": "user", "content": "question"},
            {"role": "assistant", "content": cost.to_string()},
        ]})
    }

    fn invalid() -> Value {
        json!({"messages": [{"role": "user", "content": "dangling"}]})
    }

    fn costs(conversations: &[Conversation]) -> Vec<String> {
        conversations
            .iter()
            .map(|c| c.messages[2].content.clone().unwrap_or_default())
            .collect()
    }

    #[test]
    fn test_stops_at_first_overflow() {
        // Items cost BASE+10, BASE+20, BASE+80 against a ceiling that fits
        // only the first: the second overflows and the third is never seen.
        let result = curator(BASE + 25).curate(vec![record(10), record(20), record(80)]);

        assert_eq!(costs(&result.accepted), vec!["10"]);
        assert_eq!(result.consumed_tokens, BASE + 10);
        assert_eq!(result.stopped_at, Some(1));
        assert!(result.budget_exhausted());
    }

    #[test]
    fn test_does_not_skip_past_overflow() {
        // The third item would fit on its own but comes after the overflow.
        let result = curator(2 * BASE + 15).curate(vec![record(10), record(80), record(1)]);
        assert_eq!(costs(&result.accepted), vec!["10"]);
    }

    #[test]
    fn test_invalid_items_are_skipped_and_counted() {
        let result = curator(1_000).curate(vec![
            invalid(),
            record(1),
            json!("not a record"),
            json!({"id": 3}),
            record(2),
        ]);

        assert_eq!(costs(&result.accepted), vec!["1", "2"]);
        assert_eq!(result.rejections.get(&RejectReason::EvenLength), Some(&1));
        assert_eq!(result.rejections.get(&RejectReason::MalformedRecord), Some(&2));
        assert_eq!(result.total_rejected(), 3);
        assert_eq!(result.stopped_at, None);
        assert_eq!(result.consumed_tokens, 2 * BASE + 3);
    }

    #[test]
    fn test_bare_message_lists_are_accepted() {
        let bare = json!([
            {"role": "user", "content": "question"},
            {"role": "assistant", "content": "5"},
        ]);
        let result = curator(1_000).curate(vec![bare]);
        assert_eq!(result.accepted.len(), 1);
        assert_eq!(result.accepted[0].messages[0].content.as_deref(), Some("sys"));
    }

    #[test]
    fn test_exact_fit_is_accepted() {
        let result = curator(BASE + 7).curate(vec![record(7)]);
        assert_eq!(result.accepted.len(), 1);
        assert_eq!(result.consumed_tokens, BASE + 7);
        assert_eq!(result.stopped_at, None);
    }

    #[test]
    fn test_larger_budget_extends_prefix() {
        let input: Vec<Value> = vec![record(5), invalid(), record(9), record(2), record(30), record(4)];

        let mut previous: Vec<String> = Vec::new();
        for ceiling in [0, BASE + 5, 2 * BASE + 14, 3 * BASE + 20, 10 * BASE + 100] {
            let accepted = costs(&curator(ceiling).curate(input.clone()).accepted);
            assert!(
                accepted.starts_with(&previous),
                "{accepted:?} should extend {previous:?}"
            );
            previous = accepted;
        }
        assert_eq!(previous, vec!["5", "9", "2", "30", "4"]);
    }

    #[test]
    fn test_zero_budget_accepts_nothing() {
        let result = curator(0).curate(vec![record(0)]);
        assert!(result.accepted.is_empty());
        assert_eq!(result.stopped_at, Some(0));
    }

    #[test]
    fn test_ceiling_conversion() {
        assert_eq!(ceiling_from_millions(2.0).unwrap(), 2_000_000);
        assert_eq!(ceiling_from_millions(0.000025).unwrap(), 25);
        assert!(ceiling_from_millions(-1.0).is_err());
        assert!(ceiling_from_millions(f64::NAN).is_err());
    }

    #[test]
    fn test_unsupported_model_aborts() {
        let err = curate(vec![record(1)], 1.0, "text-davinci-003", "sys").unwrap_err();
        assert!(matches!(err, CuratorError::UnsupportedModel(_)));
    }

    #[test]
    fn test_real_tokenizer_end_to_end() {
        let result = curate(
            vec![record(1), invalid(), record(2)],
            1.0,
            "gpt-4o-mini",
            "You are a helpful assistant.",
        )
        .unwrap();
        assert_eq!(result.accepted.len(), 2);
        assert_eq!(result.ceiling_tokens, 1_000_000);
        assert!(result.consumed_tokens > 2 * BASE);
    }
}
