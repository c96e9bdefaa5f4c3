//! Token cost estimation for chat conversations.
//!
//! Epistemic foundation:
//! - K_i: Every message costs a fixed framing overhead plus its encoded text
//! - K_i: Every reply is primed with `<|start|>assistant<|message|>` (3 tokens)
//! - B_i: The tokenizer registry knows the model → fall back to cl100k_base
//! - I^B: Framing overhead for an unlisted model is unknowable → UnsupportedModel,
//!   never a guess

use crate::models::{ChatMessage, Conversation, CuratorError, Result};
use std::fmt;
use std::sync::Arc;
use tiktoken_rs::CoreBPE;
use tracing::warn;

/// Tokens that prime every reply, added once per conversation.
pub const REPLY_PRIMING_TOKENS: u64 = 3;

/// Counts the tokens a piece of text encodes to.
pub trait TokenEncoder: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

impl TokenEncoder for CoreBPE {
    fn count(&self, text: &str) -> usize {
        self.encode_with_special_tokens(text).len()
    }
}

/// Per-message framing constants of a chat model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageOverhead {
    pub per_message: u64,
    pub per_name: u64,
}

/// Models whose framing overhead is known.
const KNOWN_OVERHEADS: &[(&str, MessageOverhead)] = &[
    ("gpt-4o-2024-08-06", GPT_4O_OVERHEAD),
    ("gpt-4o-mini", GPT_4O_OVERHEAD),
    ("gpt-4o-mini-2024-07-18", GPT_4O_OVERHEAD),
];

const GPT_4O_OVERHEAD: MessageOverhead = MessageOverhead {
    per_message: 3,
    per_name: 1,
};

/// Framing overhead for `model`, if known.
pub fn message_overhead(model: &str) -> Option<MessageOverhead> {
    KNOWN_OVERHEADS
        .iter()
        .find(|(id, _)| *id == model)
        .map(|(_, overhead)| *overhead)
}

pub fn is_supported_model(model: &str) -> bool {
    message_overhead(model).is_some()
}

/// Resolve the tokenizer for `model`, degrading to cl100k_base when the
/// registry does not know the name.
fn resolve_encoding(model: &str) -> Result<CoreBPE> {
    match tiktoken_rs::get_bpe_from_model(model) {
        Ok(bpe) => Ok(bpe),
        Err(e) => {
            warn!(model = model, error = %e, "Model not found in tokenizer registry, using cl100k_base");
            tiktoken_rs::cl100k_base().map_err(|e| CuratorError::Encoding(e.to_string()))
        }
    }
}

/// Prices conversations in tokens for one model.
///
/// Deterministic for a given conversation, model and encoding table.
#[derive(Clone)]
pub struct TokenEstimator {
    model: String,
    overhead: MessageOverhead,
    encoder: Arc<dyn TokenEncoder>,
}

impl fmt::Debug for TokenEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenEstimator")
            .field("model", &self.model)
            .field("overhead", &self.overhead)
            .finish_non_exhaustive()
    }
}

impl TokenEstimator {
    /// Build an estimator backed by the model's tokenizer.
    ///
    /// B_i(model supported) → Result
    pub fn for_model(model: &str) -> Result<Self> {
        let overhead =
            message_overhead(model).ok_or_else(|| CuratorError::UnsupportedModel(model.to_string()))?;
        let encoder = resolve_encoding(model)?;
        Ok(Self {
            model: model.to_string(),
            overhead,
            encoder: Arc::new(encoder),
        })
    }

    /// Build an estimator with a caller-supplied encoder.
    ///
    /// The model must still have known overhead constants.
    pub fn with_encoder(model: &str, encoder: Arc<dyn TokenEncoder>) -> Result<Self> {
        let overhead =
            message_overhead(model).ok_or_else(|| CuratorError::UnsupportedModel(model.to_string()))?;
        Ok(Self {
            model: model.to_string(),
            overhead,
            encoder,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn count_text(&self, text: &str) -> u64 {
        self.encoder.count(text) as u64
    }

    /// Token cost of a single message, framing included.
    pub fn message_tokens(&self, message: &ChatMessage) -> u64 {
        let mut tokens = self.overhead.per_message;
        if let Some(content) = &message.content {
            tokens += self.count_text(content);
        }
        if let Some(call) = &message.function_call {
            tokens += self.count_text(&call.to_string());
        }
        if let Some(name) = &message.name {
            tokens += self.overhead.per_name + self.count_text(name);
        }
        tokens
    }

    /// Token cost of a whole conversation, reply priming included.
    pub fn estimate(&self, conversation: &Conversation) -> u64 {
        conversation
            .messages
            .iter()
            .map(|m| self.message_tokens(m))
            .sum::<u64>()
            + REPLY_PRIMING_TOKENS
    }
}

/// One-shot estimate; loads the tokenizer on every call.
pub fn estimate_tokens(conversation: &Conversation, model: &str) -> Result<u64> {
    Ok(TokenEstimator::for_model(model)?.estimate(conversation))
}

/// Counts whitespace-separated words; keeps test arithmetic readable.
#[cfg(test)]
pub(crate) struct WordEncoder;

#[cfg(test)]
impl TokenEncoder for WordEncoder {
    fn count(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words() -> TokenEstimator {
        TokenEstimator::with_encoder("gpt-4o-mini", Arc::new(WordEncoder)).unwrap()
    }

    #[test]
    fn test_unsupported_model_is_fatal() {
        let err = TokenEstimator::with_encoder("gpt-3.5-turbo", Arc::new(WordEncoder)).unwrap_err();
        assert!(matches!(err, CuratorError::UnsupportedModel(m) if m == "gpt-3.5-turbo"));

        let conv = Conversation::prompt("sys", "hi");
        assert!(matches!(
            estimate_tokens(&conv, "my-local-llama"),
            Err(CuratorError::UnsupportedModel(_))
        ));
    }

    #[test]
    fn test_formula() {
        let conv = Conversation::new(vec![
            ChatMessage::system("be very brief"),           // 3 + 3
            ChatMessage::user("hello there").with_name("bob"), // 3 + 2 + 1 + 1
            ChatMessage::assistant("hi"),                   // 3 + 1
        ]);
        assert_eq!(words().estimate(&conv), 6 + 7 + 4 + REPLY_PRIMING_TOKENS);
    }

    #[test]
    fn test_empty_conversation_costs_priming_only() {
        assert_eq!(words().estimate(&Conversation::default()), REPLY_PRIMING_TOKENS);
    }

    #[test]
    fn test_real_tokenizer_monotonic_in_content() {
        let estimator = TokenEstimator::for_model("gpt-4o-mini").unwrap();
        let mut content = String::from("The quick brown fox");
        let mut last = estimator.estimate(&Conversation::prompt("sys", content.clone()));
        for _ in 0..10 {
            content.push_str(" jumps");
            let next = estimator.estimate(&Conversation::prompt("sys", content.clone()));
            assert!(next > last, "{next} should exceed {last}");
            last = next;
        }
    }

    #[test]
    fn test_real_tokenizer_is_deterministic() {
        let conv = Conversation::new(vec![
            ChatMessage::system("You answer in Traditional Chinese."),
            ChatMessage::user("台灣最高的山是哪一座？"),
            ChatMessage::assistant("玉山。"),
        ]);
        let a = estimate_tokens(&conv, "gpt-4o-2024-08-06").unwrap();
        let b = estimate_tokens(&conv, "gpt-4o-2024-08-06").unwrap();
        assert_eq!(a, b);
        // Three framed messages plus priming is the floor.
        assert!(a > 3 * 3 + REPLY_PRIMING_TOKENS);
    }

    #[test]
    fn test_function_call_is_priced() {
        let with_call = Conversation::new(vec![ChatMessage::function_call(
            crate::models::Role::Assistant,
            serde_json::json!({"name": "lookup", "arguments": "{}"}),
        )]);
        assert!(words().estimate(&with_call) > 3 + REPLY_PRIMING_TOKENS);
    }
}
