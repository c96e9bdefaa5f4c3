//! Chat message and conversation types.
//!
//! K_i: Roles are an enum, unknown fields are refused at deserialization.
//! B_i: Records read from disk are untrusted until the validator has seen them.

use serde::{Deserialize, Serialize};

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Function,
}

impl Role {
    /// Every role the chat format recognizes.
    pub const ALL: [Role; 4] = [Role::System, Role::User, Role::Assistant, Role::Function];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Function => "function",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        Role::ALL.into_iter().find(|r| r.as_str() == s)
    }
}

/// Single message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatMessage {
    pub role: Role,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Opaque function-call payload, passed through untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<serde_json::Value>,

    /// Fine-tuning loss weight (0 or 1 in practice)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<serde_json::Number>,
}

impl ChatMessage {
    fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            name: None,
            function_call: None,
            weight: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::text(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(Role::Assistant, content)
    }

    pub fn function_call(role: Role, call: serde_json::Value) -> Self {
        Self {
            role,
            content: None,
            name: None,
            function_call: Some(call),
            weight: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Whether the message carries non-empty text content.
    pub fn has_content(&self) -> bool {
        self.content.as_deref().is_some_and(|c| !c.is_empty())
    }

    /// Whether the message carries a non-empty function call.
    pub fn has_function_call(&self) -> bool {
        self.function_call.as_ref().is_some_and(is_present)
    }
}

/// JSON truthiness for optional payloads: null, "", [] and {} count as absent.
pub(crate) fn is_present(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Object(o) => !o.is_empty(),
        _ => true,
    }
}

/// Ordered sequence of chat messages.
///
/// Serializes as `{"messages": [...]}`, the line format consumed by
/// fine-tuning submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Conversation {
    pub messages: Vec<ChatMessage>,
}

impl Conversation {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self { messages }
    }

    /// Prepend a fixed system preamble.
    pub fn with_preamble(preamble: &str, messages: Vec<ChatMessage>) -> Self {
        let mut all = Vec::with_capacity(messages.len() + 1);
        all.push(ChatMessage::system(preamble));
        all.extend(messages);
        Self { messages: all }
    }

    /// Build a single-turn prompt: preamble followed by one user message.
    pub fn prompt(preamble: &str, user_content: impl Into<String>) -> Self {
        Self::with_preamble(preamble, vec![ChatMessage::user(user_content)])
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
