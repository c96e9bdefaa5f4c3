//! Conversation well-formedness checks for fine-tuning submission.
//!
//! Epistemic foundation:
//! - K_i: A submittable conversation opens with a system message, has odd
//!   length, answers every user turn with an assistant turn and contains at
//!   least one assistant message
//! - B_i: Records read from datasets may violate any of these → RejectReason
//!
//! Checks run in a fixed order and stop at the first failure, so a given
//! conversation always gets the same verdict:
//!
//! 1. non-empty
//! 2. odd length
//! 3. first message is `system`
//! 4. exactly one of `content` / `function_call`, content textual
//! 5. no field outside `role, content, name, function_call, weight`
//! 6. role is `system`, `user`, `assistant` or `function`
//! 7. every `user` message is immediately followed by `assistant`
//! 8. at least one `assistant` message

use crate::models::{is_present, ChatMessage, Conversation, RejectReason, Role};
use serde_json::Value;

/// Fields a chat message may carry.
pub const ALLOWED_FIELDS: [&str; 5] = ["role", "content", "name", "function_call", "weight"];

/// Validate a typed conversation.
///
/// Unknown fields and roles cannot be represented in [`ChatMessage`], so
/// checks 5 and 6 always hold here.
pub fn validate(conversation: &Conversation) -> Result<(), RejectReason> {
    let messages = &conversation.messages;
    check_shape(messages.len())?;

    if messages[0].role != Role::System {
        return Err(RejectReason::FirstNotSystem);
    }

    if !messages.iter().all(has_single_payload) {
        return Err(RejectReason::InvalidContent);
    }

    check_turns(messages.iter().map(|m| m.role))
}

/// Validate a conversation that is about to be sent for completion.
///
/// A prompt ends on the turn awaiting an answer, so the length and
/// assistant-presence checks (2 and 8) do not apply.
pub fn validate_prompt(conversation: &Conversation) -> Result<(), RejectReason> {
    let messages = &conversation.messages;
    if messages.is_empty() {
        return Err(RejectReason::Empty);
    }

    if messages[0].role != Role::System {
        return Err(RejectReason::FirstNotSystem);
    }

    if !messages.iter().all(has_single_payload) {
        return Err(RejectReason::InvalidContent);
    }

    check_turn_order(messages.iter().map(|m| m.role)).map(|_| ())
}

/// Validate an untrusted message list as read from a dataset record.
pub fn validate_raw(messages: &[Value]) -> Result<(), RejectReason> {
    check_shape(messages.len())?;

    if role_of(&messages[0]) != Some(Role::System) {
        return Err(RejectReason::FirstNotSystem);
    }

    // Non-object entries cannot carry content, so they fail check 4.
    if !messages.iter().all(raw_has_single_payload) {
        return Err(RejectReason::InvalidContent);
    }

    let has_unknown_field = messages
        .iter()
        .filter_map(Value::as_object)
        .any(|m| m.keys().any(|k| !ALLOWED_FIELDS.contains(&k.as_str())));
    if has_unknown_field {
        return Err(RejectReason::UnrecognizedField);
    }

    let roles = messages
        .iter()
        .map(role_of)
        .collect::<Option<Vec<Role>>>()
        .ok_or(RejectReason::UnrecognizedRole)?;

    check_turns(roles.into_iter())
}

/// Validate an untrusted message list and convert it to a typed conversation.
///
/// A list that passes every check but still does not deserialize (e.g. a
/// non-string `name`) is reported as [`RejectReason::MalformedRecord`].
pub fn parse_conversation(messages: Vec<Value>) -> Result<Conversation, RejectReason> {
    validate_raw(&messages)?;
    let messages = messages
        .into_iter()
        .map(serde_json::from_value::<ChatMessage>)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| RejectReason::MalformedRecord)?;
    Ok(Conversation::new(messages))
}

fn check_shape(len: usize) -> Result<(), RejectReason> {
    if len == 0 {
        return Err(RejectReason::Empty);
    }
    if len % 2 == 0 {
        return Err(RejectReason::EvenLength);
    }
    Ok(())
}

/// Checks 7 and 8 over the role sequence.
fn check_turns(roles: impl Iterator<Item = Role>) -> Result<(), RejectReason> {
    if check_turn_order(roles)? {
        Ok(())
    } else {
        Err(RejectReason::MissingAssistant)
    }
}

/// Check 7; reports whether an assistant message was seen.
fn check_turn_order(roles: impl Iterator<Item = Role>) -> Result<bool, RejectReason> {
    let mut previous = None;
    let mut saw_assistant = false;

    for role in roles {
        if previous == Some(Role::User) && role != Role::Assistant {
            return Err(RejectReason::UserNotFollowedByAssistant);
        }
        saw_assistant |= role == Role::Assistant;
        previous = Some(role);
    }

    Ok(saw_assistant)
}

fn has_single_payload(message: &ChatMessage) -> bool {
    message.has_content() != message.has_function_call()
}

fn raw_has_single_payload(message: &Value) -> bool {
    let Some(fields) = message.as_object() else {
        return false;
    };

    let content = fields.get("content").filter(|c| !c.is_null());
    if content.is_some_and(|c| !c.is_string()) {
        return false;
    }

    let has_content = content.is_some_and(is_present);
    let has_call = fields.get("function_call").is_some_and(is_present);
    has_content != has_call
}

fn role_of(message: &Value) -> Option<Role> {
    message.get("role").and_then(Value::as_str).and_then(Role::parse)
}
