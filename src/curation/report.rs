//! Whole-dataset format diagnostics.
//!
//! Unlike the validator, which stops at the first failed check, the report
//! walks every message of every record and counts each problem it finds, so
//! a dataset author sees the full picture in one pass.

use crate::curation::validator::ALLOWED_FIELDS;
use crate::models::{is_present, Role};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Problem categories counted by [`FormatReport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatIssue {
    DataType,
    MissingMessagesList,
    MessagesNotFormatCorrect,
    FirstMessageNotSystem,
    MessageMissingKey,
    MessageUnrecognizedKey,
    UnrecognizedRole,
    MissingContent,
    UserNotFollowedByAssistant,
    ExampleMissingAssistantMessage,
}

impl FormatIssue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DataType => "data_type",
            Self::MissingMessagesList => "missing_messages_list",
            Self::MessagesNotFormatCorrect => "messages_not_format_correct",
            Self::FirstMessageNotSystem => "first_message_not_system",
            Self::MessageMissingKey => "message_missing_key",
            Self::MessageUnrecognizedKey => "message_unrecognized_key",
            Self::UnrecognizedRole => "unrecognized_role",
            Self::MissingContent => "missing_content",
            Self::UserNotFollowedByAssistant => "user_not_followed_by_assistant",
            Self::ExampleMissingAssistantMessage => "example_missing_assistant_message",
        }
    }
}

/// Issue counts over a dataset of `{"messages": [...]}` records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FormatReport {
    pub records: usize,
    pub issues: BTreeMap<FormatIssue, usize>,
}

impl FormatReport {
    /// Scan every record and count every issue.
    pub fn scan<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a Value>,
    {
        let mut report = Self::default();
        for record in records {
            report.records += 1;
            report.scan_record(record);
        }
        report
    }

    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn count(&self, issue: FormatIssue) -> usize {
        self.issues.get(&issue).copied().unwrap_or(0)
    }

    fn add(&mut self, issue: FormatIssue, n: usize) {
        *self.issues.entry(issue).or_default() += n;
    }

    fn scan_record(&mut self, record: &Value) {
        let Some(fields) = record.as_object() else {
            self.add(FormatIssue::DataType, 1);
            return;
        };

        let messages = match fields.get("messages").and_then(Value::as_array) {
            Some(messages) if !messages.is_empty() => messages,
            _ => {
                self.add(FormatIssue::MissingMessagesList, 1);
                return;
            }
        };

        if messages.len() % 2 != 1 {
            self.add(FormatIssue::MessagesNotFormatCorrect, 1);
        }

        if messages[0].get("role").and_then(Value::as_str) != Some(Role::System.as_str()) {
            self.add(FormatIssue::FirstMessageNotSystem, 1);
        }

        let mut previous_role: Option<&str> = None;
        for message in messages {
            let role = message.get("role").and_then(Value::as_str);
            let content = message.get("content").filter(|c| !c.is_null());
            let call = message.get("function_call");

            if role.is_none() || (content.is_none() && call.is_none()) {
                self.add(FormatIssue::MessageMissingKey, 1);
            }

            let unrecognized = message
                .as_object()
                .map(|m| m.keys().filter(|k| !ALLOWED_FIELDS.contains(&k.as_str())).count())
                .unwrap_or(0);
            if unrecognized > 0 {
                self.add(FormatIssue::MessageUnrecognizedKey, unrecognized);
            }

            if role.and_then(Role::parse).is_none() {
                self.add(FormatIssue::UnrecognizedRole, 1);
            }

            let has_content = content.is_some_and(is_present);
            let has_call = call.is_some_and(is_present);
            if (has_content == has_call) || content.is_some_and(|c| !c.is_string()) {
                self.add(FormatIssue::MissingContent, 1);
            }

            if previous_role == Some("user") && role != Some("assistant") {
                self.add(FormatIssue::UserNotFollowedByAssistant, 1);
            }
            previous_role = role;
        }

        let has_assistant = messages
            .iter()
            .any(|m| m.get("role").and_then(Value::as_str) == Some("assistant"));
        if !has_assistant {
            self.add(FormatIssue::ExampleMissingAssistantMessage, 1);
        }
    }
}

impl fmt::Display for FormatReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clean() {
            return write!(f, "No errors found in {} records", self.records);
        }
        writeln!(f, "Found errors in {} records:", self.records)?;
        for (issue, count) in &self.issues {
            writeln!(f, "  {}: {}", issue.as_str(), count)?;
        }
        Ok(())
    }
}
