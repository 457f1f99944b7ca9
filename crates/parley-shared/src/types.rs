use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_CHAT_TITLE, TITLE_DISPLAY_CHARS, TITLE_TRUNCATE_AT};

/// An opaque, stable party name: a user's email or a generated guest id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into().trim().to_string())
    }

    /// Emails compare case-insensitively; guest ids are taken verbatim.
    pub fn from_email(email: &str) -> Self {
        Self(email.trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// The two sides of every chat.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Party {
    User,
    Operator,
}

impl Party {
    pub fn other(self) -> Self {
        match self {
            Party::User => Party::Operator,
            Party::Operator => Party::User,
        }
    }

    pub fn is_operator(self) -> bool {
        matches!(self, Party::Operator)
    }

    pub fn from_operator_flag(is_operator: bool) -> Self {
        if is_operator {
            Party::Operator
        } else {
            Party::User
        }
    }
}

/// Display form of a chat title.
///
/// Newlines become spaces and the result is trimmed; anything longer than
/// 28 characters keeps its first 25 followed by `...`.
pub fn truncate_title(text: &str) -> String {
    let cleaned = text.replace(['\r', '\n'], " ");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return DEFAULT_CHAT_TITLE.to_string();
    }
    if cleaned.chars().count() <= TITLE_DISPLAY_CHARS {
        return cleaned.to_string();
    }
    let mut out: String = cleaned.chars().take(TITLE_TRUNCATE_AT).collect();
    out.push_str("...");
    out
}

/// Seconds since the Unix epoch with sub-second precision
pub fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_long_title_truncated() {
        let title = truncate_title("This is a very long chat title that exceeds the limit");
        assert_eq!(title, "This is a very long chat ...");
        assert_eq!(title.chars().count(), 28);
    }

    #[test]
    fn test_short_title_kept() {
        assert_eq!(truncate_title("  Billing question \n"), "Billing question");
        let exact = "a".repeat(28);
        assert_eq!(truncate_title(&exact), exact);
    }

    #[test]
    fn test_title_newlines_flattened() {
        assert_eq!(truncate_title("line one\nline two"), "line one line two");
    }

    #[test]
    fn test_empty_title_defaults() {
        assert_eq!(truncate_title(" \n "), DEFAULT_CHAT_TITLE);
    }

    #[test]
    fn test_title_truncation_counts_chars_not_bytes() {
        let title = truncate_title(&"é".repeat(40));
        assert_eq!(title.chars().count(), 28);
        assert!(title.ends_with("..."));
    }

    #[test]
    fn test_identity_email_normalized() {
        assert_eq!(Identity::from_email(" Alice@Example.COM "), Identity::new("alice@example.com"));
    }

    #[test]
    fn test_party_other() {
        assert_eq!(Party::User.other(), Party::Operator);
        assert_eq!(Party::Operator.other(), Party::User);
    }
}
