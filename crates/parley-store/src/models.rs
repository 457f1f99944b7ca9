//! Domain model structs persisted in the relay database.

use serde::{Deserialize, Serialize};

use parley_shared::types::{Identity, Party};

pub use parley_shared::protocol::ChatMessage;

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

/// A conversation between one owner and the operator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chat {
    /// Unique chat identifier (UUID v4 string).
    pub chat_id: String,
    /// Identity that owns the chat.
    pub owner: Identity,
    /// Display title, already truncated.
    pub title: String,
    /// Seconds since epoch.
    pub created_at: f64,
    /// Soft delete flag; the chat stays readable by id.
    pub deleted_by_user: bool,
    /// Last time the operator read the chat.
    pub operator_last_read: f64,
    /// Last time the owner read the chat.
    pub user_last_read: f64,
}

impl Chat {
    pub fn last_read(&self, party: Party) -> f64 {
        match party {
            Party::User => self.user_last_read,
            Party::Operator => self.operator_last_read,
        }
    }
}

/// A chat together with aggregates over its messages.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatActivity {
    pub chat: Chat,
    pub message_count: u64,
    /// Zero when the chat has no messages.
    pub latest_message: f64,
    pub latest_operator_message: f64,
    pub latest_user_message: f64,
}

impl ChatActivity {
    /// Unread for `party` when the other side wrote after `party` last read.
    pub fn is_unread_for(&self, party: Party) -> bool {
        let latest_from_other = match party.other() {
            Party::User => self.latest_user_message,
            Party::Operator => self.latest_operator_message,
        };
        latest_from_other > self.chat.last_read(party)
    }
}

// ---------------------------------------------------------------------------
// Insert outcome
// ---------------------------------------------------------------------------

/// Result of appending a message under a possibly client-chosen id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The same id was already stored with an identical payload.
    Duplicate,
}

// ---------------------------------------------------------------------------
// Account erasure
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErasureReport {
    pub messages: usize,
    pub chats: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn activity(user_read: f64, operator_read: f64, last_user: f64, last_op: f64) -> ChatActivity {
        ChatActivity {
            chat: Chat {
                chat_id: "c".into(),
                owner: Identity::new("u"),
                title: "t".into(),
                created_at: 0.0,
                deleted_by_user: false,
                operator_last_read: operator_read,
                user_last_read: user_read,
            },
            message_count: 1,
            latest_message: last_user.max(last_op),
            latest_operator_message: last_op,
            latest_user_message: last_user,
        }
    }

    #[test]
    fn unread_compares_against_other_party() {
        let a = activity(10.0, 0.0, 50.0, 5.0);
        assert!(!a.is_unread_for(Party::User));
        assert!(a.is_unread_for(Party::Operator));

        let b = activity(10.0, 60.0, 50.0, 20.0);
        assert!(b.is_unread_for(Party::User));
        assert!(!b.is_unread_for(Party::Operator));
    }
}
