//! Full account erasure, the only operation that removes message history.

use rusqlite::params;

use parley_shared::types::Identity;

use crate::database::Database;
use crate::error::Result;
use crate::models::ErasureReport;

impl Database {
    /// Hard-delete everything stored for `identity` in one transaction:
    /// messages in its room or its chats, the chats themselves, the device
    /// token, the published key and the nickname.
    pub fn erase_account(&mut self, identity: &Identity) -> Result<ErasureReport> {
        let tx = self.conn_mut().transaction()?;

        let messages = tx.execute(
            "DELETE FROM messages
             WHERE room = ?1
                OR chat_id IN (SELECT chat_id FROM chats WHERE owner = ?1)",
            params![identity.as_str()],
        )?;
        let chats = tx.execute(
            "DELETE FROM chats WHERE owner = ?1",
            params![identity.as_str()],
        )?;
        tx.execute(
            "DELETE FROM device_tokens WHERE identity = ?1",
            params![identity.as_str()],
        )?;
        tx.execute(
            "DELETE FROM public_keys WHERE identity = ?1",
            params![identity.as_str()],
        )?;
        tx.execute(
            "DELETE FROM users WHERE identity = ?1",
            params![identity.as_str()],
        )?;

        tx.commit()?;

        tracing::info!(identity = %identity, messages, chats, "account erased");
        Ok(ErasureReport { messages, chats })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chat, ChatMessage};
    use parley_shared::types::Party;

    fn seed(db: &Database, owner: &str, chat_id: &str) {
        db.create_chat(&Chat {
            chat_id: chat_id.into(),
            owner: Identity::new(owner),
            title: "t".into(),
            created_at: 1.0,
            deleted_by_user: false,
            operator_last_read: 0.0,
            user_last_read: 0.0,
        })
        .unwrap();
        for (i, sender) in [Party::User, Party::Operator].into_iter().enumerate() {
            db.insert_message(&ChatMessage {
                id: format!("{chat_id}-{i}"),
                text: "x".into(),
                sender,
                timestamp: i as f64,
                room: owner.into(),
                chat_id: chat_id.into(),
                image_base64: None,
            })
            .unwrap();
        }
        let id = Identity::new(owner);
        db.upsert_public_key(&id, "key", 1.0).unwrap();
        db.upsert_device_token(&id, "tok", 1.0).unwrap();
        db.set_nickname(&id, "nick").unwrap();
    }

    #[test]
    fn erase_removes_only_that_account() {
        let mut db = Database::open_in_memory().unwrap();
        seed(&db, "gone@example.com", "c-gone");
        seed(&db, "kept@example.com", "c-kept");

        let gone = Identity::new("gone@example.com");
        let report = db.erase_account(&gone).unwrap();
        assert_eq!(report, ErasureReport { messages: 2, chats: 1 });

        assert!(db.get_chat("c-gone").is_err());
        assert_eq!(db.get_public_key(&gone).unwrap(), None);
        assert_eq!(db.get_device_token(&gone).unwrap(), None);
        assert!(!db.nicknames().unwrap().contains_key(&gone));

        let kept = Identity::new("kept@example.com");
        assert_eq!(db.count_messages_in_chat("c-kept").unwrap(), 2);
        assert!(db.get_public_key(&kept).unwrap().is_some());
    }
}
