use rusqlite::{params, OptionalExtension};

use parley_shared::types::Party;

use crate::chats::INSERT_CHAT;
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Chat, ChatMessage, InsertOutcome};

const INSERT_MESSAGE: &str =
    "INSERT INTO messages (id, text, is_operator, timestamp, room, chat_id, image_base64)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
     ON CONFLICT(id) DO NOTHING";

const SELECT_COLUMNS: &str = "SELECT id, text, is_operator, timestamp, room, chat_id, image_base64
             FROM messages";

impl Database {
    /// Append a message. Stored rows are never modified: re-sending an id
    /// with the identical payload is a no-op, anything else is a conflict.
    pub fn insert_message(&self, message: &ChatMessage) -> Result<InsertOutcome> {
        let inserted = self.conn().execute(
            INSERT_MESSAGE,
            params![
                message.id,
                message.text,
                message.is_operator(),
                message.timestamp,
                message.room,
                message.chat_id,
                message.image_base64,
            ],
        )?;

        if inserted > 0 {
            return Ok(InsertOutcome::Inserted);
        }

        let existing = self.get_message(&message.id)?;
        if existing == *message {
            tracing::debug!(id = %message.id, "duplicate message replay ignored");
            Ok(InsertOutcome::Duplicate)
        } else {
            Err(StoreError::Conflict(message.id.clone()))
        }
    }

    /// Open `chat` and store its first message in one transaction. An id
    /// that is already taken rolls the chat back and reports a conflict.
    pub fn insert_message_with_chat(&mut self, chat: &Chat, message: &ChatMessage) -> Result<()> {
        let tx = self.conn_mut().transaction()?;
        tx.execute(
            INSERT_CHAT,
            params![
                chat.chat_id,
                chat.owner.as_str(),
                chat.title,
                chat.created_at,
                chat.deleted_by_user,
                chat.operator_last_read,
                chat.user_last_read,
            ],
        )?;
        let inserted = tx.execute(
            INSERT_MESSAGE,
            params![
                message.id,
                message.text,
                message.is_operator(),
                message.timestamp,
                message.room,
                message.chat_id,
                message.image_base64,
            ],
        )?;
        if inserted == 0 {
            // Dropping the transaction rolls the chat back.
            return Err(StoreError::Conflict(message.id.clone()));
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_message(&self, id: &str) -> Result<ChatMessage> {
        self.conn()
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE id = ?1"),
                params![id],
                row_to_message,
            )
            .optional()?
            .ok_or(StoreError::NotFound)
    }

    /// Newest first; equal timestamps fall back to insertion order.
    pub fn messages_for_chat(&self, chat_id: &str, limit: u32) -> Result<Vec<ChatMessage>> {
        self.query_messages(
            &format!(
                "{SELECT_COLUMNS} WHERE chat_id = ?1 ORDER BY timestamp DESC, rowid DESC LIMIT ?2"
            ),
            params![chat_id, limit],
        )
    }

    pub fn messages_for_room(&self, room: &str, limit: u32) -> Result<Vec<ChatMessage>> {
        self.query_messages(
            &format!(
                "{SELECT_COLUMNS} WHERE room = ?1 ORDER BY timestamp DESC, rowid DESC LIMIT ?2"
            ),
            params![room, limit],
        )
    }

    pub fn recent_messages(&self, limit: u32) -> Result<Vec<ChatMessage>> {
        self.query_messages(
            &format!("{SELECT_COLUMNS} ORDER BY timestamp DESC, rowid DESC LIMIT ?1"),
            params![limit],
        )
    }

    /// Every message, oldest first (operator export).
    pub fn all_messages(&self) -> Result<Vec<ChatMessage>> {
        self.query_messages(
            &format!("{SELECT_COLUMNS} ORDER BY timestamp ASC, rowid ASC"),
            [],
        )
    }

    pub fn count_messages_in_chat(&self, chat_id: &str) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages WHERE chat_id = ?1",
            params![chat_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn query_messages<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<ChatMessage>> {
        let mut stmt = self.conn().prepare(sql)?;
        let rows = stmt.query_map(params, row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
    let is_operator: bool = row.get(2)?;
    Ok(ChatMessage {
        id: row.get(0)?,
        text: row.get(1)?,
        sender: Party::from_operator_flag(is_operator),
        timestamp: row.get(3)?,
        room: row.get(4)?,
        chat_id: row.get(5)?,
        image_base64: row.get(6)?,
    })
}
