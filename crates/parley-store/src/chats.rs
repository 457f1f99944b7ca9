//! CRUD operations for [`Chat`] records and their message aggregates.

use rusqlite::{params, OptionalExtension};

use parley_shared::types::{Identity, Party};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Chat, ChatActivity};

pub(crate) const INSERT_CHAT: &str =
    "INSERT INTO chats (chat_id, owner, title, created_at, deleted_by_user,
                        operator_last_read, user_last_read)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)";

const ACTIVITY_SELECT: &str = "
    SELECT c.chat_id, c.owner, c.title, c.created_at, c.deleted_by_user,
           c.operator_last_read, c.user_last_read,
           COUNT(m.id),
           COALESCE(MAX(m.timestamp), 0),
           COALESCE(MAX(CASE WHEN m.is_operator = 1 THEN m.timestamp END), 0),
           COALESCE(MAX(CASE WHEN m.is_operator = 0 THEN m.timestamp END), 0)
    FROM chats c
    LEFT JOIN messages m ON m.chat_id = c.chat_id";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a new chat.
    pub fn create_chat(&self, chat: &Chat) -> Result<()> {
        self.conn().execute(
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
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a single chat by id, soft-deleted or not.
    pub fn get_chat(&self, chat_id: &str) -> Result<Chat> {
        self.conn()
            .query_row(
                "SELECT chat_id, owner, title, created_at, deleted_by_user,
                        operator_last_read, user_last_read
                 FROM chats
                 WHERE chat_id = ?1",
                params![chat_id],
                row_to_chat,
            )
            .optional()?
            .ok_or(StoreError::NotFound)
    }

    /// Owner of a chat, or `None` if the chat does not exist.
    pub fn chat_owner(&self, chat_id: &str) -> Result<Option<Identity>> {
        let owner: Option<String> = self
            .conn()
            .query_row(
                "SELECT owner FROM chats WHERE chat_id = ?1",
                params![chat_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(owner.map(Identity::new))
    }

    /// A user's visible chats: not soft-deleted and holding at least one
    /// message, most recently active first.
    pub fn chats_for_owner(&self, owner: &Identity) -> Result<Vec<ChatActivity>> {
        let sql = format!(
            "{ACTIVITY_SELECT}
             WHERE c.owner = ?1 AND c.deleted_by_user = 0
             GROUP BY c.chat_id
             HAVING COUNT(m.id) > 0
             ORDER BY MAX(m.timestamp) DESC"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params![owner.as_str()], row_to_activity)?;

        let mut chats = Vec::new();
        for row in rows {
            chats.push(row?);
        }
        Ok(chats)
    }

    /// Every chat including soft-deleted and empty ones (operator dashboard).
    pub fn all_chat_activity(&self) -> Result<Vec<ChatActivity>> {
        let sql = format!(
            "{ACTIVITY_SELECT}
             GROUP BY c.chat_id
             ORDER BY COALESCE(MAX(m.timestamp), c.created_at) DESC"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map([], row_to_activity)?;

        let mut chats = Vec::new();
        for row in rows {
            chats.push(row?);
        }
        Ok(chats)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Set the soft delete flag.  Returns `false` if the chat does not exist.
    pub fn soft_delete_chat(&self, chat_id: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE chats SET deleted_by_user = 1 WHERE chat_id = ?1",
            params![chat_id],
        )?;
        Ok(affected > 0)
    }

    pub fn set_chat_title(&self, chat_id: &str, title: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE chats SET title = ?2 WHERE chat_id = ?1",
            params![chat_id, title],
        )?;
        Ok(affected > 0)
    }

    /// Move `party`'s read marker forward to `at`; markers never go back.
    pub fn mark_chat_read(&self, chat_id: &str, party: Party, at: f64) -> Result<bool> {
        let sql = match party {
            Party::User => {
                "UPDATE chats SET user_last_read = MAX(user_last_read, ?2) WHERE chat_id = ?1"
            }
            Party::Operator => {
                "UPDATE chats SET operator_last_read = MAX(operator_last_read, ?2) WHERE chat_id = ?1"
            }
        };
        let affected = self.conn().execute(sql, params![chat_id, at])?;
        Ok(affected > 0)
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Delete chats that never received a message and were created before
    /// `created_before`.  Returns the number of chats removed.
    pub fn purge_empty_chats(&self, created_before: f64) -> Result<usize> {
        let removed = self.conn().execute(
            "DELETE FROM chats
             WHERE created_at < ?1
               AND NOT EXISTS (SELECT 1 FROM messages m WHERE m.chat_id = chats.chat_id)",
            params![created_before],
        )?;
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a `rusqlite::Row` to a [`Chat`].
fn row_to_chat(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chat> {
    let owner: String = row.get(1)?;
    Ok(Chat {
        chat_id: row.get(0)?,
        owner: Identity::new(owner),
        title: row.get(2)?,
        created_at: row.get(3)?,
        deleted_by_user: row.get(4)?,
        operator_last_read: row.get(5)?,
        user_last_read: row.get(6)?,
    })
}

fn row_to_activity(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatActivity> {
    let count: i64 = row.get(7)?;
    Ok(ChatActivity {
        chat: row_to_chat(row)?,
        message_count: count as u64,
        latest_message: row.get(8)?,
        latest_operator_message: row.get(9)?,
        latest_user_message: row.get(10)?,
    })
}
