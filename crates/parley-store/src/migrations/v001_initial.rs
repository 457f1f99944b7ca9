//! v001 -- Initial schema creation.
//!
//! Creates the relay tables: `chats`, `messages`, `public_keys`,
//! `device_tokens`, `users`, and `presence`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Chats
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chats (
    chat_id            TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    owner              TEXT NOT NULL,               -- owning identity
    title              TEXT NOT NULL DEFAULT 'New Chat',
    created_at         REAL NOT NULL,               -- seconds since epoch
    deleted_by_user    INTEGER NOT NULL DEFAULT 0,  -- soft delete flag 0/1
    operator_last_read REAL NOT NULL DEFAULT 0,
    user_last_read     REAL NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_chats_owner ON chats(owner);

-- ----------------------------------------------------------------
-- Messages (opaque payloads, never updated after insert)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id           TEXT PRIMARY KEY NOT NULL,   -- client- or server-assigned
    chat_id      TEXT NOT NULL,               -- FK -> chats(chat_id)
    room         TEXT NOT NULL,               -- user identity of the conversation
    is_operator  INTEGER NOT NULL,            -- sender flag 0/1
    text         TEXT NOT NULL,               -- ciphertext or plaintext
    image_base64 TEXT,                        -- ciphertext or plaintext
    timestamp    REAL NOT NULL,

    FOREIGN KEY (chat_id) REFERENCES chats(chat_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_chat_ts ON messages(chat_id, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_messages_room_ts ON messages(room, timestamp DESC);

-- ----------------------------------------------------------------
-- Published public keys (last write wins)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS public_keys (
    identity   TEXT PRIMARY KEY NOT NULL,
    public_key TEXT NOT NULL,                 -- base64 raw X25519 key
    updated_at REAL NOT NULL
);

-- ----------------------------------------------------------------
-- Push device tokens (last write wins)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS device_tokens (
    identity   TEXT PRIMARY KEY NOT NULL,
    token      TEXT NOT NULL,
    updated_at REAL NOT NULL
);

-- ----------------------------------------------------------------
-- Display names
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    identity TEXT PRIMARY KEY NOT NULL,
    nickname TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Presence heartbeats
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS presence (
    room        TEXT PRIMARY KEY NOT NULL,
    last_active REAL NOT NULL
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
