//! # parley-store
//!
//! Relay-side persistence backed by SQLite.
//!
//! The relay stores opaque payloads only: message text and image columns hold
//! whatever the client sent, ciphertext or not.  The crate exposes a
//! synchronous `Database` handle that wraps a `rusqlite::Connection` and
//! provides typed helpers for messages, chats, published keys, device tokens,
//! presence, and account erasure.  Every write goes through that single
//! connection, which serializes conflicting writes.

pub mod account;
pub mod chats;
pub mod database;
pub mod directory;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod presence;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
