//! The relay operations a chat session needs.

use std::future::Future;

use parley_shared::protocol::{ChatMessage, SendMessageResponse};
use parley_shared::types::Party;

use crate::error::ClientError;

pub trait RelayTransport: Send + Sync {
    /// Open an empty chat owned by the caller; returns its id.
    fn create_chat(&self) -> impl Future<Output = Result<String, ClientError>> + Send;

    /// Send a message under its own id. An empty `chat_id` lets the relay
    /// open a chat for the message's room.
    fn send_message(
        &self,
        message: &ChatMessage,
    ) -> impl Future<Output = Result<SendMessageResponse, ClientError>> + Send;

    /// Newest first.
    fn list_messages(
        &self,
        chat_id: &str,
    ) -> impl Future<Output = Result<Vec<ChatMessage>, ClientError>> + Send;

    /// Returns the stored display title.
    fn rename_chat(
        &self,
        chat_id: &str,
        title: &str,
    ) -> impl Future<Output = Result<String, ClientError>> + Send;

    fn mark_read(
        &self,
        chat_id: &str,
        as_party: Party,
    ) -> impl Future<Output = Result<(), ClientError>> + Send;

    fn heartbeat(
        &self,
        room: &str,
        last_active: f64,
    ) -> impl Future<Output = Result<(), ClientError>> + Send;

    /// Last heartbeat recorded for `room`, if any.
    fn presence(&self, room: &str) -> impl Future<Output = Result<Option<f64>, ClientError>> + Send;
}
