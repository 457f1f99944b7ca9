//! Typed message and chat model plus the JSON request/response bodies of
//! the relay API. The field-tagged message envelope lives in
//! [`crate::envelope`]; everything here is plain serde.

use serde::{Deserialize, Serialize};

use crate::types::{Identity, Party};

/// A relayed message as both ends see it. `text` and `image_base64` are
/// ciphertext blobs when the sender had encryption ready, plaintext
/// otherwise; the relay cannot tell which.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub text: String,
    pub sender: Party,
    /// Seconds since the epoch
    pub timestamp: f64,
    /// The user identity whose conversation this message belongs to
    pub room: String,
    /// Empty until the relay has assigned the message to a chat
    pub chat_id: String,
    pub image_base64: Option<String>,
}

impl ChatMessage {
    pub fn is_operator(&self) -> bool {
        self.sender.is_operator()
    }
}

// Deleted flags travel as 0/1 integers for the mobile client.
mod bool_as_int {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &bool, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u8(u8::from(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        Ok(u8::deserialize(d)? != 0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChatResponse {
    pub chat_id: String,
    pub title: String,
    pub user_email: Identity,
    pub created_at: f64,
}

/// One row of a user's chat list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    pub chat_id: String,
    pub user_email: Identity,
    pub title: String,
    pub created_at: f64,
    #[serde(with = "bool_as_int")]
    pub deleted_by_user: bool,
    pub message_count: u64,
    pub latest_message_timestamp: f64,
    pub is_unread: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatListResponse {
    pub chats: Vec<ChatSummary>,
}

/// Operator dashboard: every chat, grouped by owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminChatsResponse {
    pub users: Vec<AdminUser>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminUser {
    pub user_email: Identity,
    pub nickname: String,
    pub latest_activity: f64,
    pub chats: Vec<AdminChat>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminChat {
    pub chat_id: String,
    pub title: String,
    pub created_at: f64,
    pub deleted_by_user: bool,
    pub latest_message_timestamp: f64,
    pub message_count: u64,
    pub is_unread: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    pub status: String,
    pub id: String,
    pub chat_id: String,
    /// True when the id was already stored with an identical payload
    #[serde(default)]
    pub duplicate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TitleRequest {
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TitleResponse {
    pub status: String,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyUpload {
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyRecord {
    pub email: Identity,
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRegistration {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NicknameRequest {
    pub nickname: String,
}

/// Generic acknowledgement body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Error body returned by the relay for every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
