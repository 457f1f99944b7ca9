use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use parley_shared::protocol::ErrorBody;
use parley_store::StoreError;

/// Request validation failures. Each carries a stable `reason` code so
/// clients can react without parsing the human-readable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Message cannot be empty")]
    EmptyMessage,

    #[error("Message too long (max 10,000 chars)")]
    TextTooLong,

    #[error("Image too large (max ~2MB)")]
    ImageTooLarge,

    #[error("Missing required fields")]
    MissingFields,

    #[error("Room does not match the chat owner")]
    RoomMismatch,

    #[error("chatId is required")]
    MissingChatScope,

    #[error("Missing or invalid title")]
    InvalidTitle,

    #[error("Title too long (max 100 chars)")]
    TitleTooLong,

    #[error("Invalid key format")]
    InvalidPublicKey,

    #[error("Missing device token")]
    MissingDeviceToken,

    #[error("Nickname is required (max 100 chars)")]
    InvalidNickname,

    #[error("Missing lastActive")]
    MissingLastActive,
}

impl ValidationError {
    pub fn reason(&self) -> &'static str {
        match self {
            ValidationError::EmptyMessage => "empty_message",
            ValidationError::TextTooLong => "text_too_long",
            ValidationError::ImageTooLarge => "image_too_large",
            ValidationError::MissingFields => "missing_fields",
            ValidationError::RoomMismatch => "room_mismatch",
            ValidationError::MissingChatScope => "missing_chat_scope",
            ValidationError::InvalidTitle => "invalid_title",
            ValidationError::TitleTooLong => "title_too_long",
            ValidationError::InvalidPublicKey => "invalid_public_key",
            ValidationError::MissingDeviceToken => "missing_device_token",
            ValidationError::InvalidNickname => "invalid_nickname",
            ValidationError::MissingLastActive => "missing_last_active",
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Missing or invalid Authorization header")]
    Unauthorized,

    #[error("Access denied")]
    OwnershipDenied,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Message id already exists: {0}")]
    Conflict(String),

    #[error("Too many requests")]
    RateLimited,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ServerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(id) => ServerError::Conflict(id),
            StoreError::NotFound => ServerError::NotFound("record".into()),
            other => ServerError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message, reason) = match &self {
            ServerError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string(), None),
            ServerError::OwnershipDenied => (StatusCode::FORBIDDEN, self.to_string(), None),
            ServerError::Forbidden(_) => (StatusCode::FORBIDDEN, self.to_string(), None),
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string(), None),
            ServerError::Validation(v) => {
                (StatusCode::BAD_REQUEST, v.to_string(), Some(v.reason().to_string()))
            }
            ServerError::Conflict(_) => (StatusCode::CONFLICT, self.to_string(), None),
            ServerError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, self.to_string(), None),
            ServerError::Internal(detail) => {
                tracing::error!(error = %detail, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    None,
                )
            }
        };

        let body = ErrorBody {
            error: message,
            reason,
        };

        (status, axum::Json(body)).into_response()
    }
}
