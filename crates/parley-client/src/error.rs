use thiserror::Error;

use parley_shared::error::CryptoError;

/// Failures surfaced by the relay client and the chat session.
///
/// Only [`ClientError::Network`] is worth retrying; authorization and
/// validation failures come back the same way every time.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Network failure: {0}")]
    Network(String),

    #[error("Relay answered {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Access denied")]
    OwnershipDenied,

    #[error("Rejected by relay: {reason}")]
    Validation { reason: String },

    #[error("Malformed relay response: {0}")]
    Decode(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Network(_))
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ClientError::Decode(e.to_string())
        } else {
            ClientError::Network(e.to_string())
        }
    }
}
