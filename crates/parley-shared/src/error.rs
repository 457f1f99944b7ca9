use thiserror::Error;

/// Failures of the end-to-end encryption stack.
///
/// None of these are fatal to a chat session: key setup failures put the
/// session into plaintext fallback, and `AuthenticationFailure` only affects
/// the single payload that failed to open.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Local keypair unavailable")]
    KeyUnavailable,

    #[error("No published public key for peer")]
    PeerKeyNotFound,

    #[error("Key agreement failed: {0}")]
    AgreementFailure(String),

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Authentication failed: invalid ciphertext or wrong key")]
    AuthenticationFailure,

    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),
}

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
