use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;

use crate::constants::{NONCE_SIZE, TAG_SIZE};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; 32];

// Fresh for every encryption; never derived from a counter or the message.
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

// Returns nonce || ciphertext || tag (12 + n + 16 bytes)
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(key.into());
    let nonce_bytes = generate_nonce();
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

/// Verifies the tag before returning anything; no partial plaintext on failure.
pub fn decrypt(key: &SymmetricKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::AuthenticationFailure);
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let cipher = Aes256Gcm::new(key.into());
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::AuthenticationFailure)
}

/// Encrypt and encode for transport: base64(nonce || ciphertext || tag)
pub fn seal(key: &SymmetricKey, plaintext: &[u8]) -> Result<String, CryptoError> {
    Ok(STANDARD.encode(encrypt(key, plaintext)?))
}

pub fn open(key: &SymmetricKey, blob: &str) -> Result<Vec<u8>, CryptoError> {
    let data = STANDARD
        .decode(blob.trim())
        .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
    decrypt(key, &data)
}

pub fn seal_text(key: &SymmetricKey, text: &str) -> Result<String, CryptoError> {
    seal(key, text.as_bytes())
}

pub fn open_text(key: &SymmetricKey, blob: &str) -> Result<String, CryptoError> {
    let bytes = open(key, blob)?;
    String::from_utf8(bytes).map_err(|e| CryptoError::InvalidEncoding(e.to_string()))
}

// Images travel as base64 text, sealed exactly like message text.
pub fn seal_image(key: &SymmetricKey, image: &[u8]) -> Result<String, CryptoError> {
    seal_text(key, &STANDARD.encode(image))
}

pub fn open_image(key: &SymmetricKey, blob: &str) -> Result<Vec<u8>, CryptoError> {
    let encoded = open_text(key, blob)?;
    STANDARD
        .decode(encoded)
        .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))
}
