use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::constants::{KDF_SALT, PUBKEY_SIZE, SECRET_KEY_SIZE, SYMMETRIC_KEY_SIZE};
use crate::crypto::SymmetricKey;
use crate::error::CryptoError;

/// A device's long-lived X25519 key-agreement keypair.
/// The secret half never leaves the device; the public half is published
/// to the key directory so peers can derive the same shared key.
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    /// Restore a keypair from raw secret key bytes
    pub fn from_secret_bytes(secret: &[u8; SECRET_KEY_SIZE]) -> Self {
        Self::from_secret(StaticSecret::from(*secret))
    }

    /// Restore a keypair from a persisted slice; anything but 32 bytes is corrupt
    pub fn from_secret_slice(secret: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; SECRET_KEY_SIZE] = secret
            .try_into()
            .map_err(|_| CryptoError::KeyUnavailable)?;
        Ok(Self::from_secret_bytes(&bytes))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Raw secret bytes, for persistence in device storage only
    pub fn secret_bytes(&self) -> [u8; SECRET_KEY_SIZE] {
        self.secret.to_bytes()
    }

    /// Public key in the directory's transport encoding
    pub fn public_key_encoded(&self) -> String {
        encode_public_key(&self.public)
    }

    /// X25519 agreement followed by HKDF-SHA256.
    ///
    /// The raw Diffie-Hellman output is not uniformly random, so it is only
    /// ever used as HKDF input keying material, never as a cipher key.
    pub fn derive_shared_key(&self, peer: &PublicKey) -> Result<SymmetricKey, CryptoError> {
        let shared = self.secret.diffie_hellman(peer);
        if !shared.was_contributory() {
            return Err(CryptoError::AgreementFailure(
                "peer public key is a low-order point".into(),
            ));
        }

        let hk = Hkdf::<Sha256>::new(Some(KDF_SALT), shared.as_bytes());
        let mut key = [0u8; SYMMETRIC_KEY_SIZE];
        hk.expand(&[], &mut key)
            .map_err(|e| CryptoError::AgreementFailure(e.to_string()))?;
        Ok(key)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &fingerprint(&self.public))
            .finish_non_exhaustive()
    }
}

/// Standard base64 of the 32 raw public key bytes
pub fn encode_public_key(key: &PublicKey) -> String {
    STANDARD.encode(key.as_bytes())
}

/// Parse a directory-published key. Malformed input is an agreement failure
/// from the caller's point of view: no shared key can be derived from it.
pub fn decode_public_key(encoded: &str) -> Result<PublicKey, CryptoError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| CryptoError::AgreementFailure(format!("invalid base64: {e}")))?;
    let raw: [u8; PUBKEY_SIZE] = bytes.as_slice().try_into().map_err(|_| {
        CryptoError::AgreementFailure(format!(
            "expected {PUBKEY_SIZE} key bytes, got {}",
            bytes.len()
        ))
    })?;
    Ok(PublicKey::from(raw))
}

/// Short BLAKE3 fingerprint of a public key, safe to log
pub fn fingerprint(key: &PublicKey) -> String {
    let hash = blake3::hash(key.as_bytes());
    hex::encode(&hash.as_bytes()[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agreement_is_symmetric() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        let k_ab = alice.derive_shared_key(&bob.public_key()).unwrap();
        let k_ba = bob.derive_shared_key(&alice.public_key()).unwrap();

        assert_eq!(k_ab, k_ba);
    }

    #[test]
    fn test_agreement_through_encoded_keys() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        let bob_pub = decode_public_key(&bob.public_key_encoded()).unwrap();
        let alice_pub = decode_public_key(&alice.public_key_encoded()).unwrap();

        assert_eq!(
            alice.derive_shared_key(&bob_pub).unwrap(),
            bob.derive_shared_key(&alice_pub).unwrap()
        );
    }

    #[test]
    fn test_different_peers_different_keys() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let carol = KeyPair::generate();

        assert_ne!(
            alice.derive_shared_key(&bob.public_key()).unwrap(),
            alice.derive_shared_key(&carol.public_key()).unwrap()
        );
    }

    #[test]
    fn test_secret_roundtrip() {
        let kp = KeyPair::generate();
        let restored = KeyPair::from_secret_bytes(&kp.secret_bytes());
        assert_eq!(kp.public_key(), restored.public_key());
    }

    #[test]
    fn test_corrupt_secret_rejected() {
        assert_eq!(
            KeyPair::from_secret_slice(&[1, 2, 3]).unwrap_err(),
            CryptoError::KeyUnavailable
        );
    }

    #[test]
    fn test_encoded_key_is_base64_of_raw_bytes() {
        let kp = KeyPair::generate();
        let encoded = kp.public_key_encoded();
        assert_eq!(encoded.len(), 44);
        assert_eq!(STANDARD.decode(&encoded).unwrap(), kp.public_key().as_bytes());
    }

    #[test]
    fn test_malformed_public_keys_rejected() {
        assert!(matches!(
            decode_public_key("not base64!!"),
            Err(CryptoError::AgreementFailure(_))
        ));
        assert!(matches!(
            decode_public_key(&STANDARD.encode([7u8; 16])),
            Err(CryptoError::AgreementFailure(_))
        ));
    }

    #[test]
    fn test_low_order_point_rejected() {
        let kp = KeyPair::generate();
        let identity_point = PublicKey::from([0u8; 32]);
        assert!(matches!(
            kp.derive_shared_key(&identity_point),
            Err(CryptoError::AgreementFailure(_))
        ));
    }

    #[test]
    fn test_fingerprint_stable() {
        let kp = KeyPair::generate();
        assert_eq!(fingerprint(&kp.public_key()), fingerprint(&kp.public_key()));
        assert_eq!(fingerprint(&kp.public_key()).len(), 16);
    }
}
