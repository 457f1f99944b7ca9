//! The encryption context a client session runs inside: one keystore, one
//! secret cache, one directory. Created at login, torn down at logout.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use parley_shared::crypto;
use parley_shared::error::CryptoError;
use parley_shared::types::Identity;

use crate::directory::KeyDirectory;
use crate::error::ClientError;
use crate::keystore::{Keystore, SecretStorage};
use crate::secrets::SecretCache;

pub struct E2eeContext<D> {
    keystore: Arc<Keystore>,
    secrets: SecretCache<D>,
    directory: Arc<D>,
}

impl<D: KeyDirectory + 'static> E2eeContext<D> {
    pub fn new(
        identity: Identity,
        storage: Arc<dyn SecretStorage>,
        directory: Arc<D>,
        fetch_timeout: Duration,
    ) -> Self {
        let keystore = Arc::new(Keystore::new(identity, storage));
        let secrets = SecretCache::new(directory.clone(), keystore.clone(), fetch_timeout);
        Self {
            keystore,
            secrets,
            directory,
        }
    }

    pub fn identity(&self) -> &Identity {
        self.keystore.identity()
    }

    pub fn keystore(&self) -> &Keystore {
        &self.keystore
    }

    pub fn secrets(&self) -> &SecretCache<D> {
        &self.secrets
    }

    /// Make sure this device has a keypair and publish it in the background.
    /// Returns `false` when no key could be produced; sessions then run in
    /// plaintext fallback.
    pub fn init(&self) -> bool {
        let Some(pair) = self.keystore.ensure_key_pair() else {
            warn!(identity = %self.identity(), "encryption unavailable: no device key");
            return false;
        };

        let directory = self.directory.clone();
        let public_key = pair.public_key_encoded();
        tokio::spawn(async move {
            if let Err(e) = directory.publish(&public_key).await {
                warn!(error = %e, "public key publication failed");
            }
        });
        true
    }

    /// Publish the current public key and wait for the directory to accept it.
    pub async fn publish_key(&self) -> Result<(), ClientError> {
        let public_key = self
            .keystore
            .public_key_encoded()
            .ok_or(CryptoError::KeyUnavailable)?;
        self.directory.publish(&public_key).await
    }

    /// Destroy the device key and every secret derived from it.
    pub fn teardown(&self) {
        self.keystore.delete_key_pair();
        self.secrets.clear();
        info!(identity = %self.identity(), "encryption context torn down");
    }

    fn key_for(&self, peer: &Identity) -> Result<crypto::SymmetricKey, CryptoError> {
        self.secrets.key_for(peer).ok_or(CryptoError::PeerKeyNotFound)
    }

    pub fn seal_text_for(&self, peer: &Identity, text: &str) -> Result<String, CryptoError> {
        crypto::seal_text(&self.key_for(peer)?, text)
    }

    pub fn open_text_from(&self, peer: &Identity, blob: &str) -> Result<String, CryptoError> {
        crypto::open_text(&self.key_for(peer)?, blob)
    }

    pub fn seal_image_for(&self, peer: &Identity, image: &[u8]) -> Result<String, CryptoError> {
        crypto::seal_image(&self.key_for(peer)?, image)
    }

    pub fn open_image_from(&self, peer: &Identity, blob: &str) -> Result<Vec<u8>, CryptoError> {
        crypto::open_image(&self.key_for(peer)?, blob)
    }
}
