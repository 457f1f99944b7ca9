//! Long-lived device keypair.
//!
//! One X25519 keypair per identity, created lazily and kept until it is
//! explicitly deleted. Persistence goes through [`SecretStorage`] so the
//! platform keychain can be swapped in; storage failures never propagate,
//! they leave the keystore without a key and the session falls back to
//! plaintext.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use parley_shared::error::CryptoError;
use parley_shared::keys::{fingerprint, KeyPair};
use parley_shared::types::Identity;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("secure storage unavailable: {0}")]
    Unavailable(String),
}

/// When a stored secret may be read. Mirrors the keychain accessibility
/// classes of mobile platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accessibility {
    /// Readable once the device has been unlocked after boot.
    AfterFirstUnlock,
}

/// Device-scoped storage for secret key material.
pub trait SecretStorage: Send + Sync {
    fn load(&self, account: &str) -> Result<Option<Vec<u8>>, StorageError>;
    fn store(&self, account: &str, secret: &[u8], access: Accessibility) -> Result<(), StorageError>;
    fn remove(&self, account: &str) -> Result<(), StorageError>;
}

/// One file per account, owner read/write only.
#[derive(Debug, Clone)]
pub struct FileSecretStorage {
    dir: PathBuf,
}

impl FileSecretStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, account: &str) -> PathBuf {
        // Hash the account so arbitrary identities map to safe file names.
        let name = hex::encode(&blake3::hash(account.as_bytes()).as_bytes()[..16]);
        self.dir.join(format!("{name}.key"))
    }
}

impl SecretStorage for FileSecretStorage {
    fn load(&self, account: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(self.path_for(account)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, account: &str, secret: &[u8], access: Accessibility) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(account);
        let tmp = path.with_extension("tmp");
        // A leftover tmp file may carry looser permissions; start fresh.
        match fs::remove_file(&tmp) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let mut file = create_private(&tmp)?;
        file.write_all(secret)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &path)?;
        debug!(?access, path = %path.display(), "secret stored");
        Ok(())
    }

    fn remove(&self, account: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path_for(account)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// New file, owner read/write from the moment it exists.
#[cfg(unix)]
fn create_private(path: &Path) -> io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn create_private(path: &Path) -> io::Result<fs::File> {
    fs::OpenOptions::new().write(true).create_new(true).open(path)
}

/// Volatile storage for tests and guest sessions.
#[derive(Debug, Default)]
pub struct MemorySecretStorage {
    secrets: Mutex<HashMap<String, Vec<u8>>>,
}

impl SecretStorage for MemorySecretStorage {
    fn load(&self, account: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let secrets = self.secrets.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(secrets.get(account).cloned())
    }

    fn store(&self, account: &str, secret: &[u8], _access: Accessibility) -> Result<(), StorageError> {
        let mut secrets = self.secrets.lock().unwrap_or_else(PoisonError::into_inner);
        secrets.insert(account.to_string(), secret.to_vec());
        Ok(())
    }

    fn remove(&self, account: &str) -> Result<(), StorageError> {
        let mut secrets = self.secrets.lock().unwrap_or_else(PoisonError::into_inner);
        secrets.remove(account);
        Ok(())
    }
}

pub struct Keystore {
    identity: Identity,
    storage: Arc<dyn SecretStorage>,
    cached: RwLock<Option<Arc<KeyPair>>>,
}

impl Keystore {
    pub fn new(identity: Identity, storage: Arc<dyn SecretStorage>) -> Self {
        Self {
            identity,
            storage,
            cached: RwLock::new(None),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    fn account(&self) -> String {
        format!("e2ee-private-key:{}", self.identity)
    }

    fn cached(&self) -> Option<Arc<KeyPair>> {
        self.cached
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn remember(&self, pair: Arc<KeyPair>) {
        *self.cached.write().unwrap_or_else(PoisonError::into_inner) = Some(pair);
    }

    /// The persisted keypair, without generating one.
    fn load(&self) -> Option<Arc<KeyPair>> {
        if let Some(pair) = self.cached() {
            return Some(pair);
        }
        match self.storage.load(&self.account()) {
            Ok(Some(bytes)) => match KeyPair::from_secret_slice(&bytes) {
                Ok(pair) => {
                    let pair = Arc::new(pair);
                    self.remember(pair.clone());
                    Some(pair)
                }
                Err(e) => {
                    error!(identity = %self.identity, error = %e, "stored private key is corrupt");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(identity = %self.identity, error = %e, "failed to read private key");
                None
            }
        }
    }

    /// Return the device keypair, generating and persisting one if none
    /// exists. `None` means encryption is unavailable on this device.
    pub fn ensure_key_pair(&self) -> Option<Arc<KeyPair>> {
        if let Some(pair) = self.load() {
            return Some(pair);
        }
        if matches!(self.storage.load(&self.account()), Ok(Some(_))) {
            // Unreadable key material stays in place until explicitly deleted.
            return None;
        }

        let pair = KeyPair::generate();
        if let Err(e) = self.storage.store(
            &self.account(),
            &pair.secret_bytes(),
            Accessibility::AfterFirstUnlock,
        ) {
            warn!(identity = %self.identity, error = %e, "failed to persist private key");
            return None;
        }

        info!(
            identity = %self.identity,
            fingerprint = %fingerprint(&pair.public_key()),
            "generated device keypair"
        );
        let pair = Arc::new(pair);
        self.remember(pair.clone());
        Some(pair)
    }

    /// The existing keypair. Never generates one: a key nobody published
    /// would leave the two sides deriving different secrets.
    pub fn key_pair(&self) -> Result<Arc<KeyPair>, CryptoError> {
        self.load().ok_or(CryptoError::KeyUnavailable)
    }

    /// Standard base64 of the raw public key, if a keypair exists.
    pub fn public_key_encoded(&self) -> Option<String> {
        self.load().map(|pair| pair.public_key_encoded())
    }

    /// Destroy the persisted private key and forget the cached copy.
    pub fn delete_key_pair(&self) {
        if let Err(e) = self.storage.remove(&self.account()) {
            warn!(identity = %self.identity, error = %e, "failed to delete private key");
        }
        *self.cached.write().unwrap_or_else(PoisonError::into_inner) = None;
        info!(identity = %self.identity, "device keypair deleted");
    }
}
