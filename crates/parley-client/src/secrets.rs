//! Per-peer shared secrets.
//!
//! A secret is derived once per peer (directory fetch, X25519, HKDF) and
//! kept for the life of the process. Concurrent resolves for the same peer
//! share one fetch: the first caller leads, later callers wait on its
//! outcome. Derivation is all-or-nothing; a cancelled or failed resolve
//! leaves nothing behind in the cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use parley_shared::crypto::SymmetricKey;
use parley_shared::error::CryptoError;
use parley_shared::keys::{decode_public_key, fingerprint};
use parley_shared::types::Identity;

use crate::directory::KeyDirectory;
use crate::keystore::Keystore;

type Outcome = Option<Result<(), CryptoError>>;

pub struct SecretCache<D> {
    directory: Arc<D>,
    keystore: Arc<Keystore>,
    secrets: RwLock<HashMap<Identity, SymmetricKey>>,
    in_flight: Mutex<HashMap<Identity, watch::Receiver<Outcome>>>,
    /// Bumped by `clear`; a derivation started under an older epoch is dropped.
    epoch: AtomicU64,
    fetch_timeout: Duration,
}

/// Removes the in-flight marker however the leading resolve ends,
/// including when its future is dropped mid-fetch.
struct InFlightGuard<'a> {
    map: &'a Mutex<HashMap<Identity, watch::Receiver<Outcome>>>,
    peer: Identity,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.peer);
    }
}

enum Role {
    Leader(watch::Sender<Outcome>),
    Follower(watch::Receiver<Outcome>),
}

impl<D: KeyDirectory> SecretCache<D> {
    pub fn new(directory: Arc<D>, keystore: Arc<Keystore>, fetch_timeout: Duration) -> Self {
        Self {
            directory,
            keystore,
            secrets: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            epoch: AtomicU64::new(0),
            fetch_timeout,
        }
    }

    /// Cache lookup only.
    pub fn has(&self, peer: &Identity) -> bool {
        self.secrets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(peer)
    }

    pub fn key_for(&self, peer: &Identity) -> Option<SymmetricKey> {
        self.secrets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .copied()
    }

    /// Forget every derived secret.
    pub fn clear(&self) {
        let mut secrets = self.secrets.write().unwrap_or_else(PoisonError::into_inner);
        secrets.clear();
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    pub async fn resolve(&self, peer: &Identity) -> bool {
        self.resolve_detailed(peer).await.is_ok()
    }

    /// Ensure a secret exists for `peer`, reporting why when it cannot.
    pub async fn resolve_detailed(&self, peer: &Identity) -> Result<(), CryptoError> {
        loop {
            if self.has(peer) {
                return Ok(());
            }

            let role = {
                let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
                match in_flight.get(peer) {
                    Some(rx) => Role::Follower(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        in_flight.insert(peer.clone(), rx);
                        Role::Leader(tx)
                    }
                }
            };

            match role {
                Role::Leader(tx) => {
                    let _guard = InFlightGuard {
                        map: &self.in_flight,
                        peer: peer.clone(),
                    };
                    // A previous leader may have finished between the first
                    // check and taking the marker.
                    let result = if self.has(peer) {
                        Ok(())
                    } else {
                        self.derive(peer).await
                    };
                    tx.send_replace(Some(result.clone()));
                    return result;
                }
                Role::Follower(mut rx) => {
                    debug!(peer = %peer, "waiting on in-flight resolve");
                    let outcome = rx.wait_for(Option::is_some).await.map(|v| v.clone());
                    match outcome {
                        Ok(Some(result)) => return result,
                        // Leader was cancelled before finishing; try again.
                        Ok(None) | Err(_) => continue,
                    }
                }
            }
        }
    }

    async fn derive(&self, peer: &Identity) -> Result<(), CryptoError> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let local = self.keystore.key_pair()?;

        let encoded = match tokio::time::timeout(self.fetch_timeout, self.directory.fetch(peer)).await {
            Ok(Ok(Some(encoded))) => encoded,
            Ok(Ok(None)) => {
                warn!(peer = %peer, "peer has no published key");
                return Err(CryptoError::PeerKeyNotFound);
            }
            Ok(Err(e)) => {
                warn!(peer = %peer, error = %e, "peer key fetch failed");
                return Err(CryptoError::PeerKeyNotFound);
            }
            Err(_) => {
                warn!(peer = %peer, timeout = ?self.fetch_timeout, "peer key fetch timed out");
                return Err(CryptoError::PeerKeyNotFound);
            }
        };

        let peer_key = decode_public_key(&encoded).map_err(|e| {
            warn!(peer = %peer, error = %e, "peer published a malformed key");
            e
        })?;
        let secret = local.derive_shared_key(&peer_key).map_err(|e| {
            warn!(peer = %peer, error = %e, "key agreement failed");
            e
        })?;

        {
            let mut secrets = self.secrets.write().unwrap_or_else(PoisonError::into_inner);
            // The cache may have been cleared, or the device key replaced,
            // while the fetch was out.
            let same_key = self
                .keystore
                .key_pair()
                .is_ok_and(|current| current.public_key() == local.public_key());
            if !same_key || self.epoch.load(Ordering::SeqCst) != epoch {
                warn!(peer = %peer, "device key changed during resolve, secret discarded");
                return Err(CryptoError::KeyUnavailable);
            }
            secrets.insert(peer.clone(), secret);
        }
        info!(peer = %peer, fingerprint = %fingerprint(&peer_key), "shared secret derived");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::error::ClientError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory directory that counts fetches and can be slowed down.
    #[derive(Default)]
    pub struct MockDirectory {
        pub keys: Mutex<HashMap<Identity, String>>,
        pub published: Mutex<Vec<String>>,
        pub fetches: AtomicUsize,
        pub delay: Mutex<Duration>,
        pub fail_with_network: std::sync::atomic::AtomicBool,
    }

    impl MockDirectory {
        pub fn with_key(self, peer: &Identity, key: String) -> Self {
            self.keys.lock().unwrap().insert(peer.clone(), key);
            self
        }

        pub fn fetch_count(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    impl KeyDirectory for MockDirectory {
        async fn publish(&self, public_key: &str) -> Result<(), ClientError> {
            self.published.lock().unwrap().push(public_key.to_string());
            Ok(())
        }

        async fn fetch(&self, peer: &Identity) -> Result<Option<String>, ClientError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let delay = *self.delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.fail_with_network.load(Ordering::SeqCst) {
                return Err(ClientError::Network("offline".into()));
            }
            Ok(self.keys.lock().unwrap().get(peer).cloned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MockDirectory;
    use super::*;
    use crate::keystore::{Accessibility, MemorySecretStorage, SecretStorage};

    fn keystore(name: &str) -> Arc<Keystore> {
        let store = Keystore::new(
            Identity::from_email(name),
            Arc::new(MemorySecretStorage::default()),
        );
        store.ensure_key_pair().unwrap();
        Arc::new(store)
    }

    fn peer() -> Identity {
        Identity::from_email("admin@example.com")
    }

    fn cache_with(directory: MockDirectory) -> (SecretCache<MockDirectory>, Arc<MockDirectory>) {
        let directory = Arc::new(directory);
        let cache = SecretCache::new(directory.clone(), keystore("u@example.com"), Duration::from_secs(1));
        (cache, directory)
    }

    #[tokio::test]
    async fn test_both_sides_derive_same_secret() {
        let alice = Identity::from_email("alice@example.com");
        let bob = Identity::from_email("bob@example.com");
        let alice_keys = keystore(alice.as_str());
        let bob_keys = keystore(bob.as_str());

        let directory = Arc::new(
            MockDirectory::default()
                .with_key(&alice, alice_keys.public_key_encoded().unwrap())
                .with_key(&bob, bob_keys.public_key_encoded().unwrap()),
        );

        let on_alice = SecretCache::new(directory.clone(), alice_keys, Duration::from_secs(1));
        let on_bob = SecretCache::new(directory, bob_keys, Duration::from_secs(1));

        assert!(on_alice.resolve(&bob).await);
        assert!(on_bob.resolve(&alice).await);
        assert_eq!(on_alice.key_for(&bob), on_bob.key_for(&alice));
    }

    #[tokio::test]
    async fn test_sequential_resolve_fetches_once() {
        let peer_keys = keystore("admin@example.com");
        let (cache, directory) =
            cache_with(MockDirectory::default().with_key(&peer(), peer_keys.public_key_encoded().unwrap()));

        assert!(!cache.has(&peer()));
        assert!(cache.resolve(&peer()).await);
        let first = cache.key_for(&peer());
        assert!(cache.resolve(&peer()).await);

        assert_eq!(directory.fetch_count(), 1);
        assert_eq!(cache.key_for(&peer()), first);
    }

    #[tokio::test]
    async fn test_concurrent_resolves_share_one_fetch() {
        let peer_keys = keystore("admin@example.com");
        let directory =
            MockDirectory::default().with_key(&peer(), peer_keys.public_key_encoded().unwrap());
        *directory.delay.lock().unwrap() = Duration::from_millis(50);
        let (cache, directory) = cache_with(directory);

        let p = peer();
        let results = tokio::join!(
            cache.resolve(&p),
            cache.resolve(&p),
            cache.resolve(&p),
            cache.resolve(&p),
        );
        assert_eq!(results, (true, true, true, true));
        assert_eq!(directory.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_peer_key_caches_nothing() {
        let (cache, directory) = cache_with(MockDirectory::default());

        assert_eq!(
            cache.resolve_detailed(&peer()).await,
            Err(CryptoError::PeerKeyNotFound)
        );
        assert!(!cache.has(&peer()));

        // A later resolve asks again.
        assert!(!cache.resolve(&peer()).await);
        assert_eq!(directory.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_malformed_peer_key_is_agreement_failure() {
        let (cache, _) = cache_with(MockDirectory::default().with_key(&peer(), "bm9wZQ==".into()));
        assert!(matches!(
            cache.resolve_detailed(&peer()).await,
            Err(CryptoError::AgreementFailure(_))
        ));
        assert!(!cache.has(&peer()));
    }

    #[tokio::test]
    async fn test_network_failure_and_timeout_count_as_not_found() {
        let directory = MockDirectory::default();
        directory.fail_with_network.store(true, Ordering::SeqCst);
        let (cache, _) = cache_with(directory);
        assert_eq!(
            cache.resolve_detailed(&peer()).await,
            Err(CryptoError::PeerKeyNotFound)
        );

        let peer_keys = keystore("admin@example.com");
        let slow = MockDirectory::default().with_key(&peer(), peer_keys.public_key_encoded().unwrap());
        *slow.delay.lock().unwrap() = Duration::from_millis(200);
        let slow = Arc::new(slow);
        let cache = SecretCache::new(slow.clone(), keystore("u@example.com"), Duration::from_millis(20));
        assert_eq!(
            cache.resolve_detailed(&peer()).await,
            Err(CryptoError::PeerKeyNotFound)
        );
        assert_eq!(slow.fetch_count(), 1);
        assert!(!cache.has(&peer()));
    }

    #[tokio::test]
    async fn test_missing_local_key_is_key_unavailable() {
        // Corrupt key material is never replaced, so the keystore has no key.
        let storage = Arc::new(MemorySecretStorage::default());
        storage
            .store("e2ee-private-key:u@example.com", b"bad", Accessibility::AfterFirstUnlock)
            .unwrap();
        let broken = Arc::new(Keystore::new(Identity::from_email("u@example.com"), storage));
        let directory = Arc::new(MockDirectory::default());
        let cache = SecretCache::new(directory.clone(), broken, Duration::from_secs(1));

        assert_eq!(
            cache.resolve_detailed(&peer()).await,
            Err(CryptoError::KeyUnavailable)
        );
        assert_eq!(directory.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_leader_leaves_no_marker() {
        let peer_keys = keystore("admin@example.com");
        let directory =
            MockDirectory::default().with_key(&peer(), peer_keys.public_key_encoded().unwrap());
        *directory.delay.lock().unwrap() = Duration::from_millis(100);
        let (cache, directory) = cache_with(directory);

        let p = peer();
        let abandoned =
            tokio::time::timeout(Duration::from_millis(10), cache.resolve(&p)).await;
        assert!(abandoned.is_err());
        assert!(!cache.has(&p));
        assert!(cache.in_flight.lock().unwrap().is_empty());

        *directory.delay.lock().unwrap() = Duration::ZERO;
        assert!(cache.resolve(&p).await);
        assert_eq!(directory.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_resolve_never_generates_a_local_key() {
        let peer_keys = keystore("admin@example.com");
        let local = keystore("u@example.com");
        local.delete_key_pair();
        let directory = Arc::new(
            MockDirectory::default().with_key(&peer(), peer_keys.public_key_encoded().unwrap()),
        );
        let cache = SecretCache::new(directory.clone(), local.clone(), Duration::from_secs(1));

        assert_eq!(
            cache.resolve_detailed(&peer()).await,
            Err(CryptoError::KeyUnavailable)
        );
        assert!(local.public_key_encoded().is_none());
        assert_eq!(directory.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_key_deleted_mid_resolve_leaves_no_secret() {
        let peer_keys = keystore("admin@example.com");
        let directory =
            MockDirectory::default().with_key(&peer(), peer_keys.public_key_encoded().unwrap());
        *directory.delay.lock().unwrap() = Duration::from_millis(50);
        let local = keystore("u@example.com");
        let cache = SecretCache::new(Arc::new(directory), local.clone(), Duration::from_secs(1));

        let p = peer();
        let teardown = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            local.delete_key_pair();
            cache.clear();
        };
        let (result, ()) = tokio::join!(cache.resolve_detailed(&p), teardown);

        assert_eq!(result, Err(CryptoError::KeyUnavailable));
        assert!(!cache.has(&p));
        assert!(local.public_key_encoded().is_none());
    }

    #[tokio::test]
    async fn test_clear_mid_resolve_discards_result() {
        let peer_keys = keystore("admin@example.com");
        let directory =
            MockDirectory::default().with_key(&peer(), peer_keys.public_key_encoded().unwrap());
        *directory.delay.lock().unwrap() = Duration::from_millis(50);
        let (cache, directory) = cache_with(directory);

        let p = peer();
        let clear = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cache.clear();
        };
        let (result, ()) = tokio::join!(cache.resolve_detailed(&p), clear);
        assert!(result.is_err());
        assert!(!cache.has(&p));

        // The next resolve starts fresh and succeeds.
        *directory.delay.lock().unwrap() = Duration::ZERO;
        assert!(cache.resolve(&p).await);
    }

    #[tokio::test]
    async fn test_clear_forgets_secrets() {
        let peer_keys = keystore("admin@example.com");
        let (cache, _) =
            cache_with(MockDirectory::default().with_key(&peer(), peer_keys.public_key_encoded().unwrap()));
        assert!(cache.resolve(&peer()).await);
        cache.clear();
        assert!(!cache.has(&peer()));
    }
}
