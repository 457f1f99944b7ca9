//! Public key directory seam.

use std::future::Future;

use parley_shared::types::Identity;

use crate::error::ClientError;

/// Where public keys are published and looked up. The relay's `/keys`
/// endpoints are the production implementation.
pub trait KeyDirectory: Send + Sync {
    /// Upsert the caller's public key. Best-effort: callers log failures.
    fn publish(&self, public_key: &str) -> impl Future<Output = Result<(), ClientError>> + Send;

    /// `Ok(None)` when the peer has not published a key.
    fn fetch(
        &self,
        peer: &Identity,
    ) -> impl Future<Output = Result<Option<String>, ClientError>> + Send;
}
