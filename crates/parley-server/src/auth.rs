//! Caller identification.
//!
//! The relay does not issue credentials itself. An [`IdentityOracle`] maps
//! the bearer token of each request to a stable identity; the shipped
//! oracle is a static token table loaded from configuration.

use std::sync::Arc;

use axum::extract::{FromRef, FromRequestParts};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use subtle::ConstantTimeEq;

use parley_shared::types::Identity;

use crate::error::ServerError;

/// Resolves a bearer token to the identity it was issued for.
pub trait IdentityOracle: Send + Sync {
    fn resolve(&self, token: &str) -> Option<Identity>;
}

pub type SharedOracle = Arc<dyn IdentityOracle>;

/// Fixed token table. Every entry is compared in constant time and the scan
/// never exits early, so response timing does not leak which prefix matched.
#[derive(Debug, Clone, Default)]
pub struct TokenTable {
    entries: Vec<(Vec<u8>, Identity)>,
}

impl TokenTable {
    pub fn new(entries: impl IntoIterator<Item = (String, Identity)>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|(token, identity)| (token.into_bytes(), identity))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl IdentityOracle for TokenTable {
    fn resolve(&self, token: &str) -> Option<Identity> {
        let presented = token.as_bytes();
        let mut found = None;
        for (expected, identity) in &self.entries {
            // ct_eq on unequal lengths returns false without comparing bytes
            if presented.ct_eq(expected.as_slice()).unwrap_u8() == 1 {
                found = Some(identity.clone());
            }
        }
        found
    }
}

/// Pull the token out of `Authorization: Bearer <token>`.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

/// The authenticated identity of the current request.
#[derive(Debug, Clone)]
pub struct Caller(pub Identity);

#[axum::async_trait]
impl<S> FromRequestParts<S> for Caller
where
    SharedOracle: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let oracle = SharedOracle::from_ref(state);
        let token = bearer_token(&parts.headers).ok_or(ServerError::Unauthorized)?;
        match oracle.resolve(token) {
            Some(identity) if !identity.is_empty() => Ok(Caller(identity)),
            _ => {
                tracing::debug!("Rejected unknown bearer token");
                Err(ServerError::Unauthorized)
            }
        }
    }
}
