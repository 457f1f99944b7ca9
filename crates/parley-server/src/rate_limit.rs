use std::collections::HashMap;
use std::hash::Hash;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{ConnectInfo, State},
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::ServerError;

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self, rate: f64, capacity: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;

        self.tokens = (self.tokens + elapsed * rate).min(capacity);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Token-bucket limiter keyed by client address or by identity.
#[derive(Clone)]
pub struct RateLimiter<K> {
    buckets: Arc<Mutex<HashMap<K, TokenBucket>>>,
    rate: f64,
    capacity: f64,
}

impl<K: Eq + Hash> RateLimiter<K> {
    pub fn new(rate: f64, capacity: f64) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            rate,
            capacity,
        }
    }

    pub async fn check(&self, key: K) -> bool {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(key)
            .or_insert_with(|| TokenBucket::new(self.capacity));
        bucket.try_consume(self.rate, self.capacity)
    }

    pub async fn purge_stale(&self, max_idle_secs: f64) {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        buckets.retain(|_, bucket| {
            now.duration_since(bucket.last_refill).as_secs_f64() < max_idle_secs
        });
    }

    pub async fn tracked(&self) -> usize {
        self.buckets.lock().await.len()
    }
}

pub async fn rate_limit_middleware(
    State(limiter): State<RateLimiter<IpAddr>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if let Some(ip) = extract_client_ip(&req) {
        if !limiter.check(ip).await {
            warn!(ip = %ip, "Rate limit exceeded");
            return ServerError::RateLimited.into_response();
        }
    }

    next.run(req).await
}

/// Try ConnectInfo first, then X-Forwarded-For, then X-Real-IP.
fn extract_client_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    if let Some(connect_info) = req.extensions().get::<ConnectInfo<std::net::SocketAddr>>() {
        return Some(connect_info.0.ip());
    }

    let header_ip = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse::<IpAddr>().ok())
    };

    header_ip("x-forwarded-for").or_else(|| header_ip("x-real-ip"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_shared::types::Identity;

    #[tokio::test]
    async fn test_rate_limiter_allows_burst() {
        let limiter = RateLimiter::new(10.0, 5.0);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();

        for _ in 0..5 {
            assert!(limiter.check(ip).await);
        }

        assert!(!limiter.check(ip).await);
    }

    #[tokio::test]
    async fn test_identity_buckets_are_independent() {
        let limiter = RateLimiter::new(0.0, 1.0);
        let alice = Identity::from_email("alice@example.com");
        let bob = Identity::from_email("bob@example.com");

        assert!(limiter.check(alice.clone()).await);
        assert!(!limiter.check(alice).await);
        assert!(limiter.check(bob).await);
    }

    #[tokio::test]
    async fn test_purge_stale() {
        let limiter = RateLimiter::new(10.0, 5.0);
        let ip: IpAddr = "192.168.1.1".parse().unwrap();
        assert!(limiter.check(ip).await);

        limiter.purge_stale(0.0).await;
        assert_eq!(limiter.tracked().await, 0);
    }

    #[test]
    fn test_extract_client_ip_from_headers() {
        let req = Request::builder()
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .body(())
            .unwrap();
        assert_eq!(extract_client_ip(&req), "203.0.113.7".parse().ok());

        let req = Request::builder()
            .header("x-real-ip", "198.51.100.2")
            .body(())
            .unwrap();
        assert_eq!(extract_client_ip(&req), "198.51.100.2".parse().ok());

        let req = Request::builder().body(()).unwrap();
        assert_eq!(extract_client_ip(&req), None);
    }
}
