//! # parley-server
//!
//! Relay for end-to-end encrypted support chat between users and a single
//! operator.
//!
//! The relay stores and serves opaque message payloads; it never holds a key
//! and cannot read what it relays.  It provides:
//! - **Chats and messages** with an ownership gate on every chat-scoped call
//! - **Public key directory** used by clients for key agreement
//! - **Read markers, presence heartbeat and push fan-out**
//! - **Per-IP and per-identity rate limiting**

mod api;
mod auth;
mod config;
mod error;
mod push;
mod rate_limit;
mod relay;

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use parley_store::Database;

use crate::api::AppState;
use crate::auth::TokenTable;
use crate::config::ServerConfig;
use crate::push::LogNotifier;
use crate::rate_limit::RateLimiter;
use crate::relay::Relay;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parley_server=debug")),
        )
        .init();

    info!("Starting Parley relay v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(
        http_addr = %config.http_addr,
        database = %config.database_path.display(),
        operator = %config.operator_identity,
        tokens = config.auth_tokens.len(),
        "Loaded configuration"
    );

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let db = Database::open_at(&config.database_path)
        .with_context(|| format!("opening {}", config.database_path.display()))?;

    let oracle = TokenTable::new(config.auth_tokens.clone());
    if oracle.is_empty() {
        tracing::warn!("AUTH_TOKENS is empty; every authenticated request will be rejected");
    }

    let relay = Arc::new(Relay::new(
        db,
        config.operator_identity.clone(),
        Arc::new(LogNotifier),
        RateLimiter::new(config.message_rate_per_sec, config.message_burst),
    ));

    let rate_limiter = RateLimiter::new(config.ip_rate_per_sec, config.ip_burst);

    let app_state = AppState {
        relay: relay.clone(),
        oracle: Arc::new(oracle),
        rate_limiter: rate_limiter.clone(),
        config: Arc::new(config.clone()),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Rate limiter cleanup (every 5 minutes, evict buckets idle >10 min)
    let rl = rate_limiter.clone();
    let send_limits = relay.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            rl.purge_stale(600.0).await;
            send_limits.rate_limiter_maintenance(600.0).await;
        }
    });

    // Empty chat garbage collection
    let gc = relay.clone();
    let grace = config.empty_chat_grace;
    let every = config.maintenance_interval;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            if let Err(e) = gc.purge_empty_chats(grace).await {
                tracing::warn!(error = %e, "empty chat purge failed");
            }
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
