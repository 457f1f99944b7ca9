use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, FromRef, Path, Query, State},
    http::Method,
    middleware,
    routing::{delete, get, patch, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use parley_shared::constants::DEFAULT_PRESENCE_ROOM;
use parley_shared::envelope::{Document, DocumentList};
use parley_shared::protocol::{
    AdminChatsResponse, ChatListResponse, CreateChatResponse, DeviceRegistration, HealthResponse,
    NicknameRequest, PublicKeyRecord, PublicKeyUpload, SendMessageResponse, StatusResponse,
    TitleRequest, TitleResponse,
};
use parley_shared::types::{Identity, Party};

use crate::auth::{Caller, SharedOracle};
use crate::config::ServerConfig;
use crate::error::{ServerError, ValidationError};
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::relay::{MessageScope, Relay};

#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    pub oracle: SharedOracle,
    pub rate_limiter: RateLimiter<IpAddr>,
    pub config: Arc<ServerConfig>,
}

impl FromRef<AppState> for SharedOracle {
    fn from_ref(state: &AppState) -> Self {
        state.oracle.clone()
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/messages", get(list_messages).post(send_message))
        .route("/chats", get(list_chats).post(create_chat))
        .route("/chats/all", get(admin_chats))
        .route("/chats/:chat_id/delete", patch(delete_chat))
        .route("/chats/:chat_id/title", patch(update_title))
        .route("/chats/:chat_id/user-read", patch(mark_user_read))
        .route("/chats/:chat_id/read", patch(mark_operator_read))
        .route("/keys", put(publish_key))
        .route("/keys/:email", get(fetch_key))
        .route("/register-device", post(register_device))
        .route("/user/nickname", post(set_nickname))
        .route("/account", delete(delete_account))
        .route("/status", get(get_status).patch(heartbeat))
        .route("/export", get(export))
        .layer(DefaultBodyLimit::max(state.config.max_body_bytes))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagesQuery {
    chat_id: Option<String>,
    room: Option<String>,
    page_size: Option<u32>,
}

async fn list_messages(
    Caller(caller): Caller,
    State(state): State<AppState>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<DocumentList>, ServerError> {
    let scope = MessageScope::from_query(query.chat_id.as_deref(), query.room.as_deref());
    let messages = state
        .relay
        .list_messages(&caller, &scope, query.page_size)
        .await?;
    Ok(Json(DocumentList::from_messages(&messages)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendQuery {
    document_id: Option<String>,
}

async fn send_message(
    Caller(caller): Caller,
    State(state): State<AppState>,
    Query(query): Query<SendQuery>,
    Json(document): Json<Document>,
) -> Result<Json<SendMessageResponse>, ServerError> {
    let fields = document.fields.ok_or(ValidationError::MissingFields)?;
    let response = state
        .relay
        .append_message(&caller, query.document_id.as_deref(), &fields)
        .await?;
    Ok(Json(response))
}

async fn export(
    Caller(caller): Caller,
    State(state): State<AppState>,
) -> Result<Json<DocumentList>, ServerError> {
    let messages = state.relay.export(&caller).await?;
    Ok(Json(DocumentList::from_messages(&messages)))
}

// ---------------------------------------------------------------------------
// Chats
// ---------------------------------------------------------------------------

async fn create_chat(
    Caller(caller): Caller,
    State(state): State<AppState>,
) -> Result<Json<CreateChatResponse>, ServerError> {
    Ok(Json(state.relay.create_chat(&caller).await?))
}

async fn list_chats(
    Caller(caller): Caller,
    State(state): State<AppState>,
) -> Result<Json<ChatListResponse>, ServerError> {
    Ok(Json(state.relay.list_chats(&caller).await?))
}

async fn admin_chats(
    Caller(caller): Caller,
    State(state): State<AppState>,
) -> Result<Json<AdminChatsResponse>, ServerError> {
    Ok(Json(state.relay.admin_chats(&caller).await?))
}

async fn delete_chat(
    Caller(caller): Caller,
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> Result<Json<StatusResponse>, ServerError> {
    state.relay.soft_delete_chat(&caller, &chat_id).await?;
    Ok(Json(StatusResponse::new("deleted")))
}

async fn update_title(
    Caller(caller): Caller,
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Json(req): Json<TitleRequest>,
) -> Result<Json<TitleResponse>, ServerError> {
    Ok(Json(state.relay.rename_chat(&caller, &chat_id, &req.title).await?))
}

async fn mark_user_read(
    Caller(caller): Caller,
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> Result<Json<StatusResponse>, ServerError> {
    state.relay.mark_read(&caller, &chat_id, Party::User).await?;
    Ok(Json(StatusResponse::new("ok")))
}

async fn mark_operator_read(
    Caller(caller): Caller,
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> Result<Json<StatusResponse>, ServerError> {
    state.relay.mark_read(&caller, &chat_id, Party::Operator).await?;
    Ok(Json(StatusResponse::new("ok")))
}

// ---------------------------------------------------------------------------
// Directory, devices, account
// ---------------------------------------------------------------------------

async fn publish_key(
    Caller(caller): Caller,
    State(state): State<AppState>,
    Json(req): Json<PublicKeyUpload>,
) -> Result<Json<StatusResponse>, ServerError> {
    state.relay.publish_key(&caller, &req.public_key).await?;
    Ok(Json(StatusResponse::new("ok")))
}

async fn fetch_key(
    Caller(caller): Caller,
    State(state): State<AppState>,
    Path(email): Path<String>,
) -> Result<Json<PublicKeyRecord>, ServerError> {
    let target = Identity::from_email(&email);
    Ok(Json(state.relay.fetch_key(&caller, &target).await?))
}

async fn register_device(
    Caller(caller): Caller,
    State(state): State<AppState>,
    Json(req): Json<DeviceRegistration>,
) -> Result<Json<StatusResponse>, ServerError> {
    state.relay.register_device(&caller, &req.token).await?;
    Ok(Json(StatusResponse::new("registered")))
}

async fn set_nickname(
    Caller(caller): Caller,
    State(state): State<AppState>,
    Json(req): Json<NicknameRequest>,
) -> Result<Json<StatusResponse>, ServerError> {
    state.relay.set_nickname(&caller, &req.nickname).await?;
    Ok(Json(StatusResponse::new("ok")))
}

async fn delete_account(
    Caller(caller): Caller,
    State(state): State<AppState>,
) -> Result<Json<Value>, ServerError> {
    let report = state.relay.erase_account(&caller).await?;
    Ok(Json(json!({
        "status": "deleted",
        "messages": report.messages,
        "chats": report.chats,
    })))
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RoomQuery {
    room: Option<String>,
}

impl RoomQuery {
    fn room(&self) -> &str {
        self.room
            .as_deref()
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_PRESENCE_ROOM)
    }
}

async fn heartbeat(
    Caller(caller): Caller,
    State(state): State<AppState>,
    Query(query): Query<RoomQuery>,
    Json(document): Json<Document>,
) -> Result<Json<Document>, ServerError> {
    let last_active = state
        .relay
        .heartbeat(&caller, query.room(), document.last_active())
        .await?;
    Ok(Json(Document::presence(last_active)))
}

async fn get_status(
    Caller(_caller): Caller,
    State(state): State<AppState>,
    Query(query): Query<RoomQuery>,
) -> Result<Json<Document>, ServerError> {
    let document = match state.relay.presence(query.room()).await? {
        Some(last_active) => Document::presence(last_active),
        None => Document::default(),
    };
    Ok(Json(document))
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
