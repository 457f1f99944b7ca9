//! Chat session orchestration.
//!
//! A session resolves the peer's shared secret before any cryptographic
//! work, seals outbound fields, opens inbound ones, and merges the relay's
//! view with messages still waiting for confirmation. Encryption setup ends
//! in exactly one of two states per session: ready, or failed with a
//! visible plaintext fallback.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::{debug, info, warn};

use parley_shared::constants::DEFAULT_PRESENCE_ROOM;
use parley_shared::error::CryptoError;
use parley_shared::protocol::ChatMessage;
use parley_shared::types::{now_secs, truncate_title, Identity, Party};

use crate::config::ClientConfig;
use crate::context::E2eeContext;
use crate::directory::KeyDirectory;
use crate::error::ClientError;
use crate::events::{EventBus, SessionEvent};
use crate::scheduler::RecurringTask;
use crate::transport::RelayTransport;

#[derive(Debug, Clone, PartialEq)]
pub enum EncryptionState {
    /// Secret not resolved yet; inbound processing is held back.
    Pending,
    Ready,
    /// Plaintext fallback for the rest of the session.
    Failed(CryptoError),
}

/// A message as the session displays it.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalMessage {
    pub id: String,
    pub text: String,
    pub sender: Party,
    pub timestamp: f64,
    pub chat_id: String,
    /// Base64 image bytes, or the payload as received if it did not open.
    pub image: Option<String>,
    /// Not yet acknowledged by the relay.
    pub pending: bool,
    /// A field failed to open and is shown as received.
    pub shown_raw: bool,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub error_ttl: Duration,
    pub presence_window: Duration,
    pub presence_room: String,
}

impl From<&ClientConfig> for SessionSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            heartbeat_interval: config.heartbeat_interval,
            error_ttl: config.error_ttl,
            presence_window: config.presence_window,
            presence_room: DEFAULT_PRESENCE_ROOM.to_string(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

#[derive(Debug)]
struct ErrorBanner {
    message: String,
    expires_at: Instant,
}

#[derive(Debug)]
struct SessionState {
    encryption: EncryptionState,
    chat_id: Option<String>,
    /// Last relay snapshot, still sealed.
    raw: Vec<ChatMessage>,
    /// What the session shows: decrypted snapshot merged with the outbox.
    messages: Vec<LocalMessage>,
    /// Sent or sending locally, not yet seen in a snapshot.
    outbox: Vec<LocalMessage>,
    banner: Option<ErrorBanner>,
    banner_seq: u64,
    operator_online: bool,
}

/// Background work owned by a running session. Dropping it stops both.
pub struct SessionTasks {
    pub poll: RecurringTask,
    pub heartbeat: Option<RecurringTask>,
}

pub struct ChatSession<T, D> {
    transport: Arc<T>,
    e2ee: Arc<E2eeContext<D>>,
    role: Party,
    /// The user identity whose conversation this is.
    room: Identity,
    peer: Identity,
    settings: SessionSettings,
    state: Arc<Mutex<SessionState>>,
    /// Held by a send that has no chat yet, so only one send opens a chat.
    chat_gate: tokio::sync::Mutex<()>,
    events: EventBus,
}

impl<T, D> ChatSession<T, D>
where
    T: RelayTransport + 'static,
    D: KeyDirectory + 'static,
{
    /// A user talking to the operator.
    pub fn for_user(
        transport: Arc<T>,
        e2ee: Arc<E2eeContext<D>>,
        operator: Identity,
        chat_id: Option<String>,
        settings: SessionSettings,
    ) -> Self {
        let room = e2ee.identity().clone();
        Self::new(transport, e2ee, Party::User, room, operator, chat_id, settings)
    }

    /// The operator answering one user.
    pub fn for_operator(
        transport: Arc<T>,
        e2ee: Arc<E2eeContext<D>>,
        user: Identity,
        chat_id: Option<String>,
        settings: SessionSettings,
    ) -> Self {
        Self::new(
            transport,
            e2ee,
            Party::Operator,
            user.clone(),
            user,
            chat_id,
            settings,
        )
    }

    fn new(
        transport: Arc<T>,
        e2ee: Arc<E2eeContext<D>>,
        role: Party,
        room: Identity,
        peer: Identity,
        chat_id: Option<String>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            transport,
            e2ee,
            role,
            room,
            peer,
            settings,
            state: Arc::new(Mutex::new(SessionState {
                encryption: EncryptionState::Pending,
                chat_id: chat_id.filter(|c| !c.is_empty()),
                raw: Vec::new(),
                messages: Vec::new(),
                outbox: Vec::new(),
                banner: None,
                banner_seq: 0,
                operator_online: false,
            })),
            chat_gate: tokio::sync::Mutex::new(()),
            events: EventBus::default(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn peer(&self) -> &Identity {
        &self.peer
    }

    pub fn encryption_state(&self) -> EncryptionState {
        self.lock().encryption.clone()
    }

    pub fn chat_id(&self) -> Option<String> {
        self.lock().chat_id.clone()
    }

    pub fn messages(&self) -> Vec<LocalMessage> {
        self.lock().messages.clone()
    }

    pub fn operator_online(&self) -> bool {
        self.lock().operator_online
    }

    /// Current error banner, if it has not expired.
    pub fn error(&self) -> Option<String> {
        let state = self.lock();
        state
            .banner
            .as_ref()
            .filter(|b| b.expires_at > Instant::now())
            .map(|b| b.message.clone())
    }

    // ------------------------------------------------------------------
    // Encryption setup
    // ------------------------------------------------------------------

    /// Resolve the peer's secret and settle the encryption state. Later
    /// calls return the settled state without resolving again.
    pub async fn enter(&self) -> EncryptionState {
        let current = self.encryption_state();
        if current != EncryptionState::Pending {
            return current;
        }

        let outcome = self.e2ee.secrets().resolve_detailed(&self.peer).await;

        let (settled, transitioned) = {
            let mut state = self.lock();
            let transitioned = state.encryption == EncryptionState::Pending;
            if transitioned {
                state.encryption = match &outcome {
                    Ok(()) => EncryptionState::Ready,
                    Err(e) => EncryptionState::Failed(e.clone()),
                };
            }
            (state.encryption.clone(), transitioned)
        };

        if transitioned {
            match &settled {
                EncryptionState::Ready => {
                    info!(peer = %self.peer, "end-to-end encryption ready");
                    self.events.emit(SessionEvent::EncryptionReady {
                        peer: self.peer.to_string(),
                    });
                }
                EncryptionState::Failed(e) => {
                    warn!(peer = %self.peer, error = %e, "encryption unavailable, messages will be sent in plaintext");
                    self.events.emit(SessionEvent::EncryptionFailed {
                        peer: self.peer.to_string(),
                        reason: e.to_string(),
                    });
                }
                EncryptionState::Pending => {}
            }
            self.refresh_view();
            self.mark_read().await;
        }

        settled
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Fetch the chat, decrypt and merge. Also refreshes operator presence
    /// for user sessions.
    pub async fn poll_once(&self) -> Result<(), ClientError> {
        if let Some(chat_id) = self.chat_id() {
            match self.transport.list_messages(&chat_id).await {
                Ok(raw) => {
                    {
                        let mut state = self.lock();
                        // The chat may have changed while the fetch was out.
                        if state.chat_id.as_deref() == Some(chat_id.as_str()) {
                            state.raw = raw;
                        }
                    }
                    self.refresh_view();
                }
                Err(e) => {
                    warn!(chat_id = %chat_id, error = %e, "poll failed");
                    if e.is_retryable() {
                        self.raise_error("Connection problem, retrying");
                    }
                    return Err(e);
                }
            }
        }

        if self.role == Party::User {
            self.poll_presence().await;
        }
        Ok(())
    }

    /// Rebuild the visible list from the held snapshot. Does nothing while
    /// encryption is pending, so sealed payloads are never shown early.
    fn refresh_view(&self) {
        let count = {
            let mut state = self.lock();
            let ready = match state.encryption {
                EncryptionState::Pending => return,
                EncryptionState::Ready => true,
                EncryptionState::Failed(_) => false,
            };

            let confirmed: Vec<LocalMessage> =
                state.raw.iter().map(|m| self.open_message(m, ready)).collect();
            let seen: HashSet<&str> = confirmed.iter().map(|m| m.id.as_str()).collect();
            let outbox: Vec<LocalMessage> = state
                .outbox
                .iter()
                .filter(|m| !seen.contains(m.id.as_str()))
                .cloned()
                .collect();

            state.messages = merge_messages(confirmed, &outbox);
            state.outbox = outbox;
            state.messages.len()
        };
        self.events.emit(SessionEvent::MessagesUpdated { count });
    }

    /// Open each field on its own; anything that does not open is shown as
    /// received.
    fn open_message(&self, message: &ChatMessage, ready: bool) -> LocalMessage {
        let mut shown_raw = false;

        let text = if ready && !message.text.is_empty() {
            match self.e2ee.open_text_from(&self.peer, &message.text) {
                Ok(text) => text,
                Err(e) => {
                    debug!(id = %message.id, error = %e, "text did not open, showing raw");
                    shown_raw = true;
                    message.text.clone()
                }
            }
        } else {
            message.text.clone()
        };

        let image = message.image_base64.as_ref().map(|blob| {
            if !ready {
                return blob.clone();
            }
            match self.e2ee.open_image_from(&self.peer, blob) {
                Ok(bytes) => BASE64.encode(bytes),
                Err(e) => {
                    debug!(id = %message.id, error = %e, "image did not open, showing raw");
                    shown_raw = true;
                    blob.clone()
                }
            }
        });

        LocalMessage {
            id: message.id.clone(),
            text,
            sender: message.sender,
            timestamp: message.timestamp,
            chat_id: message.chat_id.clone(),
            image,
            pending: false,
            shown_raw,
        }
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Send text and/or an image. Fields that cannot be sealed go out in
    /// plaintext with a fallback event; a relay failure raises the error
    /// banner and drops the optimistic entry.
    pub async fn send(&self, text: &str, image: Option<&[u8]>) -> Result<LocalMessage, ClientError> {
        let text = text.trim();
        if text.is_empty() && image.is_none() {
            return Err(ClientError::Validation {
                reason: "empty_message".into(),
            });
        }

        let ready = self.enter().await == EncryptionState::Ready;

        let wire_text = if ready && !text.is_empty() {
            self.seal_or_fallback("text", || self.e2ee.seal_text_for(&self.peer, text))
                .unwrap_or_else(|| text.to_string())
        } else {
            text.to_string()
        };
        let wire_image = image.map(|bytes| {
            let sealed = if ready {
                self.seal_or_fallback("image", || self.e2ee.seal_image_for(&self.peer, bytes))
            } else {
                None
            };
            sealed.unwrap_or_else(|| BASE64.encode(bytes))
        });

        // Later sends wait here until the first one has adopted its chat.
        let _opening_chat = if self.chat_id().is_none() {
            Some(self.chat_gate.lock().await)
        } else {
            None
        };

        let (message, local, first_user_text) = {
            let mut state = self.lock();
            let chat_id = state.chat_id.clone().unwrap_or_default();
            let message = ChatMessage {
                id: uuid::Uuid::new_v4().to_string(),
                text: wire_text,
                sender: self.role,
                timestamp: now_secs(),
                room: self.room.to_string(),
                chat_id: chat_id.clone(),
                image_base64: wire_image,
            };
            let local = LocalMessage {
                id: message.id.clone(),
                text: text.to_string(),
                sender: self.role,
                timestamp: message.timestamp,
                chat_id,
                image: image.map(|bytes| BASE64.encode(bytes)),
                pending: true,
                shown_raw: false,
            };
            let first_user_text = self.role == Party::User
                && !text.is_empty()
                && !state
                    .messages
                    .iter()
                    .chain(state.outbox.iter())
                    .any(|m| m.sender == Party::User && !m.text.is_empty());
            state.outbox.push(local.clone());
            (message, local, first_user_text)
        };
        self.refresh_view();

        match self.transport.send_message(&message).await {
            Ok(resp) => {
                let confirmed = {
                    let mut state = self.lock();
                    if state.chat_id.is_none() {
                        state.chat_id = Some(resp.chat_id.clone());
                    }
                    let mut confirmed = local.clone();
                    if let Some(entry) = state.outbox.iter_mut().find(|m| m.id == local.id) {
                        entry.pending = false;
                        entry.chat_id = resp.chat_id.clone();
                        confirmed = entry.clone();
                    }
                    confirmed
                };
                self.refresh_view();
                if first_user_text {
                    self.auto_title(resp.chat_id, text);
                }
                Ok(confirmed)
            }
            Err(e) => {
                warn!(error = %e, "send failed");
                self.lock().outbox.retain(|m| m.id != local.id);
                self.refresh_view();
                self.raise_error(if e.is_retryable() {
                    "Failed to send message. Check your connection."
                } else {
                    "Message was rejected by the server."
                });
                Err(e)
            }
        }
    }

    fn seal_or_fallback(
        &self,
        field: &str,
        seal: impl FnOnce() -> Result<String, CryptoError>,
    ) -> Option<String> {
        match seal() {
            Ok(blob) => Some(blob),
            Err(e) => {
                warn!(field, error = %e, "sealing failed, sending plaintext");
                self.events.emit(SessionEvent::EncryptionFallback {
                    field: field.to_string(),
                    reason: e.to_string(),
                });
                None
            }
        }
    }

    /// Name the chat after the user's first text message. Best-effort.
    fn auto_title(&self, chat_id: String, text: &str) {
        let transport = self.transport.clone();
        let title = truncate_title(text);
        tokio::spawn(async move {
            if let Err(e) = transport.rename_chat(&chat_id, &title).await {
                debug!(chat_id = %chat_id, error = %e, "auto title failed");
            }
        });
    }

    /// Open a fresh chat and switch the session to it.
    pub async fn start_new_chat(&self) -> Result<String, ClientError> {
        let chat_id = self.transport.create_chat().await?;
        {
            let mut state = self.lock();
            state.chat_id = Some(chat_id.clone());
            state.raw.clear();
            state.outbox.clear();
        }
        self.refresh_view();
        Ok(chat_id)
    }

    pub async fn mark_read(&self) {
        if let Some(chat_id) = self.chat_id() {
            if let Err(e) = self.transport.mark_read(&chat_id, self.role).await {
                debug!(chat_id = %chat_id, error = %e, "mark read failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Presence
    // ------------------------------------------------------------------

    /// Operator sessions only.
    pub async fn heartbeat_once(&self) {
        if self.role != Party::Operator {
            return;
        }
        if let Err(e) = self
            .transport
            .heartbeat(&self.settings.presence_room, now_secs())
            .await
        {
            debug!(error = %e, "heartbeat failed");
        }
    }

    async fn poll_presence(&self) {
        let online = match self.transport.presence(&self.settings.presence_room).await {
            Ok(Some(last_active)) => now_secs() - last_active < self.settings.presence_window.as_secs_f64(),
            Ok(None) => false,
            Err(e) => {
                debug!(error = %e, "presence check failed");
                return;
            }
        };

        let changed = {
            let mut state = self.lock();
            let changed = state.operator_online != online;
            state.operator_online = online;
            changed
        };
        if changed {
            self.events.emit(SessionEvent::PresenceChanged {
                operator_online: online,
            });
        }
    }

    // ------------------------------------------------------------------
    // Error banner
    // ------------------------------------------------------------------

    fn raise_error(&self, message: &str) {
        let seq = {
            let mut state = self.lock();
            state.banner_seq += 1;
            state.banner = Some(ErrorBanner {
                message: message.to_string(),
                expires_at: Instant::now() + self.settings.error_ttl,
            });
            state.banner_seq
        };
        self.events.emit(SessionEvent::ErrorRaised {
            message: message.to_string(),
        });

        let state = self.state.clone();
        let events = self.events.clone();
        let ttl = self.settings.error_ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let cleared = {
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                // A newer banner owns its own expiry.
                if state.banner_seq == seq && state.banner.is_some() {
                    state.banner = None;
                    true
                } else {
                    false
                }
            };
            if cleared {
                events.emit(SessionEvent::ErrorCleared);
            }
        });
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Enter the chat and start polling (plus the heartbeat for operators).
    pub async fn start(self: &Arc<Self>) -> SessionTasks {
        self.enter().await;
        if let Err(e) = self.poll_once().await {
            debug!(error = %e, "initial poll failed");
        }

        let session = Arc::clone(self);
        let poll = RecurringTask::spawn("poll", self.settings.poll_interval, move || {
            let session = session.clone();
            async move {
                let _ = session.poll_once().await;
            }
        });

        let heartbeat = (self.role == Party::Operator).then(|| {
            let session = Arc::clone(self);
            RecurringTask::spawn("heartbeat", self.settings.heartbeat_interval, move || {
                let session = session.clone();
                async move {
                    session.heartbeat_once().await;
                }
            })
        });

        SessionTasks { poll, heartbeat }
    }
}

/// Merge the relay's messages with local ones by id. Relay copies win,
/// local-only entries are kept, and the result is ordered by timestamp
/// with ties broken by id.
pub fn merge_messages(server: Vec<LocalMessage>, local: &[LocalMessage]) -> Vec<LocalMessage> {
    let known: HashSet<String> = server.iter().map(|m| m.id.clone()).collect();
    let mut merged = server;
    merged.extend(local.iter().filter(|m| !known.contains(&m.id)).cloned());
    merged.sort_by(|a, b| {
        a.timestamp
            .total_cmp(&b.timestamp)
            .then_with(|| a.id.cmp(&b.id))
    });
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::MemorySecretStorage;
    use crate::secrets::testing::MockDirectory;
    use parley_shared::protocol::SendMessageResponse;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const USER: &str = "u@example.com";
    const OPERATOR: &str = "admin@example.com";

    #[derive(Default)]
    struct MockRelay {
        messages: Mutex<Vec<ChatMessage>>,
        renames: Mutex<Vec<(String, String)>>,
        reads: Mutex<Vec<(String, Party)>>,
        heartbeats: Mutex<Vec<(String, f64)>>,
        fail_sends: AtomicBool,
        created: AtomicUsize,
        opened_by_send: AtomicUsize,
        send_delay: Mutex<Duration>,
    }

    impl RelayTransport for MockRelay {
        async fn create_chat(&self) -> Result<String, ClientError> {
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(format!("chat-{n}"))
        }

        async fn send_message(&self, message: &ChatMessage) -> Result<SendMessageResponse, ClientError> {
            let delay = *self.send_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(ClientError::Network("connection reset".into()));
            }
            let mut stored = message.clone();
            if stored.chat_id.is_empty() {
                self.opened_by_send.fetch_add(1, Ordering::SeqCst);
                stored.chat_id = "chat-auto".into();
            }
            let response = SendMessageResponse {
                status: "sent".into(),
                id: stored.id.clone(),
                chat_id: stored.chat_id.clone(),
                duplicate: false,
            };
            self.messages.lock().unwrap().push(stored);
            Ok(response)
        }

        async fn list_messages(&self, chat_id: &str) -> Result<Vec<ChatMessage>, ClientError> {
            let mut found: Vec<ChatMessage> = self
                .messages
                .lock()
                .unwrap()
                .iter()
                .filter(|m| m.chat_id == chat_id)
                .cloned()
                .collect();
            found.sort_by(|a, b| b.timestamp.total_cmp(&a.timestamp));
            Ok(found)
        }

        async fn rename_chat(&self, chat_id: &str, title: &str) -> Result<String, ClientError> {
            self.renames
                .lock()
                .unwrap()
                .push((chat_id.to_string(), title.to_string()));
            Ok(title.to_string())
        }

        async fn mark_read(&self, chat_id: &str, as_party: Party) -> Result<(), ClientError> {
            self.reads.lock().unwrap().push((chat_id.to_string(), as_party));
            Ok(())
        }

        async fn heartbeat(&self, room: &str, last_active: f64) -> Result<(), ClientError> {
            self.heartbeats
                .lock()
                .unwrap()
                .push((room.to_string(), last_active));
            Ok(())
        }

        async fn presence(&self, room: &str) -> Result<Option<f64>, ClientError> {
            Ok(self
                .heartbeats
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(r, _)| r == room)
                .map(|(_, t)| *t))
        }
    }

    type Session = ChatSession<MockRelay, MockDirectory>;

    struct Fixture {
        relay: Arc<MockRelay>,
        user: Arc<E2eeContext<MockDirectory>>,
        operator: Arc<E2eeContext<MockDirectory>>,
    }

    impl Fixture {
        /// `publish` controls which parties have a key in the directory.
        fn new(publish_user: bool, publish_operator: bool) -> Self {
            let directory = Arc::new(MockDirectory::default());
            let make = |name: &str, publish: bool| {
                let ctx = Arc::new(E2eeContext::new(
                    Identity::from_email(name),
                    Arc::new(MemorySecretStorage::default()),
                    directory.clone(),
                    Duration::from_secs(1),
                ));
                ctx.keystore().ensure_key_pair().unwrap();
                if publish {
                    directory.keys.lock().unwrap().insert(
                        ctx.identity().clone(),
                        ctx.keystore().public_key_encoded().unwrap(),
                    );
                }
                ctx
            };
            Self {
                relay: Arc::new(MockRelay::default()),
                user: make(USER, publish_user),
                operator: make(OPERATOR, publish_operator),
            }
        }

        fn user_session(&self, chat_id: Option<&str>, settings: SessionSettings) -> Session {
            ChatSession::for_user(
                self.relay.clone(),
                self.user.clone(),
                Identity::from_email(OPERATOR),
                chat_id.map(String::from),
                settings,
            )
        }

        fn operator_session(&self, chat_id: Option<&str>) -> Session {
            ChatSession::for_operator(
                self.relay.clone(),
                self.operator.clone(),
                Identity::from_email(USER),
                chat_id.map(String::from),
                SessionSettings::default(),
            )
        }
    }

    fn message(id: &str, ts: f64, pending: bool) -> LocalMessage {
        LocalMessage {
            id: id.into(),
            text: format!("text {id}"),
            sender: Party::User,
            timestamp: ts,
            chat_id: "c".into(),
            image: None,
            pending,
            shown_raw: false,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_merge_prefers_server_and_keeps_pending() {
        let mut server_copy = message("b", 2.0, false);
        server_copy.text = "from server".into();
        let server = vec![message("c", 3.0, false), server_copy];
        let local = vec![message("b", 2.0, true), message("a", 1.0, true), message("d", 3.0, true)];

        let merged = merge_messages(server, &local);
        let ids: Vec<&str> = merged.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c", "d"]);
        assert_eq!(merged[1].text, "from server");
        assert!(!merged[1].pending);
        assert!(merged[0].pending);
    }

    #[tokio::test]
    async fn test_operator_message_before_resolution_is_not_lost() {
        let fx = Fixture::new(true, true);

        let operator = fx.operator_session(None);
        let sent = operator.send("Hello from support", None).await.unwrap();
        assert_eq!(sent.chat_id, "chat-auto");
        assert_ne!(fx.relay.messages.lock().unwrap()[0].text, "Hello from support");

        let user = fx.user_session(Some("chat-auto"), SessionSettings::default());
        user.poll_once().await.unwrap();
        assert_eq!(user.encryption_state(), EncryptionState::Pending);
        assert!(user.messages().is_empty());

        assert_eq!(user.enter().await, EncryptionState::Ready);
        let shown = user.messages();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].text, "Hello from support");
        assert_eq!(shown[0].sender, Party::Operator);
        assert!(!shown[0].shown_raw);

        let reads = fx.relay.reads.lock().unwrap().clone();
        assert!(reads.contains(&("chat-auto".to_string(), Party::User)));
    }

    #[tokio::test]
    async fn test_failed_setup_is_terminal_and_visible() {
        let fx = Fixture::new(true, false);
        let user = fx.user_session(None, SessionSettings::default());
        let mut events = user.events().subscribe();

        assert_eq!(
            user.enter().await,
            EncryptionState::Failed(CryptoError::PeerKeyNotFound)
        );

        let mut warned = false;
        while let Ok(event) = events.try_recv() {
            warned |= matches!(event, SessionEvent::EncryptionFailed { .. });
        }
        assert!(warned);

        user.send("plain hello", None).await.unwrap();
        assert_eq!(fx.relay.messages.lock().unwrap()[0].text, "plain hello");

        // Publishing the key later does not reopen a settled session.
        fx.operator.publish_key().await.unwrap();
        assert!(matches!(user.enter().await, EncryptionState::Failed(_)));

        user.poll_once().await.unwrap();
        assert_eq!(user.messages()[0].text, "plain hello");
    }

    #[tokio::test]
    async fn test_undecryptable_payload_is_shown_raw() {
        let fx = Fixture::new(true, true);
        let operator = fx.operator_session(Some("c1"));
        operator.send("sealed fine", None).await.unwrap();

        let tampered = BASE64.encode([0u8; 40]);
        fx.relay.messages.lock().unwrap().push(ChatMessage {
            id: "bad".into(),
            text: tampered.clone(),
            sender: Party::Operator,
            timestamp: now_secs() + 1.0,
            room: USER.into(),
            chat_id: "c1".into(),
            image_base64: None,
        });

        let user = fx.user_session(Some("c1"), SessionSettings::default());
        user.enter().await;
        user.poll_once().await.unwrap();

        let shown = user.messages();
        assert_eq!(shown.len(), 2);
        assert_eq!(shown[0].text, "sealed fine");
        assert!(!shown[0].shown_raw);
        assert_eq!(shown[1].text, tampered);
        assert!(shown[1].shown_raw);
    }

    #[tokio::test]
    async fn test_images_are_sealed_separately() {
        let fx = Fixture::new(true, true);
        let operator = fx.operator_session(Some("c1"));
        let image = [1u8, 2, 3, 4, 5];
        operator.send("", Some(&image[..])).await.unwrap();

        let stored = fx.relay.messages.lock().unwrap()[0].clone();
        assert!(stored.text.is_empty());
        assert_ne!(stored.image_base64.as_deref(), Some(BASE64.encode(image).as_str()));

        let user = fx.user_session(Some("c1"), SessionSettings::default());
        user.enter().await;
        user.poll_once().await.unwrap();
        assert_eq!(user.messages()[0].image.as_deref(), Some(BASE64.encode(image).as_str()));
    }

    #[tokio::test]
    async fn test_send_failure_raises_expiring_banner() {
        let fx = Fixture::new(true, true);
        fx.relay.fail_sends.store(true, Ordering::SeqCst);
        let settings = SessionSettings {
            error_ttl: Duration::from_millis(30),
            ..SessionSettings::default()
        };
        let user = fx.user_session(None, settings);
        let mut events = user.events().subscribe();

        let err = user.send("hello", None).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(user.error().is_some());
        assert!(user.messages().is_empty());

        wait_until(|| user.error().is_none()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut cleared = false;
        while let Ok(event) = events.try_recv() {
            cleared |= event == SessionEvent::ErrorCleared;
        }
        assert!(cleared);
    }

    #[tokio::test]
    async fn test_first_user_message_titles_chat() {
        let fx = Fixture::new(true, true);
        let user = fx.user_session(None, SessionSettings::default());

        let sent = user
            .send("This is a very long chat title that exceeds the limit", None)
            .await
            .unwrap();
        assert!(!sent.pending);
        assert_eq!(user.chat_id().as_deref(), Some("chat-auto"));

        let relay = fx.relay.clone();
        wait_until(|| !relay.renames.lock().unwrap().is_empty()).await;

        user.send("second message", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let renames = fx.relay.renames.lock().unwrap().clone();
        assert_eq!(
            renames,
            vec![("chat-auto".to_string(), "This is a very long chat ...".to_string())]
        );
    }

    #[tokio::test]
    async fn test_concurrent_first_sends_open_one_chat() {
        let fx = Fixture::new(true, true);
        *fx.relay.send_delay.lock().unwrap() = Duration::from_millis(20);
        let user = fx.user_session(None, SessionSettings::default());

        let (one, two) = tokio::join!(user.send("one", None), user.send("two", None));
        assert_eq!(one.unwrap().chat_id, "chat-auto");
        assert_eq!(two.unwrap().chat_id, "chat-auto");
        assert_eq!(fx.relay.opened_by_send.load(Ordering::SeqCst), 1);

        let stored = fx.relay.messages.lock().unwrap().clone();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|m| m.chat_id == "chat-auto"));

        user.poll_once().await.unwrap();
        let shown = user.messages();
        assert_eq!(shown.len(), 2);
        assert!(shown.iter().all(|m| !m.pending));
    }

    #[tokio::test]
    async fn test_seal_failure_falls_back_per_field() {
        let fx = Fixture::new(true, true);
        let user = fx.user_session(None, SessionSettings::default());
        assert_eq!(user.enter().await, EncryptionState::Ready);
        let mut events = user.events().subscribe();

        fx.user.secrets().clear();
        user.send("sent in the clear", None).await.unwrap();

        assert_eq!(fx.relay.messages.lock().unwrap()[0].text, "sent in the clear");
        assert_eq!(user.encryption_state(), EncryptionState::Ready);

        let mut fallback = None;
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::EncryptionFallback { field, .. } = event {
                fallback = Some(field);
            }
        }
        assert_eq!(fallback.as_deref(), Some("text"));
    }

    #[tokio::test]
    async fn test_empty_send_rejected() {
        let fx = Fixture::new(true, true);
        let user = fx.user_session(None, SessionSettings::default());
        assert!(matches!(
            user.send("   ", None).await,
            Err(ClientError::Validation { .. })
        ));
        assert!(fx.relay.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_operator_presence_from_heartbeat() {
        let fx = Fixture::new(true, true);
        let operator = fx.operator_session(None);
        let user = fx.user_session(None, SessionSettings::default());

        user.poll_once().await.unwrap();
        assert!(!user.operator_online());

        operator.heartbeat_once().await;
        user.heartbeat_once().await;
        assert_eq!(fx.relay.heartbeats.lock().unwrap().len(), 1);

        user.poll_once().await.unwrap();
        assert!(user.operator_online());
    }

    #[tokio::test]
    async fn test_start_polls_in_background() {
        let fx = Fixture::new(true, true);
        let settings = SessionSettings {
            poll_interval: Duration::from_millis(10),
            ..SessionSettings::default()
        };
        let user = Arc::new(fx.user_session(Some("c1"), settings));
        let tasks = user.start().await;
        assert!(tasks.heartbeat.is_none());
        assert_eq!(user.encryption_state(), EncryptionState::Ready);

        fx.operator_session(Some("c1")).send("ping", None).await.unwrap();
        let watched = user.clone();
        wait_until(|| !watched.messages().is_empty()).await;
        assert_eq!(user.messages()[0].text, "ping");

        drop(tasks);
    }

    #[tokio::test]
    async fn test_new_chat_resets_view() {
        let fx = Fixture::new(true, true);
        let user = fx.user_session(None, SessionSettings::default());
        user.send("first", None).await.unwrap();
        assert_eq!(user.messages().len(), 1);

        let chat_id = user.start_new_chat().await.unwrap();
        assert_eq!(user.chat_id(), Some(chat_id));
        assert!(user.messages().is_empty());
    }
}
