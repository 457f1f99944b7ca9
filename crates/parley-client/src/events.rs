use serde::Serialize;
use tokio::sync::broadcast;

pub const EVENT_ENCRYPTION_READY: &str = "encryption-ready";
pub const EVENT_ENCRYPTION_FAILED: &str = "encryption-failed";
pub const EVENT_ENCRYPTION_FALLBACK: &str = "encryption-fallback";
pub const EVENT_MESSAGES_UPDATED: &str = "messages-updated";
pub const EVENT_ERROR_RAISED: &str = "error-raised";
pub const EVENT_ERROR_CLEARED: &str = "error-cleared";
pub const EVENT_PRESENCE_CHANGED: &str = "presence-changed";

/// What a chat session reports to whoever renders it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum SessionEvent {
    EncryptionReady { peer: String },
    /// Session continues in plaintext. Must be shown to the user.
    EncryptionFailed { peer: String, reason: String },
    /// One outbound field went out unencrypted.
    EncryptionFallback { field: String, reason: String },
    MessagesUpdated { count: usize },
    ErrorRaised { message: String },
    ErrorCleared,
    PresenceChanged { operator_online: bool },
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::EncryptionReady { .. } => EVENT_ENCRYPTION_READY,
            SessionEvent::EncryptionFailed { .. } => EVENT_ENCRYPTION_FAILED,
            SessionEvent::EncryptionFallback { .. } => EVENT_ENCRYPTION_FALLBACK,
            SessionEvent::MessagesUpdated { .. } => EVENT_MESSAGES_UPDATED,
            SessionEvent::ErrorRaised { .. } => EVENT_ERROR_RAISED,
            SessionEvent::ErrorCleared => EVENT_ERROR_CLEARED,
            SessionEvent::PresenceChanged { .. } => EVENT_PRESENCE_CHANGED,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SessionEvent) {
        let name = event.name();
        if self.tx.send(event).is_err() {
            tracing::trace!(event = name, "no listeners");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
