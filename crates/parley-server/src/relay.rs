//! Relay rules: who may act on which chat, what a valid message looks like,
//! and how stored records map onto response bodies.
//!
//! The relay never interprets `text` or `image_base64`; both are opaque
//! strings that are ciphertext whenever the sender had encryption ready.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::Mutex;

use parley_shared::constants::{
    DEFAULT_CHAT_TITLE, DEFAULT_PAGE_SIZE, MAX_IMAGE_ENCODED_LEN, MAX_PAGE_SIZE,
    MAX_PUBLIC_KEY_LEN, MAX_TEXT_CHARS, MAX_TITLE_CHARS,
};
use parley_shared::envelope::Fields;
use parley_shared::keys::{decode_public_key, fingerprint};
use parley_shared::protocol::{
    AdminChat, AdminChatsResponse, AdminUser, ChatListResponse, ChatMessage, ChatSummary,
    CreateChatResponse, PublicKeyRecord, SendMessageResponse, TitleResponse,
};
use parley_shared::types::{now_secs, truncate_title, Identity, Party};
use parley_store::{Chat, ChatActivity, Database, ErasureReport, InsertOutcome, StoreError};

use crate::error::{ServerError, ValidationError};
use crate::push::{self, PushNotification, SharedNotifier};
use crate::rate_limit::RateLimiter;

const MAX_DEVICE_TOKEN_LEN: usize = 4096;
const MAX_NICKNAME_CHARS: usize = 100;

/// Which messages a listing covers.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageScope {
    Chat(String),
    Room(String),
    Everything,
}

impl MessageScope {
    /// `chatId` wins over `room`; empty values count as absent.
    pub fn from_query(chat_id: Option<&str>, room: Option<&str>) -> Self {
        let present = |v: Option<&str>| v.map(str::trim).filter(|v| !v.is_empty()).map(String::from);
        match (present(chat_id), present(room)) {
            (Some(chat_id), _) => MessageScope::Chat(chat_id),
            (None, Some(room)) => MessageScope::Room(room),
            (None, None) => MessageScope::Everything,
        }
    }
}

pub struct Relay {
    db: Mutex<Database>,
    operator: Identity,
    notifier: SharedNotifier,
    send_limiter: RateLimiter<Identity>,
}

impl Relay {
    pub fn new(
        db: Database,
        operator: Identity,
        notifier: SharedNotifier,
        send_limiter: RateLimiter<Identity>,
    ) -> Self {
        Self {
            db: Mutex::new(db),
            operator,
            notifier,
            send_limiter,
        }
    }

    pub fn is_operator(&self, identity: &Identity) -> bool {
        *identity == self.operator
    }

    fn require_operator(&self, requester: &Identity, action: &str) -> Result<(), ServerError> {
        if self.is_operator(requester) {
            Ok(())
        } else {
            Err(ServerError::Forbidden(format!("{action} is reserved for the operator")))
        }
    }

    /// The ownership gate in front of every chat-scoped operation. Unknown
    /// chats are denied the same way as foreign ones.
    fn authorize_chat(
        &self,
        db: &Database,
        chat_id: &str,
        requester: &Identity,
    ) -> Result<Chat, ServerError> {
        let chat = match db.get_chat(chat_id) {
            Ok(chat) => chat,
            Err(StoreError::NotFound) => {
                tracing::debug!(chat_id, requester = %requester, "chat not found");
                return Err(ServerError::OwnershipDenied);
            }
            Err(e) => return Err(e.into()),
        };

        if chat.owner == *requester || self.is_operator(requester) || self.is_operator(&chat.owner) {
            Ok(chat)
        } else {
            tracing::warn!(chat_id, requester = %requester, "ownership check failed");
            Err(ServerError::OwnershipDenied)
        }
    }

    fn new_chat(owner: Identity) -> Chat {
        Chat {
            chat_id: uuid::Uuid::new_v4().to_string(),
            owner,
            title: DEFAULT_CHAT_TITLE.to_string(),
            created_at: now_secs(),
            deleted_by_user: false,
            operator_last_read: 0.0,
            user_last_read: 0.0,
        }
    }

    // ------------------------------------------------------------------
    // Chats
    // ------------------------------------------------------------------

    pub async fn create_chat(&self, owner: &Identity) -> Result<CreateChatResponse, ServerError> {
        let chat = Self::new_chat(owner.clone());
        self.db.lock().await.create_chat(&chat)?;
        tracing::info!(chat_id = %chat.chat_id, owner = %owner, "chat created");

        Ok(CreateChatResponse {
            chat_id: chat.chat_id,
            title: chat.title,
            user_email: chat.owner,
            created_at: chat.created_at,
        })
    }

    pub async fn list_chats(&self, requester: &Identity) -> Result<ChatListResponse, ServerError> {
        let activity = self.db.lock().await.chats_for_owner(requester)?;
        let party = self.party_of(requester);
        let chats = activity
            .into_iter()
            .map(|a| ChatSummary {
                is_unread: a.is_unread_for(party),
                chat_id: a.chat.chat_id,
                user_email: a.chat.owner,
                title: a.chat.title,
                created_at: a.chat.created_at,
                deleted_by_user: a.chat.deleted_by_user,
                message_count: a.message_count,
                latest_message_timestamp: a.latest_message,
            })
            .collect();
        Ok(ChatListResponse { chats })
    }

    pub async fn soft_delete_chat(
        &self,
        requester: &Identity,
        chat_id: &str,
    ) -> Result<(), ServerError> {
        let db = self.db.lock().await;
        self.authorize_chat(&db, chat_id, requester)?;
        db.soft_delete_chat(chat_id)?;
        tracing::info!(chat_id, requester = %requester, "chat soft-deleted");
        Ok(())
    }

    /// Accepts up to 100 characters and stores the display form.
    pub async fn rename_chat(
        &self,
        requester: &Identity,
        chat_id: &str,
        title: &str,
    ) -> Result<TitleResponse, ServerError> {
        if title.trim().is_empty() {
            return Err(ValidationError::InvalidTitle.into());
        }
        if title.chars().count() > MAX_TITLE_CHARS {
            return Err(ValidationError::TitleTooLong.into());
        }

        let db = self.db.lock().await;
        self.authorize_chat(&db, chat_id, requester)?;
        let display = truncate_title(title);
        db.set_chat_title(chat_id, &display)?;

        Ok(TitleResponse {
            status: "updated".into(),
            title: display,
        })
    }

    /// Move `as_party`'s read marker to now. Only the operator may write the
    /// operator marker.
    pub async fn mark_read(
        &self,
        requester: &Identity,
        chat_id: &str,
        as_party: Party,
    ) -> Result<(), ServerError> {
        if as_party.is_operator() {
            self.require_operator(requester, "Marking operator reads")?;
        }
        let db = self.db.lock().await;
        self.authorize_chat(&db, chat_id, requester)?;
        db.mark_chat_read(chat_id, as_party, now_secs())?;
        Ok(())
    }

    /// Every chat grouped by owner, most recently active owner first.
    pub async fn admin_chats(&self, requester: &Identity) -> Result<AdminChatsResponse, ServerError> {
        self.require_operator(requester, "The dashboard")?;

        let (activity, nicknames) = {
            let db = self.db.lock().await;
            (db.all_chat_activity()?, db.nicknames()?)
        };

        let mut groups: BTreeMap<Identity, AdminUser> = BTreeMap::new();
        for a in activity {
            let latest = latest_activity(&a);
            let group = groups.entry(a.chat.owner.clone()).or_insert_with(|| AdminUser {
                nickname: nicknames.get(&a.chat.owner).cloned().unwrap_or_default(),
                user_email: a.chat.owner.clone(),
                latest_activity: 0.0,
                chats: Vec::new(),
            });
            group.latest_activity = group.latest_activity.max(latest);
            group.chats.push(AdminChat {
                is_unread: a.is_unread_for(Party::Operator),
                chat_id: a.chat.chat_id,
                title: a.chat.title,
                created_at: a.chat.created_at,
                deleted_by_user: a.chat.deleted_by_user,
                latest_message_timestamp: a.latest_message,
                message_count: a.message_count,
            });
        }

        let mut users: Vec<AdminUser> = groups.into_values().collect();
        users.sort_by(|a, b| b.latest_activity.total_cmp(&a.latest_activity));
        Ok(AdminChatsResponse { users })
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// Validate, authorize and store one message. A missing `chatId` opens a
    /// new chat owned by the message's room.
    pub async fn append_message(
        &self,
        requester: &Identity,
        document_id: Option<&str>,
        fields: &Fields,
    ) -> Result<SendMessageResponse, ServerError> {
        let text = fields.text().unwrap_or_default();
        let image = fields.image_base64();

        if text.is_empty() && image.is_none() {
            return Err(ValidationError::EmptyMessage.into());
        }
        if text.chars().count() > MAX_TEXT_CHARS {
            return Err(ValidationError::TextTooLong.into());
        }
        if image.is_some_and(|img| img.len() > MAX_IMAGE_ENCODED_LEN) {
            return Err(ValidationError::ImageTooLarge.into());
        }
        let (Some(timestamp), Some(room)) = (fields.timestamp(), fields.room()) else {
            return Err(ValidationError::MissingFields.into());
        };
        let room = Identity::from_email(room);
        if room.is_empty() || !timestamp.is_finite() {
            return Err(ValidationError::MissingFields.into());
        }

        let sender = Party::from_operator_flag(fields.is_operator());
        if !self.is_operator(requester) {
            if sender.is_operator() {
                return Err(ServerError::Forbidden(
                    "Only the operator can send operator messages".into(),
                ));
            }
            if room != *requester {
                return Err(ServerError::Forbidden(
                    "Cannot post into another user's room".into(),
                ));
            }
        }

        if !self.send_limiter.check(requester.clone()).await {
            tracing::warn!(requester = %requester, "message rate limit exceeded");
            return Err(ServerError::RateLimited);
        }

        let supplied_id = document_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(String::from);
        let id = supplied_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut db = self.db.lock().await;

        let mut requested_chat = fields
            .chat_id()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(String::from);
        // A retried first message carries no chatId; it belongs to the chat
        // the original delivery opened.
        if requested_chat.is_none() && supplied_id.is_some() {
            match db.get_message(&id) {
                Ok(existing) => requested_chat = Some(existing.chat_id),
                Err(StoreError::NotFound) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let mut message = ChatMessage {
            id,
            text: text.to_string(),
            sender,
            timestamp,
            room: room.to_string(),
            chat_id: String::new(),
            image_base64: image.map(String::from),
        };

        let outcome = match requested_chat {
            Some(chat_id) => {
                let chat = self.authorize_chat(&db, &chat_id, requester)?;
                if !self.is_operator(&chat.owner) && chat.owner != room {
                    return Err(ValidationError::RoomMismatch.into());
                }
                message.chat_id = chat.chat_id;
                db.insert_message(&message)?
            }
            None => {
                let chat = Self::new_chat(room.clone());
                message.chat_id = chat.chat_id.clone();
                db.insert_message_with_chat(&chat, &message)?;
                tracing::info!(chat_id = %chat.chat_id, owner = %room, "chat opened by first message");
                InsertOutcome::Inserted
            }
        };
        let duplicate = outcome == InsertOutcome::Duplicate;

        if !duplicate {
            tracing::debug!(
                id = %message.id,
                chat_id = %message.chat_id,
                sender = ?message.sender,
                has_image = message.image_base64.is_some(),
                "message stored"
            );
            let recipient = if sender.is_operator() {
                room.clone()
            } else {
                self.operator.clone()
            };
            let body = if sender.is_operator() {
                "New message from support".to_string()
            } else {
                format!("{room}: New message")
            };
            self.notify(&db, recipient, body);
        }

        Ok(SendMessageResponse {
            status: "sent".into(),
            id: message.id,
            chat_id: message.chat_id,
            duplicate,
        })
    }

    fn notify(&self, db: &Database, recipient: Identity, body: String) {
        match db.get_device_token(&recipient) {
            Ok(Some(device_token)) => push::dispatch(
                &self.notifier,
                PushNotification {
                    device_token,
                    recipient,
                    title: "Support".into(),
                    body,
                },
            ),
            Ok(None) => tracing::debug!(recipient = %recipient, "no device registered"),
            Err(e) => tracing::warn!(recipient = %recipient, error = %e, "device lookup failed"),
        }
    }

    /// Newest first, capped at 500.
    pub async fn list_messages(
        &self,
        requester: &Identity,
        scope: &MessageScope,
        page_size: Option<u32>,
    ) -> Result<Vec<ChatMessage>, ServerError> {
        let limit = match page_size {
            Some(0) | None => DEFAULT_PAGE_SIZE,
            Some(n) => n.min(MAX_PAGE_SIZE),
        };

        let db = self.db.lock().await;
        let messages = match scope {
            MessageScope::Chat(chat_id) => {
                self.authorize_chat(&db, chat_id, requester)?;
                db.messages_for_chat(chat_id, limit)?
            }
            MessageScope::Room(room) => {
                let room = Identity::from_email(room);
                if !self.is_operator(requester) && room != *requester {
                    return Err(ServerError::OwnershipDenied);
                }
                db.messages_for_room(room.as_str(), limit)?
            }
            MessageScope::Everything => {
                if !self.is_operator(requester) {
                    return Err(ValidationError::MissingChatScope.into());
                }
                db.recent_messages(limit)?
            }
        };
        Ok(messages)
    }

    /// Every stored message, oldest first.
    pub async fn export(&self, requester: &Identity) -> Result<Vec<ChatMessage>, ServerError> {
        self.require_operator(requester, "Export")?;
        let messages = self.db.lock().await.all_messages()?;
        tracing::info!(count = messages.len(), "messages exported");
        Ok(messages)
    }

    // ------------------------------------------------------------------
    // Directory
    // ------------------------------------------------------------------

    pub async fn publish_key(&self, requester: &Identity, public_key: &str) -> Result<(), ServerError> {
        let public_key = public_key.trim();
        if public_key.is_empty() || public_key.len() > MAX_PUBLIC_KEY_LEN {
            return Err(ValidationError::InvalidPublicKey.into());
        }
        let decoded =
            decode_public_key(public_key).map_err(|_| ValidationError::InvalidPublicKey)?;

        self.db
            .lock()
            .await
            .upsert_public_key(requester, public_key, now_secs())?;
        tracing::info!(identity = %requester, fingerprint = %fingerprint(&decoded), "public key published");
        Ok(())
    }

    /// Readable by the key's owner, by the operator, and by anyone when the
    /// key is the operator's.
    pub async fn fetch_key(
        &self,
        requester: &Identity,
        target: &Identity,
    ) -> Result<PublicKeyRecord, ServerError> {
        if !(self.is_operator(requester) || self.is_operator(target) || requester == target) {
            return Err(ServerError::Forbidden("Not allowed to read this key".into()));
        }
        let public_key = self
            .db
            .lock()
            .await
            .get_public_key(target)?
            .ok_or_else(|| ServerError::NotFound("Key not found".into()))?;

        Ok(PublicKeyRecord {
            email: target.clone(),
            public_key,
        })
    }

    pub async fn register_device(&self, requester: &Identity, token: &str) -> Result<(), ServerError> {
        let token = token.trim();
        if token.is_empty() || token.len() > MAX_DEVICE_TOKEN_LEN {
            return Err(ValidationError::MissingDeviceToken.into());
        }
        self.db
            .lock()
            .await
            .upsert_device_token(requester, token, now_secs())?;
        tracing::debug!(identity = %requester, "device token registered");
        Ok(())
    }

    pub async fn set_nickname(&self, requester: &Identity, nickname: &str) -> Result<(), ServerError> {
        let nickname = nickname.trim();
        if nickname.is_empty() || nickname.chars().count() > MAX_NICKNAME_CHARS {
            return Err(ValidationError::InvalidNickname.into());
        }
        self.db.lock().await.set_nickname(requester, nickname)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Presence
    // ------------------------------------------------------------------

    pub async fn heartbeat(
        &self,
        requester: &Identity,
        room: &str,
        last_active: Option<f64>,
    ) -> Result<f64, ServerError> {
        self.require_operator(requester, "Heartbeat")?;
        let last_active = last_active
            .filter(|t| t.is_finite())
            .ok_or(ValidationError::MissingLastActive)?;
        self.db.lock().await.record_heartbeat(room, last_active)?;
        Ok(last_active)
    }

    pub async fn presence(&self, room: &str) -> Result<Option<f64>, ServerError> {
        Ok(self.db.lock().await.last_active(room)?)
    }

    // ------------------------------------------------------------------
    // Account & maintenance
    // ------------------------------------------------------------------

    pub async fn erase_account(&self, requester: &Identity) -> Result<ErasureReport, ServerError> {
        Ok(self.db.lock().await.erase_account(requester)?)
    }

    /// Drop chats that never received a message within `grace`.
    pub async fn purge_empty_chats(&self, grace: Duration) -> Result<usize, ServerError> {
        let cutoff = now_secs() - grace.as_secs_f64();
        let removed = self.db.lock().await.purge_empty_chats(cutoff)?;
        if removed > 0 {
            tracing::info!(removed, "purged empty chats");
        }
        Ok(removed)
    }

    pub async fn rate_limiter_maintenance(&self, max_idle_secs: f64) {
        self.send_limiter.purge_stale(max_idle_secs).await;
    }

    fn party_of(&self, identity: &Identity) -> Party {
        Party::from_operator_flag(self.is_operator(identity))
    }
}

fn latest_activity(a: &ChatActivity) -> f64 {
    a.latest_message.max(a.chat.created_at)
}
