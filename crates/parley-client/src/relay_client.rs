//! HTTP client for the relay API.

use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use parley_shared::envelope::{Document, DocumentList};
use parley_shared::protocol::{
    AdminChatsResponse, ChatListResponse, ChatMessage, ChatSummary, CreateChatResponse,
    DeviceRegistration, ErrorBody, NicknameRequest, PublicKeyRecord, PublicKeyUpload,
    SendMessageResponse, StatusResponse, TitleRequest, TitleResponse,
};
use parley_shared::types::{Identity, Party};

use crate::config::ClientConfig;
use crate::directory::KeyDirectory;
use crate::error::ClientError;
use crate::transport::RelayTransport;

#[derive(Debug, Clone)]
pub struct RelayClient {
    http: reqwest::Client,
    base_url: Url,
    token: String,
}

impl RelayClient {
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let base_url = Url::parse(&config.server_url)
            .map_err(|e| ClientError::InvalidConfig(format!("server url: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ClientError::InvalidConfig("server url cannot be a base".into()));
        }
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ClientError::InvalidConfig(e.to_string()))?;

        Ok(Self {
            http,
            base_url,
            token: config.token.clone(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        self.http
            .request(method, self.endpoint(segments))
            .bearer_auth(&self.token)
    }

    async fn send_json<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, ClientError> {
        let resp = check(req.send().await?).await?;
        Ok(resp.json::<T>().await?)
    }

    async fn send_with_body<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        req: RequestBuilder,
        body: &B,
    ) -> Result<T, ClientError> {
        self.send_json(req.json(body)).await
    }

    // ------------------------------------------------------------------
    // Calls outside the session's transport surface
    // ------------------------------------------------------------------

    pub async fn list_chats(&self) -> Result<Vec<ChatSummary>, ClientError> {
        let list: ChatListResponse = self.send_json(self.request(Method::GET, &["chats"])).await?;
        Ok(list.chats)
    }

    pub async fn admin_chats(&self) -> Result<AdminChatsResponse, ClientError> {
        self.send_json(self.request(Method::GET, &["chats", "all"])).await
    }

    pub async fn soft_delete_chat(&self, chat_id: &str) -> Result<(), ClientError> {
        let _: StatusResponse = self
            .send_json(self.request(Method::PATCH, &["chats", chat_id, "delete"]))
            .await?;
        Ok(())
    }

    pub async fn register_device(&self, token: &str) -> Result<(), ClientError> {
        let body = DeviceRegistration {
            token: token.to_string(),
        };
        let _: StatusResponse = self
            .send_with_body(self.request(Method::POST, &["register-device"]), &body)
            .await?;
        Ok(())
    }

    pub async fn set_nickname(&self, nickname: &str) -> Result<(), ClientError> {
        let body = NicknameRequest {
            nickname: nickname.to_string(),
        };
        let _: StatusResponse = self
            .send_with_body(self.request(Method::POST, &["user", "nickname"]), &body)
            .await?;
        Ok(())
    }

    pub async fn delete_account(&self) -> Result<(), ClientError> {
        let _: serde_json::Value = self
            .send_json(self.request(Method::DELETE, &["account"]))
            .await?;
        Ok(())
    }
}

/// Turn a non-2xx response into a typed error.
async fn check(resp: Response) -> Result<Response, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.json::<ErrorBody>().await.ok();
    Err(error_from_status(status, body))
}

fn error_from_status(status: StatusCode, body: Option<ErrorBody>) -> ClientError {
    match status {
        StatusCode::FORBIDDEN => ClientError::OwnershipDenied,
        StatusCode::BAD_REQUEST => ClientError::Validation {
            reason: body
                .and_then(|b| b.reason)
                .unwrap_or_else(|| "bad_request".to_string()),
        },
        _ => ClientError::Status {
            status: status.as_u16(),
            message: body
                .map(|b| b.error)
                .unwrap_or_else(|| status.to_string()),
        },
    }
}

/// Decode a listing, skipping documents that do not form a message.
fn messages_from(list: DocumentList) -> Vec<ChatMessage> {
    list.documents
        .iter()
        .filter_map(|doc| match doc.to_message() {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(error = %e, "skipping malformed document");
                None
            }
        })
        .collect()
}

impl KeyDirectory for RelayClient {
    async fn publish(&self, public_key: &str) -> Result<(), ClientError> {
        let body = PublicKeyUpload {
            public_key: public_key.to_string(),
        };
        let _: StatusResponse = self
            .send_with_body(self.request(Method::PUT, &["keys"]), &body)
            .await?;
        debug!("public key published");
        Ok(())
    }

    async fn fetch(&self, peer: &Identity) -> Result<Option<String>, ClientError> {
        let resp = self
            .request(Method::GET, &["keys", peer.as_str()])
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let record: PublicKeyRecord = check(resp).await?.json().await?;
        Ok(Some(record.public_key))
    }
}

impl RelayTransport for RelayClient {
    async fn create_chat(&self) -> Result<String, ClientError> {
        let created: CreateChatResponse =
            self.send_json(self.request(Method::POST, &["chats"])).await?;
        Ok(created.chat_id)
    }

    async fn send_message(&self, message: &ChatMessage) -> Result<SendMessageResponse, ClientError> {
        let document = Document::from_message(message);
        let req = self
            .request(Method::POST, &["messages"])
            .query(&[("documentId", message.id.as_str())]);
        self.send_with_body(req, &document).await
    }

    async fn list_messages(&self, chat_id: &str) -> Result<Vec<ChatMessage>, ClientError> {
        let req = self
            .request(Method::GET, &["messages"])
            .query(&[("chatId", chat_id)]);
        let list: DocumentList = self.send_json(req).await?;
        Ok(messages_from(list))
    }

    async fn rename_chat(&self, chat_id: &str, title: &str) -> Result<String, ClientError> {
        let body = TitleRequest {
            title: title.to_string(),
        };
        let resp: TitleResponse = self
            .send_with_body(self.request(Method::PATCH, &["chats", chat_id, "title"]), &body)
            .await?;
        Ok(resp.title)
    }

    async fn mark_read(&self, chat_id: &str, as_party: Party) -> Result<(), ClientError> {
        let marker = match as_party {
            Party::User => "user-read",
            Party::Operator => "read",
        };
        let _: StatusResponse = self
            .send_json(self.request(Method::PATCH, &["chats", chat_id, marker]))
            .await?;
        Ok(())
    }

    async fn heartbeat(&self, room: &str, last_active: f64) -> Result<(), ClientError> {
        let req = self
            .request(Method::PATCH, &["status"])
            .query(&[("room", room)]);
        let _: Document = self
            .send_with_body(req, &Document::presence(last_active))
            .await?;
        Ok(())
    }

    async fn presence(&self, room: &str) -> Result<Option<f64>, ClientError> {
        let req = self
            .request(Method::GET, &["status"])
            .query(&[("room", room)]);
        let doc: Document = self.send_json(req).await?;
        Ok(doc.last_active())
    }
}
