use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use axis_types::api::{
    CreateRoomRequest, EditMessageRequest, ErrorBody, LoginRequest, LoginResponse, RegisterRequest,
    RegisterResponse, SendMessageRequest, Success, ToggleReactionRequest, ToggleReactionResponse,
};
use axis_types::models::{Message, MessageCursor, MessageKind, Room, RoomKind};

use crate::error::SyncError;
use crate::transport::HistorySource;

/// Thin REST client for the chat endpoints. Writes go through here rather
/// than the gateway, so sending works while realtime is degraded.
#[derive(Debug, Clone)]
pub struct ChatApi {
    client: Client,
    base_url: String,
    token: String,
}

impl ChatApi {
    /// `base_url` without a trailing slash, e.g. `http://127.0.0.1:3000`.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub async fn register(base_url: &str, username: &str, password: &str) -> Result<RegisterResponse, SyncError> {
        let req = Client::new().post(format!("{base_url}/api/auth/register")).json(&RegisterRequest {
            username: username.to_string(),
            password: password.to_string(),
        });
        decode(req).await
    }

    pub async fn login(base_url: &str, username: &str, password: &str) -> Result<LoginResponse, SyncError> {
        let req = Client::new().post(format!("{base_url}/api/auth/login")).json(&LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        });
        decode(req).await
    }

    pub async fn create_room(
        &self,
        kind: RoomKind,
        name: Option<String>,
        participant_ids: Vec<Uuid>,
    ) -> Result<Room, SyncError> {
        self.post(
            "/api/chat/rooms",
            &CreateRoomRequest {
                kind,
                name,
                participant_ids,
            },
        )
        .await
    }

    pub async fn send_message(&self, room_id: Uuid, content: &str) -> Result<Message, SyncError> {
        self.post(
            &format!("/api/chat/rooms/{room_id}/messages"),
            &SendMessageRequest {
                kind: MessageKind::Text,
                content: content.to_string(),
                reply_to: None,
                attachments: vec![],
            },
        )
        .await
    }

    pub async fn edit_message(&self, room_id: Uuid, message_id: Uuid, content: &str) -> Result<Message, SyncError> {
        let req = self
            .client
            .patch(self.url(&format!("/api/chat/rooms/{room_id}/messages/{message_id}")))
            .bearer_auth(&self.token)
            .json(&EditMessageRequest {
                content: content.to_string(),
            });
        decode(req).await
    }

    pub async fn delete_message(&self, room_id: Uuid, message_id: Uuid) -> Result<(), SyncError> {
        let req = self
            .client
            .delete(self.url(&format!("/api/chat/rooms/{room_id}/messages/{message_id}")))
            .bearer_auth(&self.token);
        decode::<serde_json::Value>(req).await.map(|_| ())
    }

    /// Returns true if the reaction was added, false if it was removed.
    pub async fn toggle_reaction(&self, room_id: Uuid, message_id: Uuid, emoji: &str) -> Result<bool, SyncError> {
        let resp: ToggleReactionResponse = self
            .post(
                &format!("/api/chat/rooms/{room_id}/messages/{message_id}/reactions"),
                &ToggleReactionRequest {
                    emoji: emoji.to_string(),
                },
            )
            .await?;
        Ok(resp.added)
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, SyncError> {
        let req = self.client.post(self.url(path)).bearer_auth(&self.token).json(body);
        decode(req).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl HistorySource for ChatApi {
    async fn fetch_page(
        &self,
        room_id: Uuid,
        before: Option<MessageCursor>,
        limit: u32,
    ) -> Result<Vec<Message>, SyncError> {
        let mut query = vec![("limit", limit.to_string())];
        if let Some(cursor) = before {
            query.push(("before", cursor.created_at.to_rfc3339()));
            query.push(("before_id", cursor.id.to_string()));
        }
        let req = self
            .client
            .get(self.url(&format!("/api/chat/rooms/{room_id}/messages")))
            .bearer_auth(&self.token)
            .query(&query);
        decode(req).await
    }
}

/// Sends the request and unwraps the success envelope, turning the error
/// envelope into `SyncError::Status`.
async fn decode<T: DeserializeOwned>(req: RequestBuilder) -> Result<T, SyncError> {
    let resp = req.send().await?;
    let status = resp.status();
    let bytes = resp.bytes().await?;

    if status.is_success() {
        let body: Success<T> = serde_json::from_slice(&bytes)?;
        return Ok(body.data);
    }

    let message = serde_json::from_slice::<ErrorBody>(&bytes)
        .map(|e| e.error)
        .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).into_owned());
    debug!("request failed with {}: {}", status, message);
    Err(SyncError::Status {
        status: status.as_u16(),
        message,
    })
}
