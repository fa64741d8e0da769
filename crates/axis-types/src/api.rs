use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Message, MessageKind, Participant, ParticipantRole, Room, RoomKind, TimeBlockStatus};

// -- JWT Claims --

/// JWT claims shared across axis-api (REST middleware) and axis-gateway
/// (WebSocket authentication).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

// -- Envelopes --

/// Body of every successful response: `{ "success": true, "data": ... }`.
#[derive(Debug, Serialize, Deserialize)]
pub struct Success<T> {
    pub success: bool,
    pub data: T,
}

impl<T> Success<T> {
    pub fn new(data: T) -> Self {
        Self { success: true, data }
    }
}

/// Body of every failed response: `{ "error": "...", "details": ... }`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

// -- Auth --

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub user_id: Uuid,
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub user_id: Uuid,
    pub username: String,
    pub token: String,
}

// -- Rooms --

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateRoomRequest {
    #[serde(rename = "type")]
    pub kind: RoomKind,
    pub name: Option<String>,
    #[serde(default)]
    pub participant_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddParticipantRequest {
    pub user_id: Uuid,
    #[serde(default = "default_role")]
    pub role: ParticipantRole,
}

fn default_role() -> ParticipantRole {
    ParticipantRole::Member
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RoomDetail {
    pub room: Room,
    pub participants: Vec<Participant>,
}

// -- Messages --

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    pub content: String,
    #[serde(default)]
    pub reply_to: Option<Uuid>,
    #[serde(default)]
    pub attachments: Vec<AttachmentInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttachmentInput {
    pub file_name: String,
    pub size_bytes: u64,
    pub mime_type: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EditMessageRequest {
    pub content: String,
}

// -- Reactions --

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToggleReactionRequest {
    pub emoji: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ToggleReactionResponse {
    pub added: bool,
}

// -- Search --

/// Compared field by field: any extra distinct term beats any amount of
/// repetition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SearchScore {
    pub terms: u32,
    pub occurrences: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SearchHit {
    pub message: Message,
    pub score: SearchScore,
}

// -- Wellness --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToggleCheckInRequest {
    pub category_id: Uuid,
    pub date: NaiveDate,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateTimeBlockRequest {
    pub date: NaiveDate,
    #[serde(default)]
    pub category_id: Option<Uuid>,
    pub activity: String,
    /// `HH:MM`
    pub start_time: String,
    pub duration_minutes: u32,
    #[serde(default)]
    pub status: TimeBlockStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResonanceEntry {
    pub category_id: Uuid,
    pub slug: String,
    /// Other users who completed this axis on the requested date.
    pub count: u32,
}

// -- Billing --

#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookAck {
    pub received: bool,
    pub duplicate: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub time: DateTime<Utc>,
}
