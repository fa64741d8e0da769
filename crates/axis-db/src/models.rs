//! Database row types. These map directly to SQLite rows and are
//! distinct from axis-types API models to keep the DB layer independent.

use anyhow::Result;
use uuid::Uuid;

use axis_types::models::{
    Attachment, Category, CheckIn, LocalizedName, Participant, Room, TimeBlock,
};

use crate::parse_ts;

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub created_at: String,
}

pub struct RoomRow {
    pub id: String,
    pub kind: String,
    pub name: Option<String>,
    pub owner_id: String,
    pub created_at: String,
}

impl RoomRow {
    pub fn into_model(self) -> Result<Room> {
        Ok(Room {
            id: self.id.parse()?,
            kind: self.kind.parse()?,
            name: self.name,
            owner_id: self.owner_id.parse()?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

pub struct ParticipantRow {
    pub room_id: String,
    pub user_id: String,
    pub username: String,
    pub role: String,
    pub joined_at: String,
}

impl ParticipantRow {
    pub fn into_model(self) -> Result<Participant> {
        Ok(Participant {
            room_id: self.room_id.parse()?,
            user_id: self.user_id.parse()?,
            username: self.username,
            role: self.role.parse()?,
            joined_at: parse_ts(&self.joined_at)?,
        })
    }
}

pub struct MessageRow {
    pub id: String,
    pub room_id: String,
    pub sender_id: String,
    pub sender_username: String,
    pub body: String,
    pub kind: String,
    pub reply_to: Option<String>,
    pub created_at: String,
    pub edited_at: Option<String>,
    pub deleted_at: Option<String>,
}

/// Insert payload for a new message and its side tables.
pub struct NewMessage<'a> {
    pub id: Uuid,
    pub room_id: Uuid,
    pub sender_id: Uuid,
    pub body: &'a str,
    pub kind: &'a str,
    pub reply_to: Option<Uuid>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub attachments: &'a [Attachment],
    pub mentioned_user_ids: &'a [Uuid],
}

pub struct ReactionRow {
    pub id: String,
    pub message_id: String,
    pub user_id: String,
    pub emoji: String,
    pub created_at: String,
}

pub struct AttachmentRow {
    pub id: String,
    pub message_id: String,
    pub file_name: String,
    pub size_bytes: i64,
    pub mime_type: String,
}

impl AttachmentRow {
    pub fn into_model(self) -> Result<Attachment> {
        Ok(Attachment {
            id: self.id.parse()?,
            message_id: self.message_id.parse()?,
            file_name: self.file_name,
            size_bytes: u64::try_from(self.size_bytes)?,
            mime_type: self.mime_type,
        })
    }
}

pub struct CategoryRow {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub color: String,
    pub position: i64,
}

impl CategoryRow {
    pub fn into_model(self) -> Result<Category> {
        let name: LocalizedName = serde_json::from_str(&self.name)?;
        Ok(Category {
            id: self.id.parse()?,
            slug: self.slug,
            name,
            color: self.color,
            position: u32::try_from(self.position)?,
        })
    }
}

pub struct CheckInRow {
    pub id: String,
    pub user_id: String,
    pub category_id: String,
    pub date: String,
    pub completed: bool,
    pub updated_at: String,
}

impl CheckInRow {
    pub fn into_model(self) -> Result<CheckIn> {
        Ok(CheckIn {
            id: self.id.parse()?,
            user_id: self.user_id.parse()?,
            category_id: self.category_id.parse()?,
            date: self.date.parse()?,
            completed: self.completed,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

pub struct TimeBlockRow {
    pub id: String,
    pub user_id: String,
    pub date: String,
    pub category_id: Option<String>,
    pub activity: String,
    pub start_time: String,
    pub duration_minutes: i64,
    pub end_time: String,
    pub status: String,
}

impl TimeBlockRow {
    pub fn into_model(self) -> Result<TimeBlock> {
        let clock = |raw: &str| {
            axis_types::models::parse_clock_time(raw)
                .ok_or_else(|| anyhow::anyhow!("bad clock time '{}'", raw))
        };
        Ok(TimeBlock {
            id: self.id.parse()?,
            user_id: self.user_id.parse()?,
            date: self.date.parse()?,
            category_id: self.category_id.map(|c| c.parse()).transpose()?,
            activity: self.activity,
            start_time: clock(&self.start_time)?,
            duration_minutes: u32::try_from(self.duration_minutes)?,
            end_time: clock(&self.end_time)?,
            status: self.status.parse()?,
        })
    }
}
