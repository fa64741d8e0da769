use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// -- Users --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

// -- Chat --

/// Error returned when a stored or submitted enum tag is not recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown variant '{}'", self.0)
    }
}

impl std::error::Error for UnknownVariant {}

/// Implements `as_str` / `FromStr` for the snake_case enums stored as TEXT columns.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant(other.to_string())),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    Direct,
    Category,
    Group,
    Support,
}

text_enum!(RoomKind {
    Direct => "direct",
    Category => "category",
    Group => "group",
    Support => "support",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Admin,
    Moderator,
    Member,
}

text_enum!(ParticipantRole {
    Admin => "admin",
    Moderator => "moderator",
    Member => "member",
});

impl ParticipantRole {
    /// Admins and moderators may delete other participants' messages.
    pub fn can_moderate(&self) -> bool {
        matches!(self, Self::Admin | Self::Moderator)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
    System,
    Achievement,
}

text_enum!(MessageKind {
    Text => "text",
    Image => "image",
    File => "file",
    System => "system",
    Achievement => "achievement",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: Uuid,
    pub kind: RoomKind,
    pub name: Option<String>,
    pub owner_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
}

/// File metadata attached to a message. The bytes live in an external object store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: Uuid,
    pub message_id: Uuid,
    pub file_name: String,
    pub size_bytes: u64,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionGroup {
    pub emoji: String,
    pub count: usize,
    pub user_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub room_id: Uuid,
    pub sender_id: Uuid,
    pub sender_username: String,
    pub body: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub reply_to: Option<Uuid>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub reactions: Vec<ReactionGroup>,
}

impl Message {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// The position of this message in a room's timeline.
    pub fn cursor(&self) -> MessageCursor {
        MessageCursor {
            created_at: self.created_at,
            id: self.id,
        }
    }
}

/// Pagination cursor: messages strictly older than `(created_at, id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageCursor {
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

// -- Wellness --

/// Locale-keyed display name, stored as JSON (`{"en": "...", "es": "..."}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalizedName {
    pub en: String,
    pub es: String,
}

impl LocalizedName {
    /// Name for a BCP-47-ish locale tag, falling back to English.
    pub fn get(&self, locale: &str) -> &str {
        if locale.starts_with("es") { &self.es } else { &self.en }
    }
}

/// One of the six life axes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: Uuid,
    pub slug: String,
    pub name: LocalizedName,
    pub color: String,
    pub position: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckIn {
    pub id: Uuid,
    pub user_id: Uuid,
    pub category_id: Uuid,
    pub date: NaiveDate,
    pub completed: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeBlockStatus {
    #[default]
    Planned,
    Active,
    Completed,
    Skipped,
}

text_enum!(TimeBlockStatus {
    Planned => "planned",
    Active => "active",
    Completed => "completed",
    Skipped => "skipped",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeBlock {
    pub id: Uuid,
    pub user_id: Uuid,
    pub date: NaiveDate,
    pub category_id: Option<Uuid>,
    pub activity: String,
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    pub duration_minutes: u32,
    #[serde(with = "hhmm")]
    pub end_time: NaiveTime,
    pub status: TimeBlockStatus,
}

/// Longest block the scheduler accepts: one full day.
pub const MAX_BLOCK_MINUTES: u32 = 24 * 60;

/// End of a block starting at `start` and lasting `duration_minutes`,
/// wrapping past midnight.
pub fn compute_end_time(start: NaiveTime, duration_minutes: u32) -> NaiveTime {
    start
        .overflowing_add_signed(TimeDelta::minutes(i64::from(duration_minutes)))
        .0
}

/// Parses `HH:MM`, also accepting `HH:MM:SS`.
pub fn parse_clock_time(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .ok()
}

/// Serde adapter for `HH:MM` clock times.
pub mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(time: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_clock_time(&raw)
            .ok_or_else(|| D::Error::custom(format!("invalid clock time '{}'", raw)))
    }
}

// -- Billing --

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub user_id: Uuid,
    pub status: String,
    pub plan: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn end_time_adds_duration() {
        assert_eq!(compute_end_time(t(9, 30), 45), t(10, 15));
        assert_eq!(compute_end_time(t(0, 0), 0), t(0, 0));
    }

    #[test]
    fn end_time_wraps_past_midnight() {
        assert_eq!(compute_end_time(t(23, 30), 90), t(1, 0));
        assert_eq!(compute_end_time(t(6, 0), MAX_BLOCK_MINUTES), t(6, 0));
    }

    #[test]
    fn end_time_matches_minutes_mod_day() {
        for start in (0..1440).step_by(37) {
            for duration in [1u32, 59, 60, 719, 1439, 1440] {
                let s = t(start / 60, start % 60);
                let end = compute_end_time(s, duration);
                let expected = (start + duration) % 1440;
                assert_eq!(end, t(expected / 60, expected % 60));
            }
        }
    }

    #[test]
    fn clock_time_formats() {
        assert_eq!(parse_clock_time("07:05"), Some(t(7, 5)));
        assert_eq!(parse_clock_time("07:05:00"), Some(t(7, 5)));
        assert_eq!(parse_clock_time("25:00"), None);
        assert_eq!(parse_clock_time("noon"), None);
    }

    #[test]
    fn text_enums_parse_their_own_output() {
        for kind in [RoomKind::Direct, RoomKind::Category, RoomKind::Group, RoomKind::Support] {
            assert_eq!(kind.as_str().parse::<RoomKind>(), Ok(kind));
        }
        assert!("channel".parse::<RoomKind>().is_err());
        assert_eq!("achievement".parse::<MessageKind>(), Ok(MessageKind::Achievement));
    }

    #[test]
    fn localized_name_falls_back_to_english() {
        let name = LocalizedName { en: "Physical".into(), es: "Física".into() };
        assert_eq!(name.get("es-MX"), "Física");
        assert_eq!(name.get("fr"), "Physical");
    }

    #[test]
    fn message_kind_serializes_as_type() {
        let json = serde_json::json!({
            "id": Uuid::nil(),
            "room_id": Uuid::nil(),
            "sender_id": Uuid::nil(),
            "sender_username": "ana",
            "body": "hi",
            "type": "image",
            "created_at": "2026-01-01T00:00:00Z",
            "edited_at": null,
            "deleted_at": null,
            "reply_to": null
        });
        let msg: Message = serde_json::from_value(json).unwrap();
        assert_eq!(msg.kind, MessageKind::Image);
        assert!(msg.attachments.is_empty());
    }
}
