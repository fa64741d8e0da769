use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Message;

/// Events sent over the realtime gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RealtimeEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid, username: String },

    /// Subscription to a room's events is live
    Subscribed { room_id: Uuid },

    Unsubscribed { room_id: Uuid },

    /// A message row was inserted
    MessageInsert { message: Message },

    /// A message row was edited
    MessageUpdate { message: Message },

    /// A message was soft-deleted
    MessageDelete {
        room_id: Uuid,
        message_id: Uuid,
        deleted_at: DateTime<Utc>,
    },

    ReactionAdd {
        room_id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
        emoji: String,
    },

    ReactionRemove {
        room_id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
        emoji: String,
    },

    /// A participant is still looking at the room
    Heartbeat {
        room_id: Uuid,
        user_id: Uuid,
        username: String,
    },

    /// A participant started or stopped typing
    Typing {
        room_id: Uuid,
        user_id: Uuid,
        username: String,
        is_typing: bool,
    },

    /// A command was rejected
    Error { code: String, message: String },
}

impl RealtimeEvent {
    /// Returns the room_id if this event is scoped to a specific room.
    /// Events that return `None` are addressed to a single connection.
    pub fn room_id(&self) -> Option<Uuid> {
        match self {
            Self::MessageInsert { message } | Self::MessageUpdate { message } => Some(message.room_id),
            Self::MessageDelete { room_id, .. }
            | Self::ReactionAdd { room_id, .. }
            | Self::ReactionRemove { room_id, .. }
            | Self::Heartbeat { room_id, .. }
            | Self::Typing { room_id, .. } => Some(*room_id),
            // Ready, Subscribed, Unsubscribed and Error are per-connection
            _ => None,
        }
    }
}

/// Commands sent FROM client TO server over the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },

    /// Start receiving a room's events. Only participants may subscribe.
    Subscribe { room_id: Uuid },

    Unsubscribe { room_id: Uuid },

    /// Presence keep-alive for a room
    Heartbeat { room_id: Uuid },

    Typing { room_id: Uuid, is_typing: bool },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_use_adjacent_tagging() {
        let room_id = Uuid::new_v4();
        let cmd = GatewayCommand::Typing { room_id, is_typing: true };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "Typing");
        assert_eq!(json["data"]["is_typing"], true);

        let back: GatewayCommand = serde_json::from_value(json).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn connection_events_are_unscoped() {
        let ready = RealtimeEvent::Ready { user_id: Uuid::nil(), username: "ana".into() };
        assert_eq!(ready.room_id(), None);

        let room_id = Uuid::new_v4();
        let delete = RealtimeEvent::MessageDelete {
            room_id,
            message_id: Uuid::new_v4(),
            deleted_at: Utc::now(),
        };
        assert_eq!(delete.room_id(), Some(room_id));
    }
}
