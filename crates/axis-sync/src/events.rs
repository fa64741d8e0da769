use tokio::time::Instant;
use uuid::Uuid;

use axis_types::events::RealtimeEvent;
use axis_types::models::Message;

use crate::connection::ConnectionState;

/// Input to the reconciliation loop, produced by connection workers.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Realtime(RealtimeEvent),
    /// Newest history page, fetched while polling or after (re)connecting.
    Page {
        room_id: Uuid,
        messages: Vec<Message>,
        requested_at: Instant,
    },
    State { room_id: Uuid, state: ConnectionState },
}

/// What changed, broadcast to UI subscribers after each mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Inserted { room_id: Uuid, message_id: Uuid },
    Updated { room_id: Uuid, message_id: Uuid },
    Deleted { room_id: Uuid, message_id: Uuid },
    PageMerged { room_id: Uuid, count: usize },
    Presence { room_id: Uuid },
    Connection { room_id: Uuid, state: ConnectionState },
}
