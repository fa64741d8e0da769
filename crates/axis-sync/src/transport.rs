use std::future::Future;

use uuid::Uuid;

use axis_types::events::{GatewayCommand, RealtimeEvent};
use axis_types::models::{Message, MessageCursor};

use crate::error::SyncError;

/// Opens realtime subscriptions. `WsTransport` is the production impl.
pub trait RealtimeTransport: Send + Sync + 'static {
    type Stream: RoomStream;

    /// Resolves once the server has confirmed the subscription.
    fn subscribe(&self, room_id: Uuid) -> impl Future<Output = Result<Self::Stream, SyncError>> + Send;
}

/// A live subscription to one room.
pub trait RoomStream: Send + 'static {
    /// Next event for the room. `None` means the subscription ended.
    fn next_event(&mut self) -> impl Future<Output = Option<Result<RealtimeEvent, SyncError>>> + Send;

    fn send(&mut self, command: GatewayCommand) -> impl Future<Output = Result<(), SyncError>> + Send;
}

/// Paged read access to a room's history. `ChatApi` is the production impl.
pub trait HistorySource: Send + Sync + 'static {
    /// Up to `limit` messages strictly older than `before` (or the newest
    /// page), in chronological order.
    fn fetch_page(
        &self,
        room_id: Uuid,
        before: Option<MessageCursor>,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<Message>, SyncError>> + Send;
}
