use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use axis_types::events::RealtimeEvent;

/// What every connection task receives from the shared broadcast channel.
#[derive(Debug, Clone)]
pub enum Broadcast {
    /// An event, serialized once for all receivers.
    Event { room_id: Option<Uuid>, json: Arc<str> },

    /// Drop the room subscription of `user_id` (or of everyone when `None`),
    /// e.g. after a participant is removed or the room is deleted.
    Revoke { room_id: Uuid, user_id: Option<Uuid> },
}

/// Fans events out to every gateway connection.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Broadcast channel; every connection filters by its own room subscriptions
    broadcast_tx: broadcast::Sender<Broadcast>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(DispatcherInner { broadcast_tx }),
        }
    }

    /// Subscribe to gateway traffic. Returns a broadcast receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<Broadcast> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Broadcast an event to every connection subscribed to its room.
    pub fn broadcast(&self, event: RealtimeEvent) {
        let json = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize gateway event: {}", e);
                return;
            }
        };
        // No receivers is not an error: nobody is connected
        let _ = self.inner.broadcast_tx.send(Broadcast::Event {
            room_id: event.room_id(),
            json: json.into(),
        });
    }

    pub fn revoke(&self, room_id: Uuid, user_id: Option<Uuid>) {
        debug!("Revoking subscriptions to room {} (user {:?})", room_id, user_id);
        let _ = self.inner.broadcast_tx.send(Broadcast::Revoke { room_id, user_id });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_carries_room_scope_and_json() {
        let dispatcher = Dispatcher::new();
        let mut rx = dispatcher.subscribe();
        let room_id = Uuid::new_v4();

        dispatcher.broadcast(RealtimeEvent::Typing {
            room_id,
            user_id: Uuid::new_v4(),
            username: "ana".into(),
            is_typing: true,
        });

        match rx.recv().await.unwrap() {
            Broadcast::Event { room_id: scope, json } => {
                assert_eq!(scope, Some(room_id));
                let back: RealtimeEvent = serde_json::from_str(&json).unwrap();
                assert!(matches!(back, RealtimeEvent::Typing { is_typing: true, .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn revoke_reaches_every_subscriber() {
        let dispatcher = Dispatcher::new();
        let (mut a, mut b) = (dispatcher.subscribe(), dispatcher.subscribe());
        let (room_id, user) = (Uuid::new_v4(), Uuid::new_v4());

        dispatcher.revoke(room_id, Some(user));
        for rx in [&mut a, &mut b] {
            match rx.recv().await.unwrap() {
                Broadcast::Revoke { room_id: r, user_id } => {
                    assert_eq!(r, room_id);
                    assert_eq!(user_id, Some(user));
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }
}
