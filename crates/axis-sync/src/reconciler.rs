use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

use axis_types::events::RealtimeEvent;
use axis_types::models::{Message, MessageCursor};

use crate::cache::MessageCache;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::events::{Change, SyncEvent};
use crate::presence::PresenceTracker;
use crate::transport::HistorySource;

/// Who is online and typing in a room at the time of the query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceSnapshot {
    pub online: Vec<Uuid>,
    pub typing: Vec<Uuid>,
}

enum Command {
    Load {
        room_id: Uuid,
        cursor: Option<MessageCursor>,
        reply: oneshot::Sender<Result<Vec<Message>, SyncError>>,
    },
    Messages {
        room_id: Uuid,
        reply: oneshot::Sender<Vec<Message>>,
    },
    Presence {
        room_id: Uuid,
        reply: oneshot::Sender<PresenceSnapshot>,
    },
    OldestCursor {
        room_id: Uuid,
        reply: oneshot::Sender<Option<MessageCursor>>,
    },
}

struct Loaded {
    room_id: Uuid,
    requested_at: Instant,
    result: Result<Vec<Message>, SyncError>,
    reply: oneshot::Sender<Result<Vec<Message>, SyncError>>,
}

/// The single owner of the message cache and presence tracker. Connection
/// workers feed it `SyncEvent`s; callers read through a `SyncHandle`.
pub struct Reconciler<H> {
    cache: MessageCache,
    presence: PresenceTracker,
    history: Arc<H>,
    page_size: u32,
    commands: mpsc::Receiver<Command>,
    changes: broadcast::Sender<Change>,
}

impl<H: HistorySource> Reconciler<H> {
    pub fn new(config: &SyncConfig, history: Arc<H>) -> (Self, SyncHandle) {
        let (changes, _) = broadcast::channel(config.change_buffer);
        let (cmd_tx, cmd_rx) = mpsc::channel(config.event_buffer);

        let reconciler = Self {
            cache: MessageCache::new(changes.clone()),
            presence: PresenceTracker::new(config.online_timeout, config.typing_timeout),
            history,
            page_size: config.page_size,
            commands: cmd_rx,
            changes: changes.clone(),
        };
        let handle = SyncHandle {
            commands: cmd_tx,
            changes,
        };
        (reconciler, handle)
    }

    /// Runs until the event channel closes, i.e. every connection worker
    /// and the manager that spawns them are gone.
    pub async fn run(mut self, mut events: mpsc::Receiver<SyncEvent>) {
        let (loaded_tx, mut loaded_rx) = mpsc::unbounded_channel::<Loaded>();

        loop {
            tokio::select! {
                // Events drain before queries so reads see everything already delivered
                biased;

                event = events.recv() => match event {
                    Some(event) => self.apply(event),
                    None => break,
                },
                Some(loaded) = loaded_rx.recv() => {
                    let (room_id, requested_at) = (loaded.room_id, loaded.requested_at);
                    let result = loaded.result.map(|page| self.cache.merge_page(room_id, page, requested_at));
                    let _ = loaded.reply.send(result);
                }
                Some(command) = self.commands.recv() => self.handle(command, &loaded_tx),
            }
        }
        debug!("reconciler stopped");
    }

    fn apply(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::Realtime(event) => self.apply_realtime(event),
            SyncEvent::Page {
                room_id,
                messages,
                requested_at,
            } => {
                self.cache.merge_page(room_id, messages, requested_at);
            }
            SyncEvent::State { room_id, state } => self.notify(Change::Connection { room_id, state }),
        }
    }

    fn apply_realtime(&mut self, event: RealtimeEvent) {
        trace!("reconciling {:?}", event);
        match event {
            RealtimeEvent::Heartbeat { room_id, user_id, .. } => {
                self.presence.heartbeat(room_id, user_id);
                self.notify(Change::Presence { room_id });
            }
            RealtimeEvent::Typing {
                room_id,
                user_id,
                is_typing,
                ..
            } => {
                self.presence.set_typing(room_id, user_id, is_typing);
                self.notify(Change::Presence { room_id });
            }
            RealtimeEvent::MessageInsert { ref message } => {
                let (room_id, sender) = (message.room_id, message.sender_id);
                // Sending a message ends the sender's typing indicator
                if self.presence.typing(room_id).contains(&sender) {
                    self.presence.set_typing(room_id, sender, false);
                    self.notify(Change::Presence { room_id });
                }
                self.cache.apply_event(&event);
            }
            other => {
                self.cache.apply_event(&other);
            }
        }
    }

    fn handle(&mut self, command: Command, loaded: &mpsc::UnboundedSender<Loaded>) {
        match command {
            Command::Load { room_id, cursor, reply } => {
                let history = self.history.clone();
                let loaded = loaded.clone();
                let limit = self.page_size;
                tokio::spawn(async move {
                    let requested_at = Instant::now();
                    let result = history.fetch_page(room_id, cursor, limit).await;
                    let _ = loaded.send(Loaded {
                        room_id,
                        requested_at,
                        result,
                        reply,
                    });
                });
            }
            Command::Messages { room_id, reply } => {
                let _ = reply.send(self.cache.messages(room_id));
            }
            Command::Presence { room_id, reply } => {
                let snapshot = PresenceSnapshot {
                    online: self.presence.online(room_id),
                    typing: self.presence.typing(room_id),
                };
                let _ = reply.send(snapshot);
            }
            Command::OldestCursor { room_id, reply } => {
                let _ = reply.send(self.cache.oldest_cursor(room_id));
            }
        }
    }

    fn notify(&self, change: Change) {
        let _ = self.changes.send(change);
    }
}

/// Cheap, cloneable access to a running `Reconciler`.
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::Sender<Command>,
    changes: broadcast::Sender<Change>,
}

impl SyncHandle {
    /// Fetches the page older than `cursor` (or the newest page), merges it
    /// into the cache and returns it as merged.
    pub async fn load(&self, room_id: Uuid, cursor: Option<MessageCursor>) -> Result<Vec<Message>, SyncError> {
        self.ask(|reply| Command::Load { room_id, cursor, reply }).await?
    }

    /// Loads the page before the oldest cached message.
    pub async fn load_older(&self, room_id: Uuid) -> Result<Vec<Message>, SyncError> {
        let cursor = self.oldest_cursor(room_id).await?;
        self.load(room_id, cursor).await
    }

    pub async fn messages(&self, room_id: Uuid) -> Result<Vec<Message>, SyncError> {
        self.ask(|reply| Command::Messages { room_id, reply }).await
    }

    pub async fn presence(&self, room_id: Uuid) -> Result<PresenceSnapshot, SyncError> {
        self.ask(|reply| Command::Presence { room_id, reply }).await
    }

    pub async fn oldest_cursor(&self, room_id: Uuid) -> Result<Option<MessageCursor>, SyncError> {
        self.ask(|reply| Command::OldestCursor { room_id, reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Change> {
        self.changes.subscribe()
    }

    async fn ask<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).await.map_err(|_| SyncError::Shutdown)?;
        rx.await.map_err(|_| SyncError::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axis_types::models::MessageKind;
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;

    use crate::connection::ConnectionState;

    fn msg(room_id: Uuid, secs: i64, sender_id: Uuid) -> Message {
        Message {
            id: Uuid::new_v4(),
            room_id,
            sender_id,
            sender_username: "ana".into(),
            body: format!("at {secs}"),
            kind: MessageKind::Text,
            created_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            edited_at: None,
            deleted_at: None,
            reply_to: None,
            attachments: vec![],
            reactions: vec![],
        }
    }

    struct History(Mutex<Vec<Message>>);

    impl HistorySource for History {
        async fn fetch_page(
            &self,
            _room_id: Uuid,
            before: Option<MessageCursor>,
            limit: u32,
        ) -> Result<Vec<Message>, SyncError> {
            let mut page: Vec<Message> = self
                .0
                .lock()
                .unwrap()
                .iter()
                .filter(|m| before.is_none_or(|c| m.cursor() < c))
                .cloned()
                .collect();
            page.sort_by_key(Message::cursor);
            let skip = page.len().saturating_sub(limit as usize);
            Ok(page.split_off(skip))
        }
    }

    fn start(history: Vec<Message>) -> (mpsc::Sender<SyncEvent>, SyncHandle, tokio::task::JoinHandle<()>) {
        let config = SyncConfig {
            page_size: 2,
            ..SyncConfig::default()
        };
        let (reconciler, handle) = Reconciler::new(&config, Arc::new(History(Mutex::new(history))));
        let (tx, rx) = mpsc::channel(16);
        (tx, handle, tokio::spawn(reconciler.run(rx)))
    }

    #[tokio::test]
    async fn realtime_insert_then_load_is_one_copy() {
        let room = Uuid::new_v4();
        let m = msg(room, 1, Uuid::new_v4());
        let (tx, handle, task) = start(vec![m.clone()]);
        let mut changes = handle.subscribe();

        tx.send(SyncEvent::Realtime(RealtimeEvent::MessageInsert { message: m.clone() }))
            .await
            .unwrap();
        let page = handle.load(room, None).await.unwrap();

        assert_eq!(page.len(), 1);
        assert_eq!(handle.messages(room).await.unwrap().len(), 1);
        assert_eq!(changes.recv().await.unwrap(), Change::Inserted { room_id: room, message_id: m.id });
        assert!(changes.try_recv().is_err());

        drop(tx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn load_older_walks_back() {
        let room = Uuid::new_v4();
        let sender = Uuid::new_v4();
        let all: Vec<Message> = (0..3).map(|i| msg(room, i, sender)).collect();
        let (_tx, handle, _task) = start(all.clone());

        handle.load(room, None).await.unwrap();
        let older = handle.load_older(room).await.unwrap();
        assert_eq!(older.iter().map(|m| m.id).collect::<Vec<_>>(), vec![all[0].id]);

        let ids: Vec<Uuid> = handle.messages(room).await.unwrap().iter().map(|m| m.id).collect();
        assert_eq!(ids, all.iter().map(|m| m.id).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn typing_clears_when_sender_posts() {
        let room = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let (tx, handle, _task) = start(vec![]);

        tx.send(SyncEvent::Realtime(RealtimeEvent::Typing {
            room_id: room,
            user_id: bob,
            username: "bob".into(),
            is_typing: true,
        }))
        .await
        .unwrap();
        let snapshot = handle.presence(room).await.unwrap();
        assert_eq!(snapshot.typing, vec![bob]);
        assert_eq!(snapshot.online, vec![bob]);

        tx.send(SyncEvent::Realtime(RealtimeEvent::MessageInsert { message: msg(room, 1, bob) }))
            .await
            .unwrap();
        let snapshot = handle.presence(room).await.unwrap();
        assert!(snapshot.typing.is_empty());
        assert_eq!(snapshot.online, vec![bob]);
    }

    #[tokio::test]
    async fn state_and_heartbeat_are_broadcast() {
        let room = Uuid::new_v4();
        let (tx, handle, _task) = start(vec![]);
        let mut changes = handle.subscribe();

        tx.send(SyncEvent::State {
            room_id: room,
            state: ConnectionState::Polling,
        })
        .await
        .unwrap();
        tx.send(SyncEvent::Realtime(RealtimeEvent::Heartbeat {
            room_id: room,
            user_id: Uuid::new_v4(),
            username: "ana".into(),
        }))
        .await
        .unwrap();

        assert_eq!(
            changes.recv().await.unwrap(),
            Change::Connection {
                room_id: room,
                state: ConnectionState::Polling
            }
        );
        assert_eq!(changes.recv().await.unwrap(), Change::Presence { room_id: room });
    }

    #[tokio::test]
    async fn handle_reports_shutdown() {
        let (tx, handle, task) = start(vec![]);
        drop(tx);
        task.await.unwrap();

        let err = handle.messages(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, SyncError::Shutdown));
    }
}
