use std::collections::{BTreeSet, HashMap, HashSet};

use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::trace;
use uuid::Uuid;

use axis_types::events::RealtimeEvent;
use axis_types::models::{Message, MessageCursor, ReactionGroup};

use crate::error::SyncError;
use crate::events::Change;
use crate::transport::HistorySource;

#[derive(Debug, Default)]
struct RoomCache {
    by_id: HashMap<Uuid, Message>,
    order: BTreeSet<MessageCursor>,
    /// Ids deleted before we ever saw them.
    tombstones: HashSet<Uuid>,
    /// When a realtime reaction event last touched each message.
    reacted_at: HashMap<Uuid, Instant>,
}

enum Upsert {
    Inserted,
    Updated,
    Deleted,
    Unchanged,
}

impl RoomCache {
    /// `requested_at` is when the carrying page was requested; `None` for
    /// realtime events, which arrive in order and always win.
    fn upsert(&mut self, mut incoming: Message, requested_at: Option<Instant>) -> Upsert {
        if self.tombstones.contains(&incoming.id) {
            trace!("suppressing tombstoned message {}", incoming.id);
            return Upsert::Unchanged;
        }

        let Some(existing) = self.by_id.get(&incoming.id) else {
            let deleted = incoming.is_deleted();
            self.order.insert(incoming.cursor());
            self.by_id.insert(incoming.id, incoming);
            return if deleted { Upsert::Deleted } else { Upsert::Inserted };
        };

        // Deletion is terminal
        if existing.is_deleted() {
            return Upsert::Unchanged;
        }
        // A reaction applied after the page was requested is newer than the page
        if let (Some(requested_at), Some(reacted_at)) = (requested_at, self.reacted_at.get(&incoming.id)) {
            if *reacted_at >= requested_at {
                incoming.reactions = existing.reactions.clone();
            }
        }
        let outcome = if incoming.is_deleted() {
            Upsert::Deleted
        } else if incoming.edited_at < existing.edited_at || incoming == *existing {
            return Upsert::Unchanged;
        } else {
            Upsert::Updated
        };

        let old_cursor = existing.cursor();
        if old_cursor != incoming.cursor() {
            self.order.remove(&old_cursor);
            self.order.insert(incoming.cursor());
        }
        self.by_id.insert(incoming.id, incoming);
        outcome
    }

    fn delete(&mut self, message_id: Uuid, deleted_at: chrono::DateTime<chrono::Utc>) -> bool {
        match self.by_id.get_mut(&message_id) {
            Some(message) if !message.is_deleted() => {
                message.deleted_at = Some(deleted_at);
                true
            }
            Some(_) => false,
            None => {
                self.tombstones.insert(message_id);
                false
            }
        }
    }

    fn react(&mut self, message_id: Uuid, user_id: Uuid, emoji: &str, add: bool) -> bool {
        let Some(message) = self.by_id.get_mut(&message_id) else {
            return false;
        };
        let groups = &mut message.reactions;
        let pos = groups.iter().position(|g| g.emoji == emoji);

        match (pos, add) {
            (Some(i), true) => {
                let group = &mut groups[i];
                if group.user_ids.contains(&user_id) {
                    return false;
                }
                group.user_ids.push(user_id);
                group.count += 1;
            }
            (None, true) => groups.push(ReactionGroup {
                emoji: emoji.to_string(),
                count: 1,
                user_ids: vec![user_id],
            }),
            (Some(i), false) => {
                let group = &mut groups[i];
                let Some(at) = group.user_ids.iter().position(|u| *u == user_id) else {
                    return false;
                };
                group.user_ids.remove(at);
                group.count = group.count.saturating_sub(1);
                if group.count == 0 {
                    groups.remove(i);
                }
            }
            (None, false) => return false,
        }
        self.reacted_at.insert(message_id, Instant::now());
        true
    }

    fn ordered(&self) -> impl Iterator<Item = &Message> {
        self.order.iter().filter_map(|c| self.by_id.get(&c.id))
    }
}

/// Per-room, de-duplicated, chronologically ordered messages merged from
/// history pages and realtime events.
///
/// Duplicates resolve last-write-wins on `edited_at`; a deletion, once
/// observed, is never undone. A delete for an unknown id leaves a tombstone
/// that suppresses the message if it shows up later.
#[derive(Debug)]
pub struct MessageCache {
    rooms: HashMap<Uuid, RoomCache>,
    changes: broadcast::Sender<Change>,
}

impl Default for MessageCache {
    fn default() -> Self {
        Self::new(broadcast::channel(256).0)
    }
}

impl MessageCache {
    /// A cache that reports mutations on `changes`.
    pub fn new(changes: broadcast::Sender<Change>) -> Self {
        Self {
            rooms: HashMap::new(),
            changes,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Change> {
        self.changes.subscribe()
    }

    fn notify(&self, change: Change) {
        // No subscribers is fine
        let _ = self.changes.send(change);
    }

    /// Fetches the page older than `cursor` (or the newest page) and merges it.
    pub async fn load<H: HistorySource>(
        &mut self,
        source: &H,
        room_id: Uuid,
        cursor: Option<MessageCursor>,
        limit: u32,
    ) -> Result<Vec<Message>, SyncError> {
        let requested_at = Instant::now();
        let page = source.fetch_page(room_id, cursor, limit).await?;
        Ok(self.merge_page(room_id, page, requested_at))
    }

    /// Merges a page requested at `requested_at` and returns its messages as
    /// they now stand in the cache, in order. Tombstoned messages are left out.
    pub fn merge_page(&mut self, room_id: Uuid, page: Vec<Message>, requested_at: Instant) -> Vec<Message> {
        let room = self.rooms.entry(room_id).or_default();
        let mut ids = Vec::with_capacity(page.len());
        let mut changed = 0;
        for message in page {
            if message.room_id != room_id {
                continue;
            }
            ids.push(message.id);
            if !matches!(room.upsert(message, Some(requested_at)), Upsert::Unchanged) {
                changed += 1;
            }
        }

        let mut merged: Vec<Message> = ids.iter().filter_map(|id| room.by_id.get(id).cloned()).collect();
        merged.sort_by_key(Message::cursor);
        merged.dedup_by_key(|m| m.id);

        if changed > 0 {
            self.notify(Change::PageMerged { room_id, count: changed });
        }
        merged
    }

    /// Applies a realtime event. Returns the resulting change, if any.
    pub fn apply_event(&mut self, event: &RealtimeEvent) -> Option<Change> {
        let change = match event {
            RealtimeEvent::MessageInsert { message } | RealtimeEvent::MessageUpdate { message } => {
                let (room_id, message_id) = (message.room_id, message.id);
                let room = self.rooms.entry(room_id).or_default();
                match room.upsert(message.clone(), None) {
                    Upsert::Inserted => Change::Inserted { room_id, message_id },
                    Upsert::Updated => Change::Updated { room_id, message_id },
                    Upsert::Deleted => Change::Deleted { room_id, message_id },
                    Upsert::Unchanged => return None,
                }
            }
            RealtimeEvent::MessageDelete {
                room_id,
                message_id,
                deleted_at,
            } => {
                let room = self.rooms.entry(*room_id).or_default();
                if !room.delete(*message_id, *deleted_at) {
                    return None;
                }
                Change::Deleted {
                    room_id: *room_id,
                    message_id: *message_id,
                }
            }
            RealtimeEvent::ReactionAdd {
                room_id,
                message_id,
                user_id,
                emoji,
            }
            | RealtimeEvent::ReactionRemove {
                room_id,
                message_id,
                user_id,
                emoji,
            } => {
                let add = matches!(event, RealtimeEvent::ReactionAdd { .. });
                let room = self.rooms.get_mut(room_id)?;
                if !room.react(*message_id, *user_id, emoji, add) {
                    return None;
                }
                Change::Updated {
                    room_id: *room_id,
                    message_id: *message_id,
                }
            }
            _ => return None,
        };

        self.notify(change.clone());
        Some(change)
    }

    /// Snapshot of a room's messages, oldest first. Deleted messages are
    /// included with `deleted_at` set.
    pub fn messages(&self, room_id: Uuid) -> Vec<Message> {
        self.rooms
            .get(&room_id)
            .map(|room| room.ordered().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, room_id: Uuid, message_id: Uuid) -> Option<&Message> {
        self.rooms.get(&room_id)?.by_id.get(&message_id)
    }

    /// Cursor of the oldest cached message, for fetching the next older page.
    pub fn oldest_cursor(&self, room_id: Uuid) -> Option<MessageCursor> {
        self.rooms.get(&room_id)?.order.first().copied()
    }

    pub fn len(&self, room_id: Uuid) -> usize {
        self.rooms.get(&room_id).map_or(0, |r| r.by_id.len())
    }
}
