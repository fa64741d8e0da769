use std::collections::HashMap;
use std::time::{Duration, Instant};

use uuid::Uuid;

#[derive(Debug, Default)]
struct RoomPresence {
    online: HashMap<Uuid, Instant>,
    typing: HashMap<Uuid, Instant>,
}

impl RoomPresence {
    fn prune(&mut self, now: Instant, online_timeout: Duration, typing_timeout: Duration) {
        self.online.retain(|_, seen| now.duration_since(*seen) <= online_timeout);
        // Going offline also stops typing
        let online = &self.online;
        self.typing
            .retain(|user, since| online.contains_key(user) && now.duration_since(*since) <= typing_timeout);
    }
}

/// Who is online and who is typing, per room. Entries expire lazily: stale
/// users are dropped on the next read rather than by a timer.
#[derive(Debug)]
pub struct PresenceTracker {
    online_timeout: Duration,
    typing_timeout: Duration,
    rooms: HashMap<Uuid, RoomPresence>,
}

impl PresenceTracker {
    pub fn new(online_timeout: Duration, typing_timeout: Duration) -> Self {
        Self {
            online_timeout,
            typing_timeout,
            rooms: HashMap::new(),
        }
    }

    pub fn heartbeat(&mut self, room_id: Uuid, user_id: Uuid) {
        self.heartbeat_at(room_id, user_id, Instant::now());
    }

    pub fn heartbeat_at(&mut self, room_id: Uuid, user_id: Uuid, now: Instant) {
        self.rooms.entry(room_id).or_default().online.insert(user_id, now);
    }

    pub fn set_typing(&mut self, room_id: Uuid, user_id: Uuid, is_typing: bool) {
        self.set_typing_at(room_id, user_id, is_typing, Instant::now());
    }

    /// Typing implies presence, so starting to type also refreshes online.
    pub fn set_typing_at(&mut self, room_id: Uuid, user_id: Uuid, is_typing: bool, now: Instant) {
        let room = self.rooms.entry(room_id).or_default();
        if is_typing {
            room.online.insert(user_id, now);
            room.typing.insert(user_id, now);
        } else {
            room.typing.remove(&user_id);
        }
    }

    pub fn online(&mut self, room_id: Uuid) -> Vec<Uuid> {
        self.online_at(room_id, Instant::now())
    }

    /// Online users in the room, sorted.
    pub fn online_at(&mut self, room_id: Uuid, now: Instant) -> Vec<Uuid> {
        self.read(room_id, now, |room| room.online.keys().copied().collect())
    }

    pub fn typing(&mut self, room_id: Uuid) -> Vec<Uuid> {
        self.typing_at(room_id, Instant::now())
    }

    /// Typing users in the room, sorted.
    pub fn typing_at(&mut self, room_id: Uuid, now: Instant) -> Vec<Uuid> {
        self.read(room_id, now, |room| room.typing.keys().copied().collect())
    }

    pub fn is_online_at(&mut self, room_id: Uuid, user_id: Uuid, now: Instant) -> bool {
        self.online_at(room_id, now).contains(&user_id)
    }

    /// Forget a room entirely, e.g. after leaving it.
    pub fn clear_room(&mut self, room_id: Uuid) {
        self.rooms.remove(&room_id);
    }

    fn read(&mut self, room_id: Uuid, now: Instant, pick: impl FnOnce(&RoomPresence) -> Vec<Uuid>) -> Vec<Uuid> {
        let Some(room) = self.rooms.get_mut(&room_id) else {
            return vec![];
        };
        room.prune(now, self.online_timeout, self.typing_timeout);
        let mut users = pick(room);
        users.sort();
        if room.online.is_empty() {
            self.rooms.remove(&room_id);
        }
        users
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> PresenceTracker {
        PresenceTracker::new(Duration::from_secs(30), Duration::from_secs(3))
    }

    #[test]
    fn heartbeat_expires_after_timeout() {
        let mut presence = tracker();
        let (room, ana) = (Uuid::new_v4(), Uuid::new_v4());
        let t0 = Instant::now();

        presence.heartbeat_at(room, ana, t0);
        assert!(presence.is_online_at(room, ana, t0 + Duration::from_secs(30)));
        assert!(!presence.is_online_at(room, ana, t0 + Duration::from_secs(31)));
    }

    #[test]
    fn heartbeat_refreshes_timer() {
        let mut presence = tracker();
        let (room, ana) = (Uuid::new_v4(), Uuid::new_v4());
        let t0 = Instant::now();

        presence.heartbeat_at(room, ana, t0);
        presence.heartbeat_at(room, ana, t0 + Duration::from_secs(20));
        assert_eq!(presence.online_at(room, t0 + Duration::from_secs(45)), vec![ana]);
    }

    #[test]
    fn typing_has_shorter_timeout() {
        let mut presence = tracker();
        let (room, ana) = (Uuid::new_v4(), Uuid::new_v4());
        let t0 = Instant::now();

        presence.set_typing_at(room, ana, true, t0);
        assert_eq!(presence.typing_at(room, t0 + Duration::from_secs(2)), vec![ana]);
        assert!(presence.typing_at(room, t0 + Duration::from_secs(4)).is_empty());
        assert_eq!(presence.online_at(room, t0 + Duration::from_secs(4)), vec![ana]);
    }

    #[test]
    fn stop_typing_clears_immediately() {
        let mut presence = tracker();
        let (room, ana) = (Uuid::new_v4(), Uuid::new_v4());
        let t0 = Instant::now();

        presence.set_typing_at(room, ana, true, t0);
        presence.set_typing_at(room, ana, false, t0);
        assert!(presence.typing_at(room, t0).is_empty());
    }

    #[test]
    fn going_offline_clears_typing() {
        let mut presence = PresenceTracker::new(Duration::from_secs(30), Duration::from_secs(60));
        let (room, ana) = (Uuid::new_v4(), Uuid::new_v4());
        let t0 = Instant::now();

        presence.set_typing_at(room, ana, true, t0);
        assert!(presence.typing_at(room, t0 + Duration::from_secs(31)).is_empty());
    }

    #[test]
    fn rooms_are_independent() {
        let mut presence = tracker();
        let (a, b, ana) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let t0 = Instant::now();

        presence.heartbeat_at(a, ana, t0);
        assert!(presence.online_at(b, t0).is_empty());
        presence.clear_room(a);
        assert!(presence.online_at(a, t0).is_empty());
    }
}
