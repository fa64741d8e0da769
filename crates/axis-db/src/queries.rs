use crate::models::{
    AttachmentRow, MessageRow, NewMessage, ParticipantRow, ReactionRow, RoomRow, UserRow,
};
use crate::{Database, conflict_on_unique, format_ts};
use anyhow::{Result, anyhow};
use rusqlite::{Connection, Row};

/// Soft-deleted messages keep their row but never return their body.
const MESSAGE_COLUMNS: &str = "m.id, m.room_id, m.sender_id, u.username, \
     CASE WHEN m.deleted_at IS NULL THEN m.body ELSE '' END, \
     m.kind, m.reply_to, m.created_at, m.edited_at, m.deleted_at";

impl Database {
    // -- Users --

    pub fn create_user(&self, id: &str, username: &str, password_hash: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, password) VALUES (?1, ?2, ?3)",
                (id, username, password_hash),
            )
            .map_err(|e| conflict_on_unique(e, "username"))?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username", username))
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    // -- Rooms --

    /// Creates a room with `owner_id` as admin and `member_ids` as members.
    pub fn create_room(
        &self,
        id: &str,
        kind: &str,
        name: Option<&str>,
        owner_id: &str,
        member_ids: &[String],
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.unchecked_transaction()?;
            let now = format_ts(&chrono::Utc::now());
            tx.execute(
                "INSERT INTO rooms (id, kind, name, owner_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id, kind, name, owner_id, now],
            )?;
            tx.execute(
                "INSERT INTO participants (room_id, user_id, role, joined_at) VALUES (?1, ?2, 'admin', ?3)",
                rusqlite::params![id, owner_id, now],
            )?;
            for member in member_ids.iter().filter(|m| m.as_str() != owner_id) {
                tx.execute(
                    "INSERT OR IGNORE INTO participants (room_id, user_id, role, joined_at) VALUES (?1, ?2, 'member', ?3)",
                    rusqlite::params![id, member, now],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Live (not deleted) room by id.
    pub fn get_room(&self, id: &str) -> Result<Option<RoomRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, kind, name, owner_id, created_at FROM rooms WHERE id = ?1 AND deleted_at IS NULL",
                [id],
                room_from_row,
            )
            .optional()
        })
    }

    pub fn list_rooms_for_user(&self, user_id: &str) -> Result<Vec<RoomRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT r.id, r.kind, r.name, r.owner_id, r.created_at
                 FROM rooms r
                 JOIN participants p ON p.room_id = r.id
                 WHERE p.user_id = ?1 AND r.deleted_at IS NULL
                 ORDER BY r.created_at DESC",
            )?;
            let rows = stmt
                .query_map([user_id], room_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Soft-deletes a room. Its messages stay in place.
    pub fn delete_room(&self, id: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE rooms SET deleted_at = ?2 WHERE id = ?1 AND deleted_at IS NULL",
                rusqlite::params![id, format_ts(&chrono::Utc::now())],
            )?;
            Ok(changed > 0)
        })
    }

    // -- Participants --

    pub fn get_participant(&self, room_id: &str, user_id: &str) -> Result<Option<ParticipantRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT p.room_id, p.user_id, u.username, p.role, p.joined_at
                 FROM participants p
                 JOIN users u ON u.id = p.user_id
                 WHERE p.room_id = ?1 AND p.user_id = ?2",
                [room_id, user_id],
                participant_from_row,
            )
            .optional()
        })
    }

    pub fn list_participants(&self, room_id: &str) -> Result<Vec<ParticipantRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT p.room_id, p.user_id, u.username, p.role, p.joined_at
                 FROM participants p
                 JOIN users u ON u.id = p.user_id
                 WHERE p.room_id = ?1
                 ORDER BY p.joined_at, u.username",
            )?;
            let rows = stmt
                .query_map([room_id], participant_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Returns false when the user was already a participant.
    pub fn add_participant(&self, room_id: &str, user_id: &str, role: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO participants (room_id, user_id, role, joined_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![room_id, user_id, role, format_ts(&chrono::Utc::now())],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn remove_participant(&self, room_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "DELETE FROM participants WHERE room_id = ?1 AND user_id = ?2",
                [room_id, user_id],
            )?;
            Ok(changed > 0)
        })
    }

    // -- Messages --

    /// Inserts a message with its attachments and mentions in one transaction.
    pub fn insert_message(&self, msg: &NewMessage<'_>) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.unchecked_transaction()?;
            let id = msg.id.to_string();
            tx.execute(
                "INSERT INTO messages (id, room_id, sender_id, body, kind, reply_to, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    id,
                    msg.room_id.to_string(),
                    msg.sender_id.to_string(),
                    msg.body,
                    msg.kind,
                    msg.reply_to.map(|r| r.to_string()),
                    format_ts(&msg.created_at),
                ],
            )?;
            for a in msg.attachments {
                tx.execute(
                    "INSERT INTO attachments (id, message_id, file_name, size_bytes, mime_type) VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![
                        a.id.to_string(),
                        id,
                        a.file_name,
                        i64::try_from(a.size_bytes)?,
                        a.mime_type,
                    ],
                )?;
            }
            for user_id in msg.mentioned_user_ids {
                tx.execute(
                    "INSERT OR IGNORE INTO mentions (message_id, user_id) VALUES (?1, ?2)",
                    [&id, &user_id.to_string()],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages m LEFT JOIN users u ON m.sender_id = u.id WHERE m.id = ?1"
                ),
                [id],
                message_from_row,
            )
            .optional()
        })
    }

    /// A page of a room's messages in chronological order. With `before`
    /// (`created_at`, `id`), only messages strictly older than that position.
    pub fn get_messages(
        &self,
        room_id: &str,
        limit: u32,
        before: Option<(&str, &str)>,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| query_messages(conn, room_id, limit, before))
    }

    /// Replaces the body of a live message. Returns false if it is missing or deleted.
    pub fn edit_message(&self, id: &str, body: &str, edited_at: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET body = ?2, edited_at = ?3 WHERE id = ?1 AND deleted_at IS NULL",
                [id, body, edited_at],
            )?;
            Ok(changed > 0)
        })
    }

    /// Soft-deletes a message. Returns false if it was already deleted.
    pub fn soft_delete_message(&self, id: &str, deleted_at: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET deleted_at = ?2 WHERE id = ?1 AND deleted_at IS NULL",
                [id, deleted_at],
            )?;
            Ok(changed > 0)
        })
    }

    /// Live messages in rooms the user participates in whose body contains
    /// any of `terms` (case-insensitive), newest first.
    pub fn search_messages(
        &self,
        user_id: &str,
        room_id: Option<&str>,
        terms: &[String],
        limit: u32,
    ) -> Result<Vec<MessageRow>> {
        if terms.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let like_clauses: Vec<String> = (0..terms.len())
                .map(|i| format!("lower(m.body) LIKE ?{} ESCAPE '\\'", i + 4))
                .collect();
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS}
                 FROM messages m
                 LEFT JOIN users u ON m.sender_id = u.id
                 JOIN participants p ON p.room_id = m.room_id AND p.user_id = ?1
                 JOIN rooms r ON r.id = m.room_id AND r.deleted_at IS NULL
                 WHERE m.deleted_at IS NULL
                   AND (?2 IS NULL OR m.room_id = ?2)
                   AND ({})
                 ORDER BY m.created_at DESC
                 LIMIT ?3",
                like_clauses.join(" OR ")
            );

            let patterns: Vec<String> = terms
                .iter()
                .map(|t| format!("%{}%", escape_like(&t.to_lowercase())))
                .collect();
            let mut params: Vec<&dyn rusqlite::types::ToSql> = vec![&user_id, &room_id, &limit];
            params.extend(patterns.iter().map(|p| p as &dyn rusqlite::types::ToSql));

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params.as_slice(), message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Live messages that mention `user_id`, newest first, limited to rooms
    /// the user still participates in.
    pub fn get_mentions_for_user(&self, user_id: &str, limit: u32) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS}
                 FROM mentions n
                 JOIN messages m ON m.id = n.message_id
                 LEFT JOIN users u ON m.sender_id = u.id
                 JOIN participants p ON p.room_id = m.room_id AND p.user_id = n.user_id
                 WHERE n.user_id = ?1 AND m.deleted_at IS NULL
                 ORDER BY m.created_at DESC
                 LIMIT ?2"
            ))?;
            let rows = stmt
                .query_map(rusqlite::params![user_id, limit], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Reactions --

    /// Toggle a reaction: removes if exists, inserts if not.
    /// Returns (added, Option<id>): added=true means inserted, added=false means removed.
    pub fn toggle_reaction(
        &self,
        id: &str,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<(bool, Option<String>)> {
        self.with_conn_mut(|conn| {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT id FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
                    rusqlite::params![message_id, user_id, emoji],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(existing_id) = existing {
                conn.execute("DELETE FROM reactions WHERE id = ?1", [&existing_id])?;
                Ok((false, Some(existing_id)))
            } else {
                conn.execute(
                    "INSERT INTO reactions (id, message_id, user_id, emoji) VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![id, message_id, user_id, emoji],
                )?;
                Ok((true, Some(id.to_string())))
            }
        })
    }

    /// Batch-fetch reactions for a set of message IDs.
    pub fn get_reactions_for_messages(&self, message_ids: &[String]) -> Result<Vec<ReactionRow>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let sql = format!(
                "SELECT id, message_id, user_id, emoji, created_at FROM reactions WHERE message_id IN ({}) ORDER BY created_at, id",
                placeholders(message_ids.len())
            );

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(message_ids), |row| {
                    Ok(ReactionRow {
                        id: row.get(0)?,
                        message_id: row.get(1)?,
                        user_id: row.get(2)?,
                        emoji: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    // -- Attachments --

    pub fn get_attachments_for_messages(&self, message_ids: &[String]) -> Result<Vec<AttachmentRow>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let sql = format!(
                "SELECT id, message_id, file_name, size_bytes, mime_type FROM attachments WHERE message_id IN ({})",
                placeholders(message_ids.len())
            );

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(message_ids), |row| {
                    Ok(AttachmentRow {
                        id: row.get(0)?,
                        message_id: row.get(1)?,
                        file_name: row.get(2)?,
                        size_bytes: row.get(3)?,
                        mime_type: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }
}

fn placeholders(n: usize) -> String {
    (1..=n).map(|i| format!("?{}", i)).collect::<Vec<_>>().join(", ")
}

fn escape_like(term: &str) -> String {
    term.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id, username, password, created_at FROM users WHERE {column} = ?1"
    ))?;

    stmt.query_row([value], |row| {
        Ok(UserRow {
            id: row.get(0)?,
            username: row.get(1)?,
            password: row.get(2)?,
            created_at: row.get(3)?,
        })
    })
    .optional()
}

fn query_messages(
    conn: &Connection,
    room_id: &str,
    limit: u32,
    before: Option<(&str, &str)>,
) -> Result<Vec<MessageRow>> {
    // JOIN users to fetch sender_username in a single query (eliminates N+1)
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS}
         FROM messages m
         LEFT JOIN users u ON m.sender_id = u.id
         WHERE m.room_id = ?1
           AND (?3 IS NULL OR m.created_at < ?3 OR (m.created_at = ?3 AND m.id < ?4))
         ORDER BY m.created_at DESC, m.id DESC
         LIMIT ?2"
    ))?;

    let (before_ts, before_id) = before.unzip();
    let mut rows = stmt
        .query_map(rusqlite::params![room_id, limit, before_ts, before_id], message_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.reverse();
    Ok(rows)
}

fn room_from_row(row: &Row<'_>) -> rusqlite::Result<RoomRow> {
    Ok(RoomRow {
        id: row.get(0)?,
        kind: row.get(1)?,
        name: row.get(2)?,
        owner_id: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn participant_from_row(row: &Row<'_>) -> rusqlite::Result<ParticipantRow> {
    Ok(ParticipantRow {
        room_id: row.get(0)?,
        user_id: row.get(1)?,
        username: row.get(2)?,
        role: row.get(3)?,
        joined_at: row.get(4)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        room_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_username: row.get::<_, Option<String>>(3)?.unwrap_or_else(|| "unknown".to_string()),
        body: row.get(4)?,
        kind: row.get(5)?,
        reply_to: row.get(6)?,
        created_at: row.get(7)?,
        edited_at: row.get(8)?,
        deleted_at: row.get(9)?,
    })
}

/// Extension trait for optional query results
pub(crate) trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(anyhow!(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DbError;
    use uuid::Uuid;

    fn seed_room(db: &Database) -> (String, String) {
        let owner = Uuid::new_v4().to_string();
        db.create_user(&owner, "owner", "hash").unwrap();
        let room = Uuid::new_v4().to_string();
        db.create_room(&room, "group", Some("team"), &owner, &[]).unwrap();
        (room, owner)
    }

    fn post(db: &Database, room: &str, sender: &str, body: &str, at: chrono::DateTime<chrono::Utc>) -> Uuid {
        let id = Uuid::new_v4();
        db.insert_message(&NewMessage {
            id,
            room_id: room.parse().unwrap(),
            sender_id: sender.parse().unwrap(),
            body,
            kind: "text",
            reply_to: None,
            created_at: at,
            attachments: &[],
            mentioned_user_ids: &[],
        })
        .unwrap();
        id
    }

    #[test]
    fn duplicate_username_is_a_conflict() {
        let db = Database::open_in_memory().unwrap();
        db.create_user("u1", "ana", "hash").unwrap();
        let err = db.create_user("u2", "ana", "hash").unwrap_err();
        assert!(matches!(err.downcast_ref::<DbError>(), Some(DbError::Conflict(_))));
    }

    #[test]
    fn creator_becomes_admin() {
        let db = Database::open_in_memory().unwrap();
        let (room, owner) = seed_room(&db);
        let p = db.get_participant(&room, &owner).unwrap().unwrap();
        assert_eq!(p.role, "admin");
        assert_eq!(p.username, "owner");
    }

    #[test]
    fn pages_are_chronological_with_id_tiebreak() {
        let db = Database::open_in_memory().unwrap();
        let (room, owner) = seed_room(&db);
        let t0 = chrono::Utc::now();
        let mut ids: Vec<Uuid> = (0..3).map(|i| post(&db, &room, &owner, &format!("m{i}"), t0)).collect();
        post(&db, &room, &owner, "later", t0 + chrono::Duration::seconds(1));
        ids.sort();

        let all = db.get_messages(&room, 10, None).unwrap();
        let got: Vec<String> = all.iter().map(|m| m.id.clone()).collect();
        let mut expected: Vec<String> = ids.iter().map(|i| i.to_string()).collect();
        expected.push(all[3].id.clone());
        assert_eq!(got, expected);
        assert_eq!(all[3].body, "later");

        // Page older than the second tied message
        let cursor_ts = format_ts(&t0);
        let cursor_id = ids[1].to_string();
        let older = db.get_messages(&room, 10, Some((&cursor_ts, &cursor_id))).unwrap();
        assert_eq!(older.len(), 1);
        assert_eq!(older[0].id, ids[0].to_string());
    }

    #[test]
    fn newest_page_respects_limit() {
        let db = Database::open_in_memory().unwrap();
        let (room, owner) = seed_room(&db);
        let t0 = chrono::Utc::now();
        for i in 0..5 {
            post(&db, &room, &owner, &format!("m{i}"), t0 + chrono::Duration::seconds(i));
        }
        let page = db.get_messages(&room, 2, None).unwrap();
        let bodies: Vec<&str> = page.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["m3", "m4"]);
    }

    #[test]
    fn soft_delete_is_once_only() {
        let db = Database::open_in_memory().unwrap();
        let (room, owner) = seed_room(&db);
        let id = post(&db, &room, &owner, "bye", chrono::Utc::now()).to_string();
        let now = format_ts(&chrono::Utc::now());
        assert!(db.soft_delete_message(&id, &now).unwrap());
        assert!(!db.soft_delete_message(&id, &now).unwrap());
        assert!(!db.edit_message(&id, "edited", &now).unwrap());
        let deleted = db.get_message(&id).unwrap().unwrap();
        assert!(deleted.deleted_at.is_some());
        assert_eq!(deleted.body, "");
    }

    #[test]
    fn history_blanks_deleted_bodies() {
        let db = Database::open_in_memory().unwrap();
        let (room, owner) = seed_room(&db);
        let t0 = chrono::Utc::now();
        let gone = post(&db, &room, &owner, "secret plan", t0).to_string();
        post(&db, &room, &owner, "still here", t0 + chrono::Duration::seconds(1));
        assert!(db.soft_delete_message(&gone, &format_ts(&chrono::Utc::now())).unwrap());

        let page = db.get_messages(&room, 10, None).unwrap();
        let bodies: Vec<(&str, bool)> = page.iter().map(|m| (m.body.as_str(), m.deleted_at.is_some())).collect();
        assert_eq!(bodies, vec![("", true), ("still here", false)]);
    }

    #[test]
    fn reaction_toggle_adds_then_removes() {
        let db = Database::open_in_memory().unwrap();
        let (room, owner) = seed_room(&db);
        let mid = post(&db, &room, &owner, "hi", chrono::Utc::now()).to_string();

        let (added, _) = db.toggle_reaction(&Uuid::new_v4().to_string(), &mid, &owner, "🔥").unwrap();
        assert!(added);
        let (added, _) = db.toggle_reaction(&Uuid::new_v4().to_string(), &mid, &owner, "🔥").unwrap();
        assert!(!added);
        assert!(db.get_reactions_for_messages(&[mid]).unwrap().is_empty());
    }

    #[test]
    fn search_escapes_like_wildcards() {
        let db = Database::open_in_memory().unwrap();
        let (room, owner) = seed_room(&db);
        post(&db, &room, &owner, "100% done", chrono::Utc::now());
        post(&db, &room, &owner, "100 done", chrono::Utc::now());

        let hits = db.search_messages(&owner, None, &["100%".to_string()], 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].body, "100% done");
    }

    #[test]
    fn deleted_room_is_hidden() {
        let db = Database::open_in_memory().unwrap();
        let (room, owner) = seed_room(&db);
        assert!(db.delete_room(&room).unwrap());
        assert!(db.get_room(&room).unwrap().is_none());
        assert!(db.list_rooms_for_user(&owner).unwrap().is_empty());
    }
}
