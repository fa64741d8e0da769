use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

/// The six life axes, seeded with fixed ids so clients can hardcode them.
const AXES: &[(&str, &str, &str, &str, &str)] = &[
    ("00000000-0000-0000-0000-00000000a001", "physical", "Physical", "Física", "#A6C26F"),
    ("00000000-0000-0000-0000-00000000a002", "mental", "Mental", "Mental", "#365D8C"),
    ("00000000-0000-0000-0000-00000000a003", "emotional", "Emotional", "Emocional", "#D396A6"),
    ("00000000-0000-0000-0000-00000000a004", "social", "Social", "Social", "#6F8C8C"),
    ("00000000-0000-0000-0000-00000000a005", "spiritual", "Spiritual", "Espiritual", "#C85729"),
    ("00000000-0000-0000-0000-00000000a006", "material", "Material", "Material", "#B78B5C"),
];

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (chat schema)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id          TEXT PRIMARY KEY,
                username    TEXT NOT NULL UNIQUE,
                password    TEXT NOT NULL,
                created_at  TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE rooms (
                id          TEXT PRIMARY KEY,
                kind        TEXT NOT NULL,
                name        TEXT,
                owner_id    TEXT NOT NULL REFERENCES users(id),
                created_at  TEXT NOT NULL,
                deleted_at  TEXT
            );

            CREATE TABLE participants (
                room_id     TEXT NOT NULL REFERENCES rooms(id),
                user_id     TEXT NOT NULL REFERENCES users(id),
                role        TEXT NOT NULL DEFAULT 'member',
                joined_at   TEXT NOT NULL,
                PRIMARY KEY (room_id, user_id)
            );

            CREATE INDEX idx_participants_user ON participants(user_id);

            CREATE TABLE messages (
                id          TEXT PRIMARY KEY,
                room_id     TEXT NOT NULL REFERENCES rooms(id),
                sender_id   TEXT NOT NULL REFERENCES users(id),
                body        TEXT NOT NULL,
                kind        TEXT NOT NULL DEFAULT 'text',
                reply_to    TEXT,
                created_at  TEXT NOT NULL,
                edited_at   TEXT,
                deleted_at  TEXT
            );

            CREATE INDEX idx_messages_room ON messages(room_id, created_at, id);

            CREATE TABLE attachments (
                id          TEXT PRIMARY KEY,
                message_id  TEXT NOT NULL REFERENCES messages(id),
                file_name   TEXT NOT NULL,
                size_bytes  INTEGER NOT NULL,
                mime_type   TEXT NOT NULL
            );

            CREATE INDEX idx_attachments_message ON attachments(message_id);

            CREATE TABLE reactions (
                id          TEXT PRIMARY KEY,
                message_id  TEXT NOT NULL REFERENCES messages(id),
                user_id     TEXT NOT NULL REFERENCES users(id),
                emoji       TEXT NOT NULL,
                created_at  TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE(message_id, user_id, emoji)
            );

            CREATE INDEX idx_reactions_message ON reactions(message_id);

            CREATE TABLE mentions (
                message_id  TEXT NOT NULL REFERENCES messages(id),
                user_id     TEXT NOT NULL REFERENCES users(id),
                PRIMARY KEY (message_id, user_id)
            );

            CREATE INDEX idx_mentions_user ON mentions(user_id);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    if version < 2 {
        info!("Running migration v2 (wellness schema)");
        conn.execute_batch(
            "
            CREATE TABLE categories (
                id          TEXT PRIMARY KEY,
                slug        TEXT NOT NULL UNIQUE,
                name        TEXT NOT NULL,
                color       TEXT NOT NULL,
                position    INTEGER NOT NULL
            );

            CREATE TABLE checkins (
                id          TEXT PRIMARY KEY,
                user_id     TEXT NOT NULL REFERENCES users(id),
                category_id TEXT NOT NULL REFERENCES categories(id),
                date        TEXT NOT NULL,
                completed   INTEGER NOT NULL,
                updated_at  TEXT NOT NULL,
                UNIQUE(user_id, category_id, date)
            );

            CREATE INDEX idx_checkins_date ON checkins(date, category_id);

            CREATE TABLE time_blocks (
                id               TEXT PRIMARY KEY,
                user_id          TEXT NOT NULL REFERENCES users(id),
                date             TEXT NOT NULL,
                category_id      TEXT REFERENCES categories(id),
                activity         TEXT NOT NULL,
                start_time       TEXT NOT NULL,
                duration_minutes INTEGER NOT NULL,
                end_time         TEXT NOT NULL,
                status           TEXT NOT NULL DEFAULT 'planned'
            );

            CREATE INDEX idx_time_blocks_user_date ON time_blocks(user_id, date);

            INSERT INTO schema_version (version) VALUES (2);
            ",
        )?;

        let mut stmt = conn.prepare(
            "INSERT OR IGNORE INTO categories (id, slug, name, color, position) VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for (position, (id, slug, en, es, color)) in AXES.iter().enumerate() {
            let name = serde_json::json!({ "en": en, "es": es }).to_string();
            stmt.execute(rusqlite::params![id, slug, name, color, position as i64])?;
        }
    }

    if version < 3 {
        info!("Running migration v3 (billing schema)");
        conn.execute_batch(
            "
            CREATE TABLE subscriptions (
                user_id     TEXT PRIMARY KEY REFERENCES users(id),
                status      TEXT NOT NULL,
                plan        TEXT,
                updated_at  TEXT NOT NULL
            );

            CREATE TABLE webhook_events (
                id          TEXT PRIMARY KEY,
                kind        TEXT NOT NULL,
                received_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            INSERT INTO schema_version (version) VALUES (3);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
