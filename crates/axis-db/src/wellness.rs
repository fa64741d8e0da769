use anyhow::Result;
use rusqlite::Row;

use crate::models::{CategoryRow, CheckInRow, TimeBlockRow};
use crate::queries::OptionalExt;
use crate::{Database, format_ts};

impl Database {
    // -- Categories --

    pub fn list_categories(&self) -> Result<Vec<CategoryRow>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, slug, name, color, position FROM categories ORDER BY position")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(CategoryRow {
                        id: row.get(0)?,
                        slug: row.get(1)?,
                        name: row.get(2)?,
                        color: row.get(3)?,
                        position: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn category_exists(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row("SELECT 1 FROM categories WHERE id = ?1", [id], |row| row.get(0))
                .optional()?;
            Ok(found.is_some())
        })
    }

    // -- Check-ins --

    /// Flips the check-in for (user, category, date). A missing row is
    /// created as completed; an existing row is updated in place.
    pub fn toggle_checkin(
        &self,
        new_id: &str,
        user_id: &str,
        category_id: &str,
        date: &str,
    ) -> Result<CheckInRow> {
        self.with_conn_mut(|conn| {
            let tx = conn.unchecked_transaction()?;
            let now = format_ts(&chrono::Utc::now());
            let updated = tx.execute(
                "UPDATE checkins SET completed = NOT completed, updated_at = ?4
                 WHERE user_id = ?1 AND category_id = ?2 AND date = ?3",
                rusqlite::params![user_id, category_id, date, now],
            )?;
            if updated == 0 {
                tx.execute(
                    "INSERT INTO checkins (id, user_id, category_id, date, completed, updated_at)
                     VALUES (?1, ?2, ?3, ?4, 1, ?5)",
                    rusqlite::params![new_id, user_id, category_id, date, now],
                )?;
            }
            let row = tx.query_row(
                "SELECT id, user_id, category_id, date, completed, updated_at
                 FROM checkins WHERE user_id = ?1 AND category_id = ?2 AND date = ?3",
                [user_id, category_id, date],
                checkin_from_row,
            )?;
            tx.commit()?;
            Ok(row)
        })
    }

    pub fn list_checkins(&self, user_id: &str, date: &str) -> Result<Vec<CheckInRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, category_id, date, completed, updated_at
                 FROM checkins WHERE user_id = ?1 AND date = ?2",
            )?;
            let rows = stmt
                .query_map([user_id, date], checkin_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Per category: how many users other than `user_id` completed it on `date`.
    pub fn resonance(&self, user_id: &str, date: &str) -> Result<Vec<(String, String, u32)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.slug, COUNT(k.id)
                 FROM categories c
                 LEFT JOIN checkins k
                   ON k.category_id = c.id AND k.date = ?2 AND k.completed = 1 AND k.user_id != ?1
                 GROUP BY c.id
                 ORDER BY c.position",
            )?;
            let rows = stmt
                .query_map([user_id, date], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Time blocks --

    pub fn insert_time_block(&self, block: &TimeBlockRow) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO time_blocks (id, user_id, date, category_id, activity, start_time, duration_minutes, end_time, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    block.id,
                    block.user_id,
                    block.date,
                    block.category_id,
                    block.activity,
                    block.start_time,
                    block.duration_minutes,
                    block.end_time,
                    block.status,
                ],
            )?;
            Ok(())
        })
    }

    pub fn list_time_blocks(&self, user_id: &str, date: &str) -> Result<Vec<TimeBlockRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, date, category_id, activity, start_time, duration_minutes, end_time, status
                 FROM time_blocks WHERE user_id = ?1 AND date = ?2
                 ORDER BY start_time",
            )?;
            let rows = stmt
                .query_map([user_id, date], time_block_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Deletes one of the user's blocks. Returns false if no such block.
    pub fn delete_time_block(&self, id: &str, user_id: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "DELETE FROM time_blocks WHERE id = ?1 AND user_id = ?2",
                [id, user_id],
            )?;
            Ok(changed > 0)
        })
    }
}

fn checkin_from_row(row: &Row<'_>) -> rusqlite::Result<CheckInRow> {
    Ok(CheckInRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        category_id: row.get(2)?,
        date: row.get(3)?,
        completed: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn time_block_from_row(row: &Row<'_>) -> rusqlite::Result<TimeBlockRow> {
    Ok(TimeBlockRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        date: row.get(2)?,
        category_id: row.get(3)?,
        activity: row.get(4)?,
        start_time: row.get(5)?,
        duration_minutes: row.get(6)?,
        end_time: row.get(7)?,
        status: row.get(8)?,
    })
}
