use anyhow::Result;
use rusqlite::Connection;

use crate::queries::OptionalExt;
use crate::{Database, format_ts};

/// Subscription change carried by a billing event.
#[derive(Debug, Clone, Copy)]
pub struct SubscriptionUpdate<'a> {
    pub user_id: &'a str,
    pub status: &'a str,
    pub plan: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// The event id was already in the ledger; nothing was written.
    Duplicate,
    /// Recorded, but there was no subscription change to make (or its user is gone).
    Recorded,
    /// Recorded and the subscription row updated.
    Applied,
}

impl Database {
    /// Claims the event id in the ledger and applies `update` in the same
    /// transaction, so concurrent deliveries of one event apply it once.
    pub fn apply_webhook_event(
        &self,
        id: &str,
        kind: &str,
        update: Option<SubscriptionUpdate<'_>>,
    ) -> Result<WebhookOutcome> {
        self.with_conn_mut(|conn| {
            let tx = conn.unchecked_transaction()?;
            let claimed = tx.execute(
                "INSERT OR IGNORE INTO webhook_events (id, kind) VALUES (?1, ?2)",
                [id, kind],
            )?;
            if claimed == 0 {
                return Ok(WebhookOutcome::Duplicate);
            }

            let mut outcome = WebhookOutcome::Recorded;
            if let Some(update) = update {
                let known: Option<i64> = tx
                    .query_row("SELECT 1 FROM users WHERE id = ?1", [update.user_id], |row| row.get(0))
                    .optional()?;
                if known.is_some() {
                    upsert_subscription(&tx, &update)?;
                    outcome = WebhookOutcome::Applied;
                }
            }
            tx.commit()?;
            Ok(outcome)
        })
    }

    /// (status, plan, updated_at) for a user, if they ever subscribed.
    pub fn get_subscription(&self, user_id: &str) -> Result<Option<(String, Option<String>, String)>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT status, plan, updated_at FROM subscriptions WHERE user_id = ?1",
                [user_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
        })
    }
}

/// Last-write-wins upsert; a missing plan keeps the stored one.
fn upsert_subscription(conn: &Connection, update: &SubscriptionUpdate<'_>) -> Result<()> {
    conn.execute(
        "INSERT INTO subscriptions (user_id, status, plan, updated_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(user_id) DO UPDATE SET
            status = excluded.status,
            plan = COALESCE(excluded.plan, subscriptions.plan),
            updated_at = excluded.updated_at",
        rusqlite::params![update.user_id, update.status, update.plan, format_ts(&chrono::Utc::now())],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payer(db: &Database) -> String {
        let uid = uuid::Uuid::new_v4().to_string();
        db.create_user(&uid, "payer", "hash").unwrap();
        uid
    }

    fn change<'a>(user_id: &'a str, status: &'a str, plan: Option<&'a str>) -> Option<SubscriptionUpdate<'a>> {
        Some(SubscriptionUpdate { user_id, status, plan })
    }

    #[test]
    fn replayed_event_is_not_applied_again() {
        let db = Database::open_in_memory().unwrap();
        let uid = payer(&db);

        let first = db
            .apply_webhook_event("evt_1", "customer.subscription.updated", change(&uid, "active", Some("premium")))
            .unwrap();
        assert_eq!(first, WebhookOutcome::Applied);

        // Same id carrying a different status must not overwrite the row
        let again = db
            .apply_webhook_event("evt_1", "customer.subscription.updated", change(&uid, "past_due", None))
            .unwrap();
        assert_eq!(again, WebhookOutcome::Duplicate);
        let (status, _, _) = db.get_subscription(&uid).unwrap().unwrap();
        assert_eq!(status, "active");
    }

    #[test]
    fn unknown_user_is_recorded_without_a_row() {
        let db = Database::open_in_memory().unwrap();
        let ghost = uuid::Uuid::new_v4().to_string();

        let outcome = db
            .apply_webhook_event("evt_2", "checkout.session.completed", change(&ghost, "active", None))
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Recorded);
        assert!(db.get_subscription(&ghost).unwrap().is_none());
        assert_eq!(
            db.apply_webhook_event("evt_2", "checkout.session.completed", None).unwrap(),
            WebhookOutcome::Duplicate
        );
    }

    #[test]
    fn subscription_upsert_keeps_plan() {
        let db = Database::open_in_memory().unwrap();
        let uid = payer(&db);

        db.apply_webhook_event("evt_a", "customer.subscription.created", change(&uid, "active", Some("premium")))
            .unwrap();
        db.apply_webhook_event("evt_b", "customer.subscription.deleted", change(&uid, "canceled", None))
            .unwrap();

        let (status, plan, _) = db.get_subscription(&uid).unwrap().unwrap();
        assert_eq!(status, "canceled");
        assert_eq!(plan.as_deref(), Some("premium"));
    }
}
