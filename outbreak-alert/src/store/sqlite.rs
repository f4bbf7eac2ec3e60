//! SQLite delivery store.

use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::debug;

use super::{DeliveryStore, GuardedUpdate};
use crate::database::models::{DeliveryAttemptDbModel, DeliveryRecordDbModel};
use crate::database::retry::BusyRetry;
use crate::database::time::datetime_to_ms;
use crate::domain::{AttemptKey, AttemptPatch, DeliveryRecord};
use crate::{Error, Result};

/// Patch one attempt by key. `?9` is an optional rank guard: when set, the row
/// is only touched if its current provider status ranks lower. The CASE mirrors
/// `provider_status_rank`; unset or unknown statuses rank -1.
const PATCH_ATTEMPT_SQL: &str = r#"
    UPDATE delivery_attempt SET
        status = COALESCE(?1, status),
        provider_message_id = COALESCE(?2, provider_message_id),
        provider_status = COALESCE(?3, provider_status),
        error = CASE WHEN ?1 = 'sent' THEN ?4 ELSE COALESCE(?4, error) END,
        updated_at = ?5
    WHERE alert_id = ?6 AND recipient_id = ?7 AND channel = ?8
      AND (?9 IS NULL OR COALESCE(
            CASE provider_status
                WHEN 'accepted' THEN 0 WHEN 'scheduled' THEN 0 WHEN 'queued' THEN 0
                WHEN 'sending' THEN 1
                WHEN 'sent' THEN 2
                WHEN 'delivered' THEN 3 WHEN 'read' THEN 3
                WHEN 'undelivered' THEN 3 WHEN 'failed' THEN 3 WHEN 'canceled' THEN 3
            END, -1) < ?9)
"#;

/// SQLx implementation of [`DeliveryStore`].
pub struct SqlxDeliveryStore {
    pool: SqlitePool,
    busy_retry: BusyRetry,
}

impl SqlxDeliveryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            busy_retry: BusyRetry::default(),
        }
    }

    pub fn with_busy_retry(mut self, busy_retry: BusyRetry) -> Self {
        self.busy_retry = busy_retry;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run [`PATCH_ATTEMPT_SQL`]; returns whether a row changed.
    async fn patch_attempt(&self, key: &AttemptKey, patch: &AttemptPatch, min_rank: Option<u8>) -> Result<bool> {
        let status = patch.status.map(|s| s.to_string());
        let error = patch
            .error
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let channel = key.channel.to_string();
        let updated_at = datetime_to_ms(patch.updated_at);
        let min_rank = min_rank.map(i64::from);

        let pool = &self.pool;
        let (status, error, channel) = (&status, &error, &channel);
        let result = self
            .busy_retry
            .run("patch_delivery_attempt", move || async move {
                sqlx::query(PATCH_ATTEMPT_SQL)
                    .bind(status)
                    .bind(&patch.provider_message_id)
                    .bind(&patch.provider_status)
                    .bind(error)
                    .bind(updated_at)
                    .bind(&key.alert_id)
                    .bind(&key.recipient_id)
                    .bind(channel)
                    .bind(min_rank)
                    .execute(pool)
                    .await
                    .map_err(Error::from)
            })
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn attempt_exists(&self, key: &AttemptKey) -> Result<bool> {
        let (exists,): (i64,) = sqlx::query_as(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM delivery_attempt
                WHERE alert_id = ? AND recipient_id = ? AND channel = ?
            )
            "#,
        )
        .bind(&key.alert_id)
        .bind(&key.recipient_id)
        .bind(key.channel.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(exists != 0)
    }

    async fn save_once(
        pool: &SqlitePool,
        record: &DeliveryRecordDbModel,
        attempts: &[DeliveryAttemptDbModel],
    ) -> Result<()> {
        let mut tx = pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO delivery_record
                (alert_id, risk_level, state, alert, stale_addresses, started_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(alert_id) DO UPDATE SET
                risk_level = excluded.risk_level,
                state = excluded.state,
                alert = excluded.alert,
                stale_addresses = excluded.stale_addresses,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at
            "#,
        )
        .bind(&record.alert_id)
        .bind(&record.risk_level)
        .bind(&record.state)
        .bind(&record.alert)
        .bind(&record.stale_addresses)
        .bind(record.started_at)
        .bind(record.completed_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM delivery_attempt WHERE alert_id = ?")
            .bind(&record.alert_id)
            .execute(&mut *tx)
            .await?;

        for attempt in attempts {
            sqlx::query(
                r#"
                INSERT INTO delivery_attempt
                    (alert_id, recipient_id, channel, position, address, template, variant,
                     status, provider_message_id, provider_status, error, attempted_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&attempt.alert_id)
            .bind(&attempt.recipient_id)
            .bind(&attempt.channel)
            .bind(attempt.position)
            .bind(&attempt.address)
            .bind(&attempt.template)
            .bind(&attempt.variant)
            .bind(&attempt.status)
            .bind(&attempt.provider_message_id)
            .bind(&attempt.provider_status)
            .bind(&attempt.error)
            .bind(attempt.attempted_at)
            .bind(attempt.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl DeliveryStore for SqlxDeliveryStore {
    async fn save(&self, record: &DeliveryRecord) -> Result<()> {
        let record_row = DeliveryRecordDbModel::from_record(record)?;
        let attempt_rows = record
            .attempts
            .iter()
            .enumerate()
            .map(|(position, attempt)| {
                DeliveryAttemptDbModel::from_attempt(record.alert_id(), position, attempt)
            })
            .collect::<Result<Vec<_>>>()?;

        let pool = &self.pool;
        let record_row = &record_row;
        let attempt_rows = attempt_rows.as_slice();
        self.busy_retry
            .run("save_delivery_record", move || {
                Self::save_once(pool, record_row, attempt_rows)
            })
            .await?;

        debug!(
            alert_id = %record.alert_id(),
            attempts = record.attempts.len(),
            "Saved delivery record"
        );
        Ok(())
    }

    async fn update_attempt(&self, key: &AttemptKey, patch: &AttemptPatch) -> Result<bool> {
        self.patch_attempt(key, patch, None).await
    }

    async fn update_attempt_if_newer(
        &self,
        key: &AttemptKey,
        patch: &AttemptPatch,
        rank: u8,
    ) -> Result<GuardedUpdate> {
        if self.patch_attempt(key, patch, Some(rank)).await? {
            return Ok(GuardedUpdate::Applied);
        }
        // Nothing changed; tell a missing row apart from a stale callback.
        if self.attempt_exists(key).await? {
            Ok(GuardedUpdate::Superseded)
        } else {
            Ok(GuardedUpdate::NotFound)
        }
    }

    async fn find_attempt_by_provider_message_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<AttemptKey>> {
        let row: Option<(String, String, String)> = sqlx::query_as(
            r#"
            SELECT alert_id, recipient_id, channel FROM delivery_attempt
            WHERE provider_message_id = ?
            LIMIT 1
            "#,
        )
        .bind(provider_message_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(alert_id, recipient_id, channel)| -> Result<AttemptKey> {
            let channel = channel
                .parse()
                .map_err(|_| Error::Other(format!("Unknown channel '{}'", channel)))?;
            Ok(AttemptKey::new(alert_id, recipient_id, channel))
        })
        .transpose()
    }

    async fn get_record(&self, alert_id: &str) -> Result<Option<DeliveryRecord>> {
        let Some(row) = sqlx::query_as::<_, DeliveryRecordDbModel>(
            "SELECT * FROM delivery_record WHERE alert_id = ?",
        )
        .bind(alert_id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let attempts = sqlx::query_as::<_, DeliveryAttemptDbModel>(
            "SELECT * FROM delivery_attempt WHERE alert_id = ? ORDER BY position",
        )
        .bind(alert_id)
        .fetch_all(&self.pool)
        .await?;

        row.into_record(attempts).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{init_pool, run_migrations};
    use crate::domain::{AlertEvent, Channel, DeliveryAttempt, RiskLevel, provider_status_rank};

    async fn store_with_attempt() -> (SqlxDeliveryStore, AttemptKey) {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        let store = SqlxDeliveryStore::new(pool).with_busy_retry(BusyRetry::disabled());

        let mut record = DeliveryRecord::new(AlertEvent::new(RiskLevel::High, 0.9).with_id("alert-sql-1"));
        record.push_attempt(DeliveryAttempt::pending("r1", Channel::Sms, "+15550001111", "outbreak_alert", None));
        store.save(&record).await.unwrap();
        (store, AttemptKey::new("alert-sql-1", "r1", Channel::Sms))
    }

    #[tokio::test]
    async fn test_sql_rank_guard_matches_domain_ranks() {
        let (store, key) = store_with_attempt().await;

        for status in [
            "accepted", "scheduled", "queued", "sending", "sent", "delivered", "read",
            "undelivered", "failed", "canceled",
        ] {
            let rank = provider_status_rank(status).unwrap();
            // Reset to an unranked status so the next write always lands.
            store
                .update_attempt(&key, &AttemptPatch::new().provider_status("unknown"))
                .await
                .unwrap();
            assert_eq!(
                store
                    .update_attempt_if_newer(&key, &AttemptPatch::new().provider_status(status), rank)
                    .await
                    .unwrap(),
                GuardedUpdate::Applied,
                "{status}"
            );

            let same = store
                .update_attempt_if_newer(&key, &AttemptPatch::new().provider_status(status), rank)
                .await
                .unwrap();
            assert_eq!(same, GuardedUpdate::Superseded, "{status} stored, same rank again");

            if rank < 3 {
                let next = store
                    .update_attempt_if_newer(&key, &AttemptPatch::new().provider_status(status), rank + 1)
                    .await
                    .unwrap();
                assert_eq!(next, GuardedUpdate::Applied, "{status} stored, higher rank");
            }
        }
    }

    #[tokio::test]
    async fn test_guarded_update_on_missing_attempt() {
        let (store, _) = store_with_attempt().await;
        let missing = AttemptKey::new("alert-sql-1", "nobody", Channel::Sms);
        let outcome = store
            .update_attempt_if_newer(&missing, &AttemptPatch::new().provider_status("sent"), 2)
            .await
            .unwrap();
        assert_eq!(outcome, GuardedUpdate::NotFound);
    }
}
