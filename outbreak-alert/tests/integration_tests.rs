//! Integration tests against a real SQLite database (in-memory) with the
//! embedded migrations applied.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use outbreak_alert::channels::{AttemptResult, ChannelAdapter, OutboundMessage};
use outbreak_alert::database::{DbPool, init_pool, run_migrations};
use outbreak_alert::domain::{
    AlertEvent, AttemptKey, AttemptPatch, Channel, DeliveryAttempt, DeliveryRecord, DeliveryStatus,
    DispatchState, Location, Recipient, RiskLevel, Role,
};
use outbreak_alert::resolver::{RecipientDirectory, RecipientFilter};
use outbreak_alert::store::{DeliveryStore, GuardedUpdate, SqlxDeliveryStore};
use outbreak_alert::{CallbackOutcome, DeliveryError, OrchestratorBuilder, PipelineConfig, StatusCallback};

async fn setup_test_db() -> DbPool {
    let pool = init_pool("sqlite::memory:")
        .await
        .expect("Failed to create test pool");

    run_migrations(&pool).await.expect("Failed to run migrations");

    pool
}

struct FixedDirectory {
    recipients: Vec<Recipient>,
    stale: Mutex<Vec<String>>,
}

#[async_trait]
impl RecipientDirectory for FixedDirectory {
    async fn list_recipients(&self, _filter: &RecipientFilter) -> outbreak_alert::Result<Vec<Recipient>> {
        Ok(self.recipients.clone())
    }

    async fn report_stale_address(
        &self,
        _recipient_id: &str,
        _channel: Channel,
        address: &str,
        _reason: &str,
    ) -> outbreak_alert::Result<()> {
        self.stale.lock().push(address.to_string());
        Ok(())
    }
}

/// Accepts every message; provider ids are `{channel}-{recipient_id}`.
struct AcceptingAdapter {
    channel: Channel,
}

#[async_trait]
impl ChannelAdapter for AcceptingAdapter {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send_batch(&self, items: Vec<OutboundMessage>) -> Vec<AttemptResult> {
        items
            .iter()
            .map(|item| {
                AttemptResult::sent(
                    item,
                    Some(format!("{}-{}", self.channel, item.recipient_id)),
                    Some("queued".to_string()),
                )
            })
            .collect()
    }
}

fn sample_record() -> DeliveryRecord {
    let alert = AlertEvent::new(RiskLevel::High, 0.92)
        .with_id("alert-db-1")
        .with_factors(["pH anomaly"])
        .with_recommendations(["Boil drinking water"]);
    let mut record = DeliveryRecord::new(alert);
    for next in [
        DispatchState::Resolving,
        DispatchState::Rendering,
        DispatchState::Dispatching,
        DispatchState::Aggregating,
    ] {
        record.advance(next).unwrap();
    }

    let mut sms = DeliveryAttempt::pending(
        "hw-1",
        Channel::Sms,
        "+919800000001",
        "outbreak_alert",
        Some("high".to_string()),
    );
    sms.apply(
        &AttemptPatch::new()
            .status(DeliveryStatus::Sent)
            .provider_message_id("SM100")
            .provider_status("queued"),
    );
    record.push_attempt(sms);

    let mut push = DeliveryAttempt::pending(
        "hw-1",
        Channel::Push,
        "fGx1:APA91b-hw1",
        "outbreak_alert",
        Some("high".to_string()),
    );
    push.fail(DeliveryError::Timeout {
        channel: Channel::Push,
    });
    record.push_attempt(push);

    record.advance(DispatchState::Completed).unwrap();
    record
}

mod database_tests {
    use super::*;

    #[tokio::test]
    async fn test_database_migrations() {
        let pool = setup_test_db().await;

        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .fetch_all(&pool)
                .await
                .expect("Failed to query tables");

        let table_names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        assert!(table_names.contains(&"delivery_record"), "delivery_record table missing");
        assert!(table_names.contains(&"delivery_attempt"), "delivery_attempt table missing");
    }

    #[tokio::test]
    async fn test_save_and_get_record() {
        let store = SqlxDeliveryStore::new(setup_test_db().await);
        let record = sample_record();

        store.save(&record).await.unwrap();
        let loaded = store.get_record("alert-db-1").await.unwrap().unwrap();

        assert_eq!(loaded.alert_id(), "alert-db-1");
        assert_eq!(loaded.state, DispatchState::Completed);
        assert_eq!(loaded.attempts.len(), 2);
        assert_eq!(loaded.attempts[0].channel, Channel::Sms);
        assert_eq!(loaded.attempts[1].channel, Channel::Push);
        assert_eq!(
            loaded.attempts[1].error,
            Some(DeliveryError::Timeout {
                channel: Channel::Push
            })
        );
        assert_eq!(loaded.alert.contributing_factors, vec!["pH anomaly".to_string()]);

        assert!(store.get_record("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_is_idempotent() {
        let store = SqlxDeliveryStore::new(setup_test_db().await);
        let record = sample_record();

        store.save(&record).await.unwrap();
        store.save(&record).await.unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM delivery_attempt WHERE alert_id = ?")
            .bind("alert-db-1")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_update_attempt_and_lookup() {
        let store = SqlxDeliveryStore::new(setup_test_db().await);
        store.save(&sample_record()).await.unwrap();

        let key = store
            .find_attempt_by_provider_message_id("SM100")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(key, AttemptKey::new("alert-db-1", "hw-1", Channel::Sms));
        assert!(store.find_attempt_by_provider_message_id("SM999").await.unwrap().is_none());

        // Late push result clears the timeout error.
        let push_key = AttemptKey::new("alert-db-1", "hw-1", Channel::Push);
        let patch = AttemptPatch::new()
            .status(DeliveryStatus::Sent)
            .provider_message_id("projects/p/messages/1");
        assert!(store.update_attempt(&push_key, &patch).await.unwrap());
        assert!(store.update_attempt(&push_key, &patch).await.unwrap());

        let loaded = store.get_record("alert-db-1").await.unwrap().unwrap();
        let push = loaded.attempt("hw-1", Channel::Push).unwrap();
        assert_eq!(push.status, DeliveryStatus::Sent);
        assert!(push.error.is_none());
        assert_eq!(push.provider_message_id.as_deref(), Some("projects/p/messages/1"));

        let unknown = AttemptKey::new("alert-db-1", "nobody", Channel::Sms);
        assert!(!store.update_attempt(&unknown, &patch).await.unwrap());
    }

    #[tokio::test]
    async fn test_guarded_update_keeps_final_status() {
        let store = SqlxDeliveryStore::new(setup_test_db().await);
        store.save(&sample_record()).await.unwrap();
        let key = AttemptKey::new("alert-db-1", "hw-1", Channel::Sms);

        let delivered = AttemptPatch::new().provider_status("delivered");
        assert_eq!(
            store.update_attempt_if_newer(&key, &delivered, 3).await.unwrap(),
            GuardedUpdate::Applied
        );

        // A late "sent" must not overwrite "delivered".
        let sent = AttemptPatch::new().provider_status("sent");
        assert_eq!(
            store.update_attempt_if_newer(&key, &sent, 2).await.unwrap(),
            GuardedUpdate::Superseded
        );

        let loaded = store.get_record("alert-db-1").await.unwrap().unwrap();
        let sms = loaded.attempt("hw-1", Channel::Sms).unwrap();
        assert_eq!(sms.provider_status.as_deref(), Some("delivered"));

        // Attempts with no provider status yet accept any ranked status.
        let push_key = AttemptKey::new("alert-db-1", "hw-1", Channel::Push);
        assert_eq!(
            store.update_attempt_if_newer(&push_key, &sent, 2).await.unwrap(),
            GuardedUpdate::Applied
        );
    }
}

mod pipeline_tests {
    use super::*;

    async fn build_pipeline(directory: Arc<FixedDirectory>) -> outbreak_alert::DeliveryOrchestrator {
        let store: Arc<dyn DeliveryStore> = Arc::new(SqlxDeliveryStore::new(setup_test_db().await));
        OrchestratorBuilder::new(PipelineConfig::default())
            .directory(directory)
            .store(store)
            .adapter(Arc::new(AcceptingAdapter {
                channel: Channel::Sms,
            }))
            .adapter(Arc::new(AcceptingAdapter {
                channel: Channel::Push,
            }))
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_persists_record() {
        let directory = Arc::new(FixedDirectory {
            recipients: vec![
                Recipient::new("hw-1", Role::HealthWorker)
                    .with_channel(Channel::Sms, "+919800000001")
                    .with_channel(Channel::Push, "fGx1:APA91b-hw1"),
                Recipient::new("cz-1", Role::Citizen).with_channel(Channel::Email, "cz1@mail.example"),
            ],
            stale: Mutex::new(Vec::new()),
        });
        let orchestrator = build_pipeline(directory).await;

        let alert = AlertEvent::from_oracle_json(
            r#"{
                "alert_id": "alert-e2e-1",
                "risk_level": "high",
                "confidence": 0.92,
                "contributing_factors": ["pH anomaly"],
                "recommendations": ["Boil drinking water"],
                "location": {"lat": 26.1445, "lng": 91.7362},
                "timestamp": "2024-06-01T08:30:00Z"
            }"#,
        )
        .unwrap();
        let record = orchestrator.dispatch(alert).await.unwrap();

        assert_eq!(record.attempts.len(), 3);
        let email = record.attempt("cz-1", Channel::Email).unwrap();
        assert_eq!(
            email.error,
            Some(DeliveryError::ChannelUnavailable {
                channel: Channel::Email
            })
        );

        let stored = orchestrator
            .store()
            .get_record("alert-e2e-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.attempts.len(), 3);
        assert_eq!(stored.state, DispatchState::Completed);
        let location = stored.alert.location.unwrap();
        assert!(location.distance_km(&Location::new(26.1445, 91.7362)) < 0.001);
    }

    #[tokio::test]
    async fn test_status_callback_round_trip() {
        let directory = Arc::new(FixedDirectory {
            recipients: vec![Recipient::new("hw-1", Role::HealthWorker).with_channel(Channel::Sms, "+919800000001")],
            stale: Mutex::new(Vec::new()),
        });
        let orchestrator = build_pipeline(directory).await;
        orchestrator
            .dispatch(AlertEvent::new(RiskLevel::Medium, 0.75).with_id("alert-cb-1"))
            .await
            .unwrap();

        let payload: StatusCallback =
            serde_json::from_str(r#"{"MessageSid": "sms-hw-1", "MessageStatus": "delivered"}"#).unwrap();
        let outcome = orchestrator.handle_status_callback(payload).await.unwrap();
        assert_eq!(
            outcome,
            CallbackOutcome::Applied(AttemptKey::new("alert-cb-1", "hw-1", Channel::Sms))
        );

        let duplicate = orchestrator
            .handle_status_callback(StatusCallback::new("sms-hw-1", "delivered"))
            .await
            .unwrap();
        assert_eq!(duplicate, CallbackOutcome::Ignored);

        let stored = orchestrator
            .store()
            .get_record("alert-cb-1")
            .await
            .unwrap()
            .unwrap();
        let sms = stored.attempt("hw-1", Channel::Sms).unwrap();
        assert_eq!(sms.status, DeliveryStatus::Sent);
        assert_eq!(sms.provider_status.as_deref(), Some("delivered"));
        assert_eq!(sms.variant.as_deref(), Some("medium"));
    }
}
