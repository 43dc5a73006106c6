//! End-to-end drain scenarios against the in-memory store.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use common::{NOW, RecordingTransport, orchestrator, queued_config};
use hookrelay_delivery::{
    DeliveryConfig, DeliveryError, DeliveryLogStorage, DeliveryQueueStorage, Destination,
    DestinationStorage, DrainOutcome, DrainReport, DrainRequest, EventRef, FailureNotifier,
    HealthState, IdRange, InMemoryUsers, InMemoryWebhookStorage, LogMailer, ManualClock,
    QueueEntry, User, codec,
};
use serde_json::json;
use time::Duration;

const DEST: i64 = 7;

async fn storage_with(destination: Destination, rows: i64) -> Arc<InMemoryWebhookStorage> {
    let storage = Arc::new(InMemoryWebhookStorage::new());
    let id = destination.id;
    storage.upsert_destination(destination).await;
    for row in 1..=rows {
        storage
            .append(
                id,
                &EventRef::new(format!("evt-{row}"), "contact.updated"),
                &json!({ "row": row }),
                NOW,
            )
            .await
            .unwrap();
    }
    storage
}

fn destination() -> Destination {
    let mut d = Destination::new(DEST, "CRM sync", "https://crm.example.com/hooks");
    d.secret = Some("s3cret".into());
    d
}

fn completed(outcome: DrainOutcome) -> DrainReport {
    match outcome {
        DrainOutcome::Completed(report) => report,
        other => panic!("expected a completed drain, got {other:?}"),
    }
}

async fn reload(storage: &InMemoryWebhookStorage) -> Destination {
    storage.get(DEST).await.unwrap().unwrap()
}

#[tokio::test]
async fn test_successful_batch_deletes_all_rows() {
    let clock = ManualClock::new(NOW);
    let storage = storage_with(destination(), 3).await;
    let transport = Arc::new(RecordingTransport::new().respond(200));
    let users = Arc::new(InMemoryUsers::new());
    let notifier = FailureNotifier::new(
        Arc::new(queued_config()),
        Arc::new(clock.clone()),
        storage.clone(),
        users.clone(),
        users.clone(),
        Arc::new(LogMailer),
    );
    let drain = orchestrator(queued_config(), &clock, &storage, &transport).with_notifier(notifier);

    let report = completed(drain.run(DrainRequest::default()).await.unwrap());

    assert_eq!(report.destinations, 1);
    assert_eq!(report.batches, 1);
    assert_eq!(report.delivered, 3);
    assert!(storage.entries_for(DEST).await.is_empty());
    assert_eq!(reload(&storage).await.health, HealthState::Healthy);
    assert!(users.inbox().await.is_empty());

    let calls = transport.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].url, "https://crm.example.com/hooks");
    assert_eq!(calls[0].secret.as_deref(), Some("s3cret"));
    assert_eq!(
        calls[0].payload["contact.updated"],
        json!([{ "row": 1 }, { "row": 2 }, { "row": 3 }])
    );
    assert_eq!(calls[0].payload["timestamp"], "2024-06-03T14:00:00Z");
}

#[tokio::test]
async fn test_failed_batch_keeps_rows_and_marks_unhealthy() {
    let clock = ManualClock::new(NOW);
    let storage = storage_with(destination(), 1).await;
    let transport = Arc::new(RecordingTransport::new().respond(500).respond(500));
    let config = DeliveryConfig {
        webhook_retry_delay: 0,
        ..queued_config()
    };
    let drain = orchestrator(config, &clock, &storage, &transport);

    let report = completed(drain.run(DrainRequest::default()).await.unwrap());
    assert_eq!(report.failed, 1);
    assert_eq!(report.delivered, 0);

    let rows = storage.entries_for(DEST).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].retries, 1);
    assert_eq!(
        reload(&storage).await.health,
        HealthState::Unhealthy {
            since: NOW,
            last_marked: NOW,
        }
    );

    // Cooldown (300s) has passed, so the destination is tried again.
    clock.advance(Duration::minutes(10));
    completed(drain.run(DrainRequest::default()).await.unwrap());

    let rows = storage.entries_for(DEST).await;
    assert_eq!(rows[0].retries, 2);
    let reloaded = reload(&storage).await;
    assert_eq!(
        reloaded.health,
        HealthState::Unhealthy {
            since: NOW,
            last_marked: NOW + Duration::minutes(10),
        }
    );
    assert_eq!(reloaded.consecutive_failures, 2);
}

#[tokio::test]
async fn test_recovery_closes_the_outage() {
    let clock = ManualClock::new(NOW);
    let mut d = destination();
    d.health = HealthState::Unhealthy {
        since: NOW - Duration::hours(3),
        last_marked: NOW - Duration::minutes(6),
    };
    d.consecutive_failures = 4;
    let storage = storage_with(d, 2).await;
    let transport = Arc::new(RecordingTransport::new());
    let drain = orchestrator(queued_config(), &clock, &storage, &transport);

    completed(drain.run(DrainRequest::default()).await.unwrap());

    let reloaded = reload(&storage).await;
    assert_eq!(reloaded.health, HealthState::Healthy);
    assert_eq!(reloaded.consecutive_failures, 0);
}

#[tokio::test]
async fn test_unhealthy_destination_is_skipped_during_cooldown() {
    let clock = ManualClock::new(NOW);
    let mut d = destination();
    d.health = HealthState::Unhealthy {
        since: NOW - Duration::seconds(10),
        last_marked: NOW - Duration::seconds(10),
    };
    let storage = storage_with(d, 1).await;
    let transport = Arc::new(RecordingTransport::new());
    let drain = orchestrator(queued_config(), &clock, &storage, &transport);

    let outcome = drain.run(DrainRequest::default()).await.unwrap();
    assert_eq!(outcome, DrainOutcome::NoEligibleDestinations);
    assert!(transport.calls().is_empty());
}

#[tokio::test]
async fn test_no_published_destinations() {
    let clock = ManualClock::new(NOW);
    let mut d = destination();
    d.published = false;
    let storage = storage_with(d, 2).await;
    let transport = Arc::new(RecordingTransport::new());
    let drain = orchestrator(queued_config(), &clock, &storage, &transport);

    assert_eq!(
        drain.run(DrainRequest::default()).await.unwrap(),
        DrainOutcome::NoEligibleDestinations
    );
    assert_eq!(
        drain
            .run(DrainRequest {
                destination_id: Some(DEST),
                range: None,
            })
            .await
            .unwrap(),
        DrainOutcome::NoEligibleDestinations
    );
}

#[tokio::test]
async fn test_empty_queue_completes_without_posting() {
    let clock = ManualClock::new(NOW);
    let storage = storage_with(destination(), 0).await;
    let transport = Arc::new(RecordingTransport::new());
    let drain = orchestrator(queued_config(), &clock, &storage, &transport);

    let DrainOutcome::Completed(report) = drain.run(DrainRequest::default()).await.unwrap() else {
        panic!("an empty queue is a completed run");
    };
    assert_eq!(report.destinations, 0);
    assert_eq!(report.batches, 0);
    assert!(transport.calls().is_empty());
}

#[tokio::test]
async fn test_unknown_destination_is_an_error() {
    let clock = ManualClock::new(NOW);
    let storage = storage_with(destination(), 1).await;
    let transport = Arc::new(RecordingTransport::new());
    let drain = orchestrator(queued_config(), &clock, &storage, &transport);

    let result = drain
        .run(DrainRequest {
            destination_id: Some(999),
            range: None,
        })
        .await;
    assert!(matches!(result, Err(DeliveryError::DestinationNotFound(999))));
}

#[tokio::test]
async fn test_immediate_mode_leaves_queue_alone() {
    let clock = ManualClock::new(NOW);
    let storage = storage_with(destination(), 2).await;
    let transport = Arc::new(RecordingTransport::new());
    let drain = orchestrator(DeliveryConfig::default(), &clock, &storage, &transport);

    assert_eq!(
        drain.run(DrainRequest::default()).await.unwrap(),
        DrainOutcome::NotQueuedMode
    );
    assert_eq!(storage.entries_for(DEST).await.len(), 2);
}

#[tokio::test]
async fn test_default_mode_drains_consecutive_batches() {
    let clock = ManualClock::new(NOW);
    let storage = storage_with(destination(), 25).await;
    let transport = Arc::new(RecordingTransport::new());
    let drain = orchestrator(queued_config(), &clock, &storage, &transport);

    let report = completed(drain.run(DrainRequest::default()).await.unwrap());
    assert_eq!(report.batches, 3);
    assert_eq!(report.delivered, 25);
    assert_eq!(transport.posted_rows(), (1..=25).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_range_windows_visit_the_same_rows_as_one_call() {
    let config = DeliveryConfig {
        webhook_limit: 10,
        ..queued_config()
    };

    // Three windows [0,9] [10,19] [20,29] in one range-mode run.
    let clock = ManualClock::new(NOW);
    let storage = storage_with(destination(), 35).await;
    let windowed = Arc::new(RecordingTransport::new());
    let drain = orchestrator(config.clone(), &clock, &storage, &windowed);
    let report = completed(
        drain
            .run(DrainRequest {
                destination_id: Some(DEST),
                range: Some(IdRange::new(0, 29)),
            })
            .await
            .unwrap(),
    );
    assert_eq!(report.batches, 3);

    // The same range as separate job invocations, one per window.
    let split_storage = storage_with(destination(), 35).await;
    let split = Arc::new(RecordingTransport::new());
    let split_drain = orchestrator(config.clone(), &clock, &split_storage, &split);
    for (min, max) in [(20, 29), (0, 9), (10, 19)] {
        split_drain
            .run(DrainRequest {
                destination_id: Some(DEST),
                range: Some(IdRange::new(min, max)),
            })
            .await
            .unwrap();
    }

    // One call over the whole range with no window limit.
    let whole_storage = storage_with(destination(), 35).await;
    let whole = Arc::new(RecordingTransport::new());
    let whole_drain = orchestrator(
        DeliveryConfig {
            webhook_limit: 1000,
            ..config
        },
        &clock,
        &whole_storage,
        &whole,
    );
    let report = completed(
        whole_drain
            .run(DrainRequest {
                destination_id: Some(DEST),
                range: Some(IdRange::new(0, 29)),
            })
            .await
            .unwrap(),
    );
    assert_eq!(report.batches, 1);

    let mut windowed_rows = windowed.posted_rows();
    let mut split_rows = split.posted_rows();
    let whole_rows = whole.posted_rows();
    assert_eq!(whole_rows, (1..=29).collect::<Vec<_>>());
    windowed_rows.sort();
    split_rows.sort();
    assert_eq!(windowed_rows, whole_rows);
    assert_eq!(split_rows, whole_rows);

    // Rows outside the range stay queued.
    let left: BTreeSet<_> = storage.entries_for(DEST).await.iter().map(|r| r.id).collect();
    assert_eq!(left, (30..=35).collect::<BTreeSet<_>>());
}

#[tokio::test]
async fn test_failed_window_stops_the_range() {
    let clock = ManualClock::new(NOW);
    let storage = storage_with(destination(), 30).await;
    let transport = Arc::new(RecordingTransport::new().respond(200).respond(503));
    let drain = orchestrator(queued_config(), &clock, &storage, &transport);

    let report = completed(
        drain
            .run(DrainRequest {
                destination_id: Some(DEST),
                range: Some(IdRange::new(1, 30)),
            })
            .await
            .unwrap(),
    );
    assert_eq!(report.batches, 2);
    assert_eq!(report.delivered, 10);
    assert_eq!(report.failed, 10);
    assert_eq!(storage.entries_for(DEST).await.len(), 20);
}

#[tokio::test]
async fn test_time_limit_stops_new_batches() {
    let clock = ManualClock::new(NOW);
    let storage = storage_with(destination(), 35).await;
    let transport = Arc::new(RecordingTransport::ticking(clock.clone(), Duration::seconds(400)));
    let config = DeliveryConfig {
        webhook_time_limit: 600,
        ..queued_config()
    };
    let drain = orchestrator(config, &clock, &storage, &transport);

    let report = completed(drain.run(DrainRequest::default()).await.unwrap());
    assert!(report.time_limit_reached);
    assert_eq!(report.batches, 2);
    assert_eq!(report.delivered, 20);
    assert_eq!(storage.entries_for(DEST).await.len(), 15);
}

#[tokio::test]
async fn test_oversized_durations_do_not_overflow() {
    let clock = ManualClock::new(NOW);
    let storage = storage_with(destination(), 3).await;
    let transport = Arc::new(RecordingTransport::new());
    let config = DeliveryConfig {
        webhook_time_limit: u64::MAX,
        webhook_retry_delay: u64::MAX,
        webhook_lease_time: u64::MAX,
        ..queued_config()
    };
    let drain = orchestrator(config, &clock, &storage, &transport);
    let report = completed(drain.run(DrainRequest::default()).await.unwrap());
    assert_eq!(report.delivered, 3);
    assert!(!report.time_limit_reached);

    let mut d = destination();
    d.health = HealthState::Unhealthy {
        since: NOW - Duration::days(30),
        last_marked: NOW - Duration::days(30),
    };
    let storage = storage_with(d, 1).await;
    let config = DeliveryConfig {
        webhook_health_check_time: u64::MAX,
        ..queued_config()
    };
    let drain = orchestrator(config, &clock, &storage, &transport);
    assert_eq!(
        drain.run(DrainRequest::default()).await.unwrap(),
        DrainOutcome::NoEligibleDestinations
    );
}

#[tokio::test]
async fn test_retry_delay_hides_failed_rows() {
    let clock = ManualClock::new(NOW);
    let storage = storage_with(destination(), 1).await;
    let transport = Arc::new(RecordingTransport::new().respond(500));
    let config = DeliveryConfig {
        webhook_health_check_time: 0,
        ..queued_config()
    };
    let drain = orchestrator(config, &clock, &storage, &transport);

    completed(drain.run(DrainRequest::default()).await.unwrap());

    clock.advance(Duration::minutes(30));
    let report = completed(drain.run(DrainRequest::default()).await.unwrap());
    assert_eq!(report.batches, 0);
    assert_eq!(transport.calls().len(), 1);

    clock.advance(Duration::minutes(31));
    let report = completed(drain.run(DrainRequest::default()).await.unwrap());
    assert_eq!(report.delivered, 1);
}

#[tokio::test]
async fn test_rows_at_retry_ceiling_are_dropped() {
    let clock = ManualClock::new(NOW);
    let storage = storage_with(destination(), 0).await;
    storage
        .insert_raw_entry(QueueEntry {
            id: 1,
            destination_id: DEST,
            event: EventRef::new("evt-1", "contact.updated"),
            payload: Some(codec::compress(r#"{"row":1}"#).unwrap()),
            date_added: NOW - Duration::days(2),
            date_modified: Some(NOW - Duration::days(1)),
            retries: 2,
            claimed_until: None,
        })
        .await;
    storage
        .insert_raw_entry(QueueEntry {
            id: 2,
            destination_id: DEST,
            event: EventRef::new("evt-2", "contact.updated"),
            payload: Some(codec::compress(r#"{"row":2}"#).unwrap()),
            date_added: NOW - Duration::hours(1),
            date_modified: None,
            retries: 0,
            claimed_until: None,
        })
        .await;
    let transport = Arc::new(RecordingTransport::new().respond(500));
    let config = DeliveryConfig {
        webhook_max_retries: 3,
        ..queued_config()
    };
    let drain = orchestrator(config, &clock, &storage, &transport);

    let report = completed(drain.run(DrainRequest::default()).await.unwrap());
    assert_eq!(report.dropped, 1);
    assert_eq!(report.failed, 1, "dropped rows are not counted as failed");
    let left = storage.entries_for(DEST).await;
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].id, 2);
    assert_eq!(left[0].retries, 1);
}

#[tokio::test]
async fn test_consecutive_failures_unpublish_destination() {
    let clock = ManualClock::new(NOW);
    let mut d = destination();
    d.consecutive_failures = 2;
    let storage = storage_with(d, 1).await;
    let transport = Arc::new(RecordingTransport::new().respond(500));
    let config = DeliveryConfig {
        webhook_disable_limit: 2,
        ..queued_config()
    };
    let drain = orchestrator(config, &clock, &storage, &transport);

    let report = completed(drain.run(DrainRequest::default()).await.unwrap());
    assert_eq!(report.disabled, 1);
    assert!(!reload(&storage).await.published);
}

#[tokio::test]
async fn test_auto_unpublish_can_be_turned_off() {
    let clock = ManualClock::new(NOW);
    let mut d = destination();
    d.consecutive_failures = 2;
    let storage = storage_with(d, 1).await;
    let transport = Arc::new(RecordingTransport::new().respond(500));
    let config = DeliveryConfig {
        webhook_disable_limit: 2,
        disable_auto_unpublish: true,
        ..queued_config()
    };
    let drain = orchestrator(config, &clock, &storage, &transport);

    let report = completed(drain.run(DrainRequest::default()).await.unwrap());
    assert_eq!(report.disabled, 0);
    assert!(reload(&storage).await.published);
}

#[tokio::test]
async fn test_private_address_unpublishes_immediately() {
    let clock = ManualClock::new(NOW);
    let storage = storage_with(destination(), 1).await;
    let transport = Arc::new(
        RecordingTransport::new().fail(DeliveryError::PrivateAddress("10.0.0.8".into())),
    );
    let drain = orchestrator(queued_config(), &clock, &storage, &transport);

    let report = completed(drain.run(DrainRequest::default()).await.unwrap());
    assert_eq!(report.disabled, 1);

    let reloaded = reload(&storage).await;
    assert!(!reloaded.published);
    assert!(!reloaded.health.is_healthy(NOW));
    assert_eq!(storage.entries_for(DEST).await[0].retries, 1);

    let logs = storage.list_logs(DEST, 10).await.unwrap();
    assert_eq!(logs[0].status_code, None);
    assert!(logs[0].note.contains("10.0.0.8"));
}

#[tokio::test]
async fn test_transport_error_is_recovered() {
    let clock = ManualClock::new(NOW);
    let storage = storage_with(destination(), 1).await;
    let transport = Arc::new(
        RecordingTransport::new().fail(DeliveryError::Transport("operation timed out".into())),
    );
    let drain = orchestrator(queued_config(), &clock, &storage, &transport);

    let report = completed(drain.run(DrainRequest::default()).await.unwrap());
    assert_eq!(report.failed, 1);
    assert!(reload(&storage).await.published);
}

#[tokio::test]
async fn test_delivery_log_is_pruned() {
    let clock = ManualClock::new(NOW);
    let storage = storage_with(destination(), 12).await;
    let transport = Arc::new(RecordingTransport::new());
    let config = DeliveryConfig {
        webhook_limit: 2,
        webhook_log_max: 3,
        ..queued_config()
    };
    let drain = orchestrator(config, &clock, &storage, &transport);

    let report = completed(drain.run(DrainRequest::default()).await.unwrap());
    assert_eq!(report.batches, 6);

    let logs = storage.list_logs(DEST, 100).await.unwrap();
    assert_eq!(logs.len(), 3);
    assert!(logs.iter().all(|log| log.status_code == Some(200)));
}

#[tokio::test]
async fn test_sustained_outage_alerts_once() {
    let clock = ManualClock::new(NOW);
    let mut d = destination();
    d.created_by = Some(1);
    d.health = HealthState::Unhealthy {
        since: NOW - Duration::hours(2),
        last_marked: NOW - Duration::minutes(6),
    };
    let storage = storage_with(d, 1).await;
    let users = Arc::new(InMemoryUsers::new());
    users
        .add_user(
            User {
                id: 1,
                name: "owner".into(),
                email: "owner@example.com".into(),
            },
            false,
        )
        .await;
    let transport = Arc::new(RecordingTransport::new().respond(500).respond(500));
    let config = DeliveryConfig {
        webhook_retry_delay: 0,
        ..queued_config()
    };
    let notifier = FailureNotifier::new(
        Arc::new(config.clone()),
        Arc::new(clock.clone()),
        storage.clone(),
        users.clone(),
        users.clone(),
        Arc::new(LogMailer),
    );
    let drain = orchestrator(config, &clock, &storage, &transport).with_notifier(notifier);

    completed(drain.run(DrainRequest::default()).await.unwrap());
    clock.advance(Duration::minutes(10));
    completed(drain.run(DrainRequest::default()).await.unwrap());

    assert_eq!(transport.calls().len(), 2);
    let inbox = users.inbox().await;
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].user_id, 1);
    assert!(inbox[0].message.contains("HTTP 500"));
    assert_eq!(reload(&storage).await.last_notification_sent_at, Some(NOW));
}
