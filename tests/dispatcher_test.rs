//! Dispatcher-level scenarios: push partial failure (spec §8 scenario 6),
//! pull deduplication, and state aggregation.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use mokkoji_sync::dispatcher::{EventPushData, PullRequest, PushAction, PushRequest, SyncDispatcher};
use mokkoji_sync::engine::SyncEngine;
use mokkoji_sync::lease::{LeaseRegistry, SyncTriple};
use mokkoji_sync::models::ProviderCapabilities;
use mokkoji_sync::providers::registry::ProviderRegistry;
use serial_test::serial;
use uuid::Uuid;

use common::{encrypt_for, FakeProvider, TestFixture};

fn build_dispatcher(
    db: sqlx::PgPool,
    fake: Arc<FakeProvider>,
    leases: Arc<LeaseRegistry>,
) -> SyncDispatcher {
    let providers = Arc::new(ProviderRegistry::new(Duration::from_secs(5)).with_provider("fake", fake));
    let engine = Arc::new(SyncEngine::new(db.clone(), Arc::clone(&providers), common::encryptor()));
    SyncDispatcher::new(db, engine, providers, leases)
}

#[tokio::test]
#[serial]
async fn scenario_6_push_delete_unsupported_does_not_abort_batch() {
    let fixture = TestFixture::new().await;
    let user_id = Uuid::new_v4();
    let connection_id = Uuid::new_v4();
    let token = encrypt_for(&connection_id, "plaintext-access-token");
    fixture
        .insert_connection(connection_id, user_id, "fake", Some(&token), true)
        .await;

    let fake = Arc::new(FakeProvider::new(ProviderCapabilities {
        read: false,
        write: true,
        delta: false,
    }));
    fake.queue_delete(Err(mokkoji_sync::providers::SyncError::Unsupported(
        "delete not supported".to_string(),
    )));

    let leases = Arc::new(LeaseRegistry::new(Duration::from_secs(60)));
    let dispatcher = build_dispatcher(fixture.db.clone(), Arc::clone(&fake), leases);

    let request = PushRequest {
        connection_id,
        events: vec![
            EventPushData {
                local_id: "local-delete".to_string(),
                external_event_id: Some("evt-1".to_string()),
                external_calendar_id: "primary".to_string(),
                title: "to delete".to_string(),
                description: None,
                start_utc: Utc.with_ymd_and_hms(2026, 3, 5, 9, 0, 0).unwrap(),
                end_utc: None,
                all_day: false,
                location: None,
                recurrence_rule: None,
                attendees: Vec::new(),
                action: PushAction::Delete,
            },
            EventPushData {
                local_id: "local-create".to_string(),
                external_event_id: None,
                external_calendar_id: "primary".to_string(),
                title: "new event".to_string(),
                description: None,
                start_utc: Utc.with_ymd_and_hms(2026, 3, 5, 9, 0, 0).unwrap(),
                end_utc: None,
                all_day: false,
                location: None,
                recurrence_rule: None,
                attendees: Vec::new(),
                action: PushAction::Create,
            },
        ],
    };

    let response = dispatcher.push(user_id, request).await.unwrap();
    assert_eq!(response.results.len(), 2);

    let delete_result = response
        .results
        .iter()
        .find(|r| r.local_id == "local-delete")
        .unwrap();
    assert!(!delete_result.success);
    assert!(delete_result.error.is_some());

    let create_result = response
        .results
        .iter()
        .find(|r| r.local_id == "local-create")
        .unwrap();
    assert!(create_result.success);
}

#[tokio::test]
#[serial]
async fn push_delete_without_external_event_id_fails_without_adapter_call() {
    let fixture = TestFixture::new().await;
    let user_id = Uuid::new_v4();
    let connection_id = Uuid::new_v4();
    let token = encrypt_for(&connection_id, "plaintext-access-token");
    fixture
        .insert_connection(connection_id, user_id, "fake", Some(&token), true)
        .await;

    let fake = Arc::new(FakeProvider::new(ProviderCapabilities {
        read: false,
        write: true,
        delta: false,
    }));
    // No delete response queued - if the adapter were called, the fallback
    // `Ok(())` would make this event incorrectly succeed.
    let leases = Arc::new(LeaseRegistry::new(Duration::from_secs(60)));
    let dispatcher = build_dispatcher(fixture.db.clone(), Arc::clone(&fake), leases);

    let request = PushRequest {
        connection_id,
        events: vec![EventPushData {
            local_id: "local-1".to_string(),
            external_event_id: None,
            external_calendar_id: "primary".to_string(),
            title: "x".to_string(),
            description: None,
            start_utc: Utc.with_ymd_and_hms(2026, 3, 5, 9, 0, 0).unwrap(),
            end_utc: None,
            all_day: false,
            location: None,
            recurrence_rule: None,
            attendees: Vec::new(),
            action: PushAction::Delete,
        }],
    };

    let response = dispatcher.push(user_id, request).await.unwrap();
    assert_eq!(response.results.len(), 1);
    assert!(!response.results[0].success);
    assert!(response.results[0]
        .error
        .as_deref()
        .unwrap()
        .contains("external_event_id"));
    assert_eq!(fake.delete_call_count.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
#[serial]
async fn pull_deduplicates_in_flight_triple() {
    let fixture = TestFixture::new().await;
    let user_id = Uuid::new_v4();
    let connection_id = Uuid::new_v4();
    let token = encrypt_for(&connection_id, "plaintext-access-token");
    fixture
        .insert_connection(connection_id, user_id, "fake", Some(&token), true)
        .await;

    let fake = Arc::new(FakeProvider::new(ProviderCapabilities {
        read: true,
        write: false,
        delta: false,
    }));
    let leases = Arc::new(LeaseRegistry::new(Duration::from_secs(60)));

    let triple = SyncTriple {
        user_id,
        connection_id,
        external_calendar_id: "primary".to_string(),
    };
    let held_guard = leases.try_acquire(triple).expect("lease should be free");

    let dispatcher = build_dispatcher(fixture.db.clone(), fake, Arc::clone(&leases));
    let response = dispatcher
        .pull(
            user_id,
            PullRequest {
                connection_ids: vec![connection_id],
                calendar_ids: Some(vec!["primary".to_string()]),
                force_full: false,
                window_days_past: 1,
                window_days_future: 1,
            },
        )
        .await
        .unwrap();

    assert_eq!(response.results.len(), 1);
    assert!(matches!(
        response.results[0].status,
        mokkoji_sync::dispatcher::QueueStatus::AlreadyRunning
    ));

    drop(held_guard);
}

#[tokio::test]
#[serial]
async fn state_reports_connection_health_and_calendar_cursors() {
    let fixture = TestFixture::new().await;
    let user_id = Uuid::new_v4();
    let connection_id = Uuid::new_v4();
    let token = encrypt_for(&connection_id, "plaintext-access-token");
    fixture
        .insert_connection(connection_id, user_id, "fake", Some(&token), true)
        .await;
    fixture
        .insert_sync_state(user_id, connection_id, "primary", Some("d1"), None)
        .await;

    let fake = Arc::new(FakeProvider::new(ProviderCapabilities {
        read: true,
        write: false,
        delta: true,
    }));
    let leases = Arc::new(LeaseRegistry::new(Duration::from_secs(60)));
    let dispatcher = build_dispatcher(fixture.db.clone(), fake, leases);

    let views = dispatcher.state(user_id).await.unwrap();
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].connection_id, connection_id);
    assert_eq!(views[0].calendars.len(), 1);
    assert!(views[0].calendars[0].has_delta_token);
}
