//! End-to-end scenarios from spec §8, against a real Postgres container
//! and a scripted fake provider standing in for the network.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use mokkoji_sync::engine::SyncEngine;
use mokkoji_sync::models::{Attendee, CalendarEvent, ProviderCapabilities, SyncOptions};
use mokkoji_sync::providers::registry::ProviderRegistry;
use mokkoji_sync::providers::{FetchResult, SyncError};
use serial_test::serial;
use uuid::Uuid;

use common::{encrypt_for, FakeProvider, TestFixture};

fn sample_event(external_event_id: &str, title: &str, updated_at: chrono::DateTime<Utc>) -> CalendarEvent {
    CalendarEvent {
        external_event_id: Some(external_event_id.to_string()),
        external_calendar_id: "primary".to_string(),
        title: title.to_string(),
        description: None,
        start_utc: Utc.with_ymd_and_hms(2026, 3, 5, 9, 0, 0).unwrap(),
        end_utc: Some(Utc.with_ymd_and_hms(2026, 3, 5, 10, 0, 0).unwrap()),
        all_day: false,
        location: None,
        recurrence_rule: None,
        attendees: vec![Attendee {
            email: "a@example.com".to_string(),
            name: None,
            status: "accepted".to_string(),
        }],
        external_updated_at: updated_at,
        external_version: None,
        deleted: false,
    }
}

fn engine_with_fake(db: sqlx::PgPool, fake: Arc<FakeProvider>) -> SyncEngine {
    let providers = Arc::new(
        ProviderRegistry::new(Duration::from_secs(5)).with_provider("fake", fake),
    );
    SyncEngine::new(db, providers, common::encryptor())
}

async fn seed_connection(fixture: &TestFixture, user_id: Uuid, connection_id: Uuid) {
    let token = encrypt_for(&connection_id, "plaintext-access-token");
    fixture
        .insert_connection(connection_id, user_id, "fake", Some(&token), true)
        .await;
}

#[tokio::test]
#[serial]
async fn scenario_1_cold_sync_inserts_events_and_advances_state() {
    let fixture = TestFixture::new().await;
    let user_id = Uuid::new_v4();
    let connection_id = Uuid::new_v4();
    seed_connection(&fixture, user_id, connection_id).await;

    let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
    let fake = Arc::new(FakeProvider::new(ProviderCapabilities {
        read: true,
        write: false,
        delta: true,
    }));
    fake.queue_fetch(Ok(FetchResult {
        events: vec![
            sample_event("evt-1", "Standup", t0),
            sample_event("evt-2", "Review", t0),
        ],
        next_delta_token: Some("d1".to_string()),
        max_updated_at: Some(t0),
        has_more: false,
    }));

    let engine = engine_with_fake(fixture.db.clone(), Arc::clone(&fake));
    let outcome = engine
        .sync_calendar(user_id, connection_id, "primary", &SyncOptions::default())
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.created, 2);

    let state = fixture.fetch_sync_state(user_id, connection_id, "primary").await;
    assert_eq!(state.delta_token.as_deref(), Some("d1"));
    assert_eq!(state.updated_min, Some(t0));

    let (status, last_error) = fixture.connection_status(connection_id).await;
    assert_eq!(status, "idle");
    assert!(last_error.is_none());
}

#[tokio::test]
#[serial]
async fn scenario_2_conflict_remote_wins_when_strictly_newer() {
    let fixture = TestFixture::new().await;
    let user_id = Uuid::new_v4();
    let connection_id = Uuid::new_v4();
    seed_connection(&fixture, user_id, connection_id).await;

    let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
    let t1 = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
    fixture
        .insert_event(user_id, "fake", "primary", "evt-1", "A", t0, false)
        .await;

    let fake = Arc::new(FakeProvider::new(ProviderCapabilities {
        read: true,
        write: false,
        delta: false,
    }));
    fake.queue_fetch(Ok(FetchResult {
        events: vec![sample_event("evt-1", "B", t1)],
        next_delta_token: None,
        max_updated_at: Some(t1),
        has_more: false,
    }));

    let engine = engine_with_fake(fixture.db.clone(), Arc::clone(&fake));
    let outcome = engine
        .sync_calendar(user_id, connection_id, "primary", &SyncOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.updated, 1);
    let row = fixture
        .fetch_event(user_id, "fake", "primary", "evt-1")
        .await
        .unwrap();
    assert_eq!(row.title, "B");
    assert_eq!(row.external_updated_at, Some(t1));
}

#[tokio::test]
#[serial]
async fn scenario_3_conflict_stored_wins_when_remote_is_stale() {
    let fixture = TestFixture::new().await;
    let user_id = Uuid::new_v4();
    let connection_id = Uuid::new_v4();
    seed_connection(&fixture, user_id, connection_id).await;

    let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
    let t1 = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
    fixture
        .insert_event(user_id, "fake", "primary", "evt-1", "Latest", t1, false)
        .await;

    let fake = Arc::new(FakeProvider::new(ProviderCapabilities {
        read: true,
        write: false,
        delta: false,
    }));
    fake.queue_fetch(Ok(FetchResult {
        events: vec![sample_event("evt-1", "Stale", t0)],
        next_delta_token: None,
        max_updated_at: Some(t0),
        has_more: false,
    }));

    let engine = engine_with_fake(fixture.db.clone(), Arc::clone(&fake));
    let outcome = engine
        .sync_calendar(user_id, connection_id, "primary", &SyncOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.updated, 0);
    let row = fixture
        .fetch_event(user_id, "fake", "primary", "evt-1")
        .await
        .unwrap();
    assert_eq!(row.title, "Latest");
}

#[tokio::test]
#[serial]
async fn scenario_4_invalid_delta_token_retries_as_window_sync() {
    let fixture = TestFixture::new().await;
    let user_id = Uuid::new_v4();
    let connection_id = Uuid::new_v4();
    seed_connection(&fixture, user_id, connection_id).await;
    fixture
        .insert_sync_state(user_id, connection_id, "primary", Some("d_old"), None)
        .await;

    let fake = Arc::new(FakeProvider::new(ProviderCapabilities {
        read: true,
        write: false,
        delta: true,
    }));
    fake.queue_fetch(Err(SyncError::InvalidDeltaToken));
    fake.queue_fetch(Ok(FetchResult {
        events: Vec::new(),
        next_delta_token: Some("d_new".to_string()),
        max_updated_at: None,
        has_more: false,
    }));

    let engine = engine_with_fake(fixture.db.clone(), Arc::clone(&fake));
    let outcome = engine
        .sync_calendar(user_id, connection_id, "primary", &SyncOptions::default())
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(fake.fetch_call_count.load(std::sync::atomic::Ordering::SeqCst), 2);

    let state = fixture.fetch_sync_state(user_id, connection_id, "primary").await;
    assert_eq!(state.delta_token.as_deref(), Some("d_new"));
}

#[tokio::test]
#[serial]
async fn scenario_5_rate_limit_retries_then_succeeds() {
    let fixture = TestFixture::new().await;
    let user_id = Uuid::new_v4();
    let connection_id = Uuid::new_v4();
    seed_connection(&fixture, user_id, connection_id).await;

    let fake = Arc::new(FakeProvider::new(ProviderCapabilities {
        read: true,
        write: false,
        delta: false,
    }));
    fake.queue_fetch(Err(SyncError::RateLimited { retry_after: Some(1) }));
    fake.queue_fetch(Ok(FetchResult {
        events: Vec::new(),
        next_delta_token: None,
        max_updated_at: None,
        has_more: false,
    }));

    let engine = engine_with_fake(fixture.db.clone(), Arc::clone(&fake));
    let started = std::time::Instant::now();
    let outcome = engine
        .sync_calendar(user_id, connection_id, "primary", &SyncOptions::default())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(outcome.success);
    assert_eq!(fake.fetch_call_count.load(std::sync::atomic::Ordering::SeqCst), 2);
    assert!(elapsed >= Duration::from_secs(1));
}

#[tokio::test]
#[serial]
async fn max_retries_zero_fails_immediately_on_rate_limit() {
    let fixture = TestFixture::new().await;
    let user_id = Uuid::new_v4();
    let connection_id = Uuid::new_v4();
    seed_connection(&fixture, user_id, connection_id).await;

    let fake = Arc::new(FakeProvider::new(ProviderCapabilities {
        read: true,
        write: false,
        delta: false,
    }));
    fake.queue_fetch(Err(SyncError::RateLimited { retry_after: Some(5) }));

    let engine = engine_with_fake(fixture.db.clone(), Arc::clone(&fake));
    let options = SyncOptions {
        max_retries: 0,
        ..SyncOptions::default()
    };
    let result = engine
        .sync_calendar(user_id, connection_id, "primary", &options)
        .await;

    assert!(result.is_err());
    assert_eq!(fake.fetch_call_count.load(std::sync::atomic::Ordering::SeqCst), 1);

    // A single failure marks the connection error immediately (spec §4.3
    // step 10 / §7 taxonomy); the consecutive-failure counter is separate
    // bookkeeping and does not gate this.
    let (status, last_error) = fixture.connection_status(connection_id).await;
    assert_eq!(status, "error");
    assert!(last_error.is_some());
}

#[tokio::test]
#[serial]
async fn consecutive_full_sync_failure_counter_increments_per_failure() {
    let fixture = TestFixture::new().await;
    let user_id = Uuid::new_v4();
    let connection_id = Uuid::new_v4();
    seed_connection(&fixture, user_id, connection_id).await;

    let fake = Arc::new(FakeProvider::new(ProviderCapabilities {
        read: true,
        write: false,
        delta: false,
    }));
    fake.queue_fetch(Err(SyncError::Permanent("boom 1".to_string())));
    fake.queue_fetch(Err(SyncError::Permanent("boom 2".to_string())));

    let engine = engine_with_fake(fixture.db.clone(), Arc::clone(&fake));
    let options = SyncOptions {
        max_retries: 0,
        ..SyncOptions::default()
    };

    let first = engine
        .sync_calendar(user_id, connection_id, "primary", &options)
        .await;
    assert!(first.is_err());
    let (status_after_first, _) = fixture.connection_status(connection_id).await;
    assert_eq!(status_after_first, "error");

    let second = engine
        .sync_calendar(user_id, connection_id, "primary", &options)
        .await;
    assert!(second.is_err());
    let (status_after_second, last_error) = fixture.connection_status(connection_id).await;
    assert_eq!(status_after_second, "error");
    assert!(last_error.unwrap().contains("boom 2"));
}

#[tokio::test]
#[serial]
async fn applying_the_same_batch_twice_is_idempotent() {
    let fixture = TestFixture::new().await;
    let user_id = Uuid::new_v4();
    let connection_id = Uuid::new_v4();
    seed_connection(&fixture, user_id, connection_id).await;

    let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
    let fake = Arc::new(FakeProvider::new(ProviderCapabilities {
        read: true,
        write: false,
        delta: false,
    }));
    fake.queue_fetch(Ok(FetchResult {
        events: vec![sample_event("evt-1", "Standup", t0)],
        next_delta_token: None,
        max_updated_at: Some(t0),
        has_more: false,
    }));
    fake.queue_fetch(Ok(FetchResult {
        events: vec![sample_event("evt-1", "Standup", t0)],
        next_delta_token: None,
        max_updated_at: Some(t0),
        has_more: false,
    }));

    let engine = engine_with_fake(fixture.db.clone(), Arc::clone(&fake));
    let first = engine
        .sync_calendar(user_id, connection_id, "primary", &SyncOptions::default())
        .await
        .unwrap();
    let second = engine
        .sync_calendar(user_id, connection_id, "primary", &SyncOptions::default())
        .await
        .unwrap();

    assert_eq!(first.created, 1);
    assert_eq!(second.updated, 0);
    assert_eq!(second.created, 0);

    let row = fixture
        .fetch_event(user_id, "fake", "primary", "evt-1")
        .await
        .unwrap();
    assert_eq!(row.title, "Standup");
}
