//! Event Upsert & Conflict Resolution pipeline (spec §4.4).
//!
//! Grounded on `original_source/.../sync_service.py::_upsert_events`,
//! translated from per-row ORM mutation into an explicit select-then-
//! branch (insert or update) inside a single transaction, matching the
//! teacher's `database/mod.rs::build_batch_insert_query` batch idiom.

use chrono::Utc;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::error::Result;
use crate::models::CalendarEvent;

/// Tally of what happened to a batch of incoming events.
#[derive(Debug, Default, Clone, Copy)]
pub struct UpsertCounts {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

/// Apply one batch of normalized events to the Event Store within `tx`.
///
/// Per-event transformation failures are logged and skipped rather than
/// aborting the batch; only a database error aborts (and is propagated so
/// the caller's transaction rolls back in full, per spec §4.4's
/// "fully commits or fully reverts" rule).
pub async fn apply_batch(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
    source_platform: &str,
    events: &[CalendarEvent],
) -> Result<UpsertCounts> {
    let mut counts = UpsertCounts::default();

    for event in events {
        match apply_one(tx, user_id, source_platform, event).await {
            Ok(Applied::Created) => counts.created += 1,
            Ok(Applied::Updated) => counts.updated += 1,
            Ok(Applied::Deleted) => counts.deleted += 1,
            Ok(Applied::Skipped) => {}
            Err(e) => {
                tracing::warn!(
                    external_event_id = ?event.external_event_id,
                    error = %e,
                    "skipping event that failed to apply"
                );
            }
        }
    }

    Ok(counts)
}

enum Applied {
    Created,
    Updated,
    Deleted,
    Skipped,
}

async fn apply_one(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
    source_platform: &str,
    incoming: &CalendarEvent,
) -> Result<Applied> {
    let Some(external_event_id) = incoming.external_event_id.as_deref() else {
        return Ok(Applied::Skipped);
    };

    let existing = sqlx::query!(
        r#"
        SELECT id, external_updated_at, deleted
        FROM events
        WHERE user_id = $1
          AND source_platform = $2
          AND external_calendar_id = $3
          AND external_event_id = $4
        "#,
        user_id,
        source_platform,
        incoming.external_calendar_id,
        external_event_id,
    )
    .fetch_optional(&mut **tx)
    .await?;

    let now = Utc::now();

    if incoming.deleted {
        return match existing {
            Some(row) => {
                sqlx::query!(
                    "UPDATE events SET deleted = true, updated_at = $1 WHERE id = $2",
                    now,
                    row.id,
                )
                .execute(&mut **tx)
                .await?;
                Ok(Applied::Deleted)
            }
            None => Ok(Applied::Skipped),
        };
    }

    if let Some(row) = &existing {
        if let Some(stored_updated_at) = row.external_updated_at {
            if incoming.external_updated_at <= stored_updated_at {
                // Last-Write-Wins: ties go to the stored row for idempotence.
                return Ok(Applied::Skipped);
            }
        }
    }

    let attendees_json = serde_json::to_value(&incoming.attendees)?;

    match existing {
        Some(row) => {
            sqlx::query!(
                r#"
                UPDATE events SET
                    title = $1, description = $2, start_utc = $3, end_utc = $4,
                    all_day = $5, location = $6, recurrence_rule = $7,
                    attendees = $8, external_updated_at = $9, external_version = $10,
                    deleted = false, updated_at = $11
                WHERE id = $12
                "#,
                incoming.title,
                incoming.description,
                incoming.start_utc,
                incoming.end_utc,
                incoming.all_day,
                incoming.location,
                incoming.recurrence_rule,
                attendees_json,
                incoming.external_updated_at,
                incoming.external_version,
                now,
                row.id,
            )
            .execute(&mut **tx)
            .await?;
            Ok(Applied::Updated)
        }
        None => {
            sqlx::query!(
                r#"
                INSERT INTO events (
                    user_id, source_platform, external_calendar_id, external_event_id,
                    title, description, start_utc, end_utc, all_day, location,
                    recurrence_rule, attendees, external_updated_at, external_version,
                    deleted, created_at, updated_at
                ) VALUES (
                    $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                    false, $15, $15
                )
                "#,
                user_id,
                source_platform,
                incoming.external_calendar_id,
                external_event_id,
                incoming.title,
                incoming.description,
                incoming.start_utc,
                incoming.end_utc,
                incoming.all_day,
                incoming.location,
                incoming.recurrence_rule,
                attendees_json,
                incoming.external_updated_at,
                incoming.external_version,
                now,
            )
            .execute(&mut **tx)
            .await?;
            Ok(Applied::Created)
        }
    }
}
