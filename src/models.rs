//! Provider-neutral data model (spec §3)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single attendee on a calendar event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attendee {
    pub email: String,
    pub name: Option<String>,
    pub status: String,
}

/// Normalized, provider-neutral calendar event as returned by an adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub external_event_id: Option<String>,
    pub external_calendar_id: String,
    pub title: String,
    pub description: Option<String>,
    pub start_utc: DateTime<Utc>,
    pub end_utc: Option<DateTime<Utc>>,
    pub all_day: bool,
    pub location: Option<String>,
    pub recurrence_rule: Option<String>,
    pub attendees: Vec<Attendee>,
    pub external_updated_at: DateTime<Utc>,
    pub external_version: Option<String>,
    pub deleted: bool,
}

/// Row as persisted in the local Event Store (superset of `CalendarEvent`).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StoredEvent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub source_platform: String,
    pub external_calendar_id: Option<String>,
    pub external_event_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub start_utc: DateTime<Utc>,
    pub end_utc: Option<DateTime<Utc>>,
    pub all_day: bool,
    pub location: Option<String>,
    pub recurrence_rule: Option<String>,
    pub attendees: serde_json::Value,
    pub external_updated_at: Option<DateTime<Utc>>,
    pub external_version: Option<String>,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// `sync_status` values for `ExternalConnection`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Idle,
    Syncing,
    Error,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for SyncStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(SyncStatus::Idle),
            "syncing" => Ok(SyncStatus::Syncing),
            "error" => Ok(SyncStatus::Error),
            other => Err(crate::error::Error::Other(format!(
                "unknown sync_status: {other}"
            ))),
        }
    }
}

/// A user's link to an external calendar provider.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ExternalConnection {
    pub id: Uuid,
    pub user_id: Uuid,
    pub platform_type: String,
    pub access_token_encrypted: Option<String>,
    pub refresh_token_encrypted: Option<String>,
    pub sync_enabled: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub sync_status: String,
    pub last_error: Option<String>,
    pub consecutive_full_sync_failures: i16,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Durable per-(user, connection, calendar) incremental-sync cursor.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SyncState {
    pub id: Uuid,
    pub user_id: Uuid,
    pub connection_id: Uuid,
    pub external_calendar_id: String,
    pub delta_token: Option<String>,
    pub updated_min: Option<DateTime<Utc>>,
    pub last_window_start: Option<DateTime<Utc>>,
    pub last_window_end: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable capability triple advertised by an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    pub read: bool,
    pub write: bool,
    pub delta: bool,
}

impl ProviderCapabilities {
    pub const NONE: ProviderCapabilities = ProviderCapabilities {
        read: false,
        write: false,
        delta: false,
    };
}

/// Request-scoped knobs for a single sync invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOptions {
    pub force_full: bool,
    pub window_days_past: i64,
    pub window_days_future: i64,
    pub max_retries: u32,
    pub batch_size: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            force_full: false,
            window_days_past: 90,
            window_days_future: 180,
            max_retries: 3,
            batch_size: 200,
        }
    }
}

impl SyncOptions {
    /// Validate boundary rules from spec §8: days must be in range, not zero/negative.
    pub fn validate(&self) -> crate::error::Result<()> {
        if !(1..=365).contains(&self.window_days_past) {
            return Err(crate::error::Error::Other(
                "window_days_past must be in 1..=365".into(),
            ));
        }
        if !(1..=730).contains(&self.window_days_future) {
            return Err(crate::error::Error::Other(
                "window_days_future must be in 1..=730".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(crate::error::Error::Other(
                "batch_size must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

/// Calendar summary as returned by `list_calendars`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarMeta {
    pub external_calendar_id: String,
    pub name: Option<String>,
}

/// Outcome of one `sync_calendar` invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub success: bool,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub error: Option<String>,
}
