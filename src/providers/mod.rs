//! Provider adapter contract and error taxonomy (spec §4.1, §7)

pub mod google;
pub mod ics;
pub mod registry;
pub mod stub;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{CalendarEvent, CalendarMeta, ProviderCapabilities};

/// Error kinds an adapter surfaces to the engine. Distinguished as variants,
/// not strings, so the retry policy can pattern-match directly.
#[derive(Debug, Error, Clone)]
pub enum SyncError {
    #[error("rate limited{}", retry_after.map(|s| format!(", retry after {s}s")).unwrap_or_default())]
    RateLimited { retry_after: Option<u64> },

    #[error("authentication expired")]
    AuthExpired,

    #[error("invalid delta token")]
    InvalidDeltaToken,

    #[error("transient error: {0}")]
    Transient(String),

    #[error("permanent error: {0}")]
    Permanent(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("connection not found")]
    ConnectionMissing,

    #[error("connection disabled")]
    ConnectionDisabled,

    #[error("unknown provider: {0}")]
    ProviderUnknown(String),
}

/// Result of one `fetch_events` call (spec §4.1).
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub events: Vec<CalendarEvent>,
    pub next_delta_token: Option<String>,
    pub max_updated_at: Option<DateTime<Utc>>,
    pub has_more: bool,
}

/// Vendor-neutral adapter contract. Adapters hold no sync state of their
/// own beyond an HTTP client pool; all cursors live in the Sync-State Store.
#[async_trait]
pub trait CalendarProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> ProviderCapabilities;

    async fn list_calendars(&self, access_token: &str) -> Result<Vec<CalendarMeta>, SyncError>;

    async fn fetch_events(
        &self,
        access_token: &str,
        calendar_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        delta_token: Option<&str>,
        updated_min: Option<DateTime<Utc>>,
    ) -> Result<FetchResult, SyncError>;

    async fn upsert_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event: &CalendarEvent,
    ) -> Result<CalendarEvent, SyncError>;

    async fn delete_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        external_event_id: &str,
    ) -> Result<(), SyncError>;

    /// Release any held resources. Stateless adapters may no-op.
    async fn close(&self) {}
}
