//! Stub adapter for providers with no API access yet.
//!
//! All capabilities false; every operation returns `Unsupported` with a
//! concrete alternative for the end user, matching the source system's
//! Kakao placeholder.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{CalendarEvent, CalendarMeta, ProviderCapabilities};

use super::{CalendarProvider, FetchResult, SyncError};

pub struct StubCalendarProvider {
    provider_name: &'static str,
}

impl StubCalendarProvider {
    pub fn new(provider_name: &'static str) -> Self {
        Self { provider_name }
    }
}

#[async_trait]
impl CalendarProvider for StubCalendarProvider {
    fn name(&self) -> &'static str {
        self.provider_name
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::NONE
    }

    async fn list_calendars(&self, _access_token: &str) -> Result<Vec<CalendarMeta>, SyncError> {
        Err(SyncError::Unsupported(format!(
            "{} calendar listing is not available yet. Use your device calendar app or export/import iCal files.",
            self.provider_name
        )))
    }

    async fn fetch_events(
        &self,
        _access_token: &str,
        _calendar_id: &str,
        _since: DateTime<Utc>,
        _until: DateTime<Utc>,
        _delta_token: Option<&str>,
        _updated_min: Option<DateTime<Utc>>,
    ) -> Result<FetchResult, SyncError> {
        tracing::warn!(provider = self.provider_name, "attempted read on stub provider");
        Err(SyncError::Unsupported(format!(
            "{} reading is not supported. Consider device calendar sync or manual iCal import.",
            self.provider_name
        )))
    }

    async fn upsert_event(
        &self,
        _access_token: &str,
        _calendar_id: &str,
        event: &CalendarEvent,
    ) -> Result<CalendarEvent, SyncError> {
        tracing::warn!(provider = self.provider_name, title = %event.title, "attempted write on stub provider");
        Err(SyncError::Unsupported(format!(
            "{} writing is not supported. The event is saved locally only; add it to the provider's app manually.",
            self.provider_name
        )))
    }

    async fn delete_event(
        &self,
        _access_token: &str,
        _calendar_id: &str,
        external_event_id: &str,
    ) -> Result<(), SyncError> {
        tracing::warn!(provider = self.provider_name, external_event_id, "attempted delete on stub provider");
        Err(SyncError::Unsupported(format!(
            "{} deletion is not supported. The event is marked deleted locally; remove it manually from the provider's app.",
            self.provider_name
        )))
    }
}
