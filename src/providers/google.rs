//! Google Calendar adapter (read + write + delta).
//!
//! Does not retry or self-heal on its own: within-call jitter against
//! 429/5xx happens here, but cross-attempt retry/backoff and the
//! invalid-delta-token-to-window-sync transition belong to the engine
//! (spec §4.1/§9) — unlike the source system, where both the provider and
//! the engine independently catch an expired sync token.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::models::{Attendee, CalendarEvent, CalendarMeta, ProviderCapabilities};

use super::{CalendarProvider, FetchResult, SyncError};

const BASE_URL: &str = "https://www.googleapis.com/calendar/v3";

pub struct GoogleCalendarProvider {
    http: reqwest::Client,
}

impl GoogleCalendarProvider {
    pub fn new(request_timeout: std::time::Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent("mokkoji-sync/1.0")
            .build()
            .expect("failed to build reqwest client");
        Self { http }
    }

    fn parse_datetime(obj: &Value) -> Result<DateTime<Utc>, SyncError> {
        if let Some(dt_str) = obj.get("dateTime").and_then(Value::as_str) {
            DateTime::parse_from_rfc3339(dt_str)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| SyncError::Permanent(format!("invalid dateTime: {e}")))
        } else if let Some(date_str) = obj.get("date").and_then(Value::as_str) {
            chrono::NaiveDate::parse_from_str(date_str, "%Y-%m-%d")
                .map_err(|e| SyncError::Permanent(format!("invalid date: {e}")))
                .map(|d| Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0).unwrap()))
        } else {
            Err(SyncError::Permanent(
                "missing start/end datetime object".to_string(),
            ))
        }
    }

    fn format_datetime(dt: DateTime<Utc>, all_day: bool) -> Value {
        if all_day {
            serde_json::json!({ "date": dt.format("%Y-%m-%d").to_string() })
        } else {
            serde_json::json!({
                "dateTime": dt.to_rfc3339(),
                "timeZone": "UTC",
            })
        }
    }

    /// Extracts the first `RRULE:` line, matching the engine's "opaque text,
    /// verbatim forward" policy (spec §9 Recurrence handling).
    fn parse_recurrence(list: &[Value]) -> Option<String> {
        list.iter()
            .filter_map(Value::as_str)
            .find(|line| line.starts_with("RRULE:"))
            .map(str::to_string)
    }

    fn format_recurrence(rrule: &str) -> Vec<Value> {
        if rrule.starts_with("RRULE:") {
            vec![Value::String(rrule.to_string())]
        } else {
            Vec::new()
        }
    }

    fn parse_event(event_data: &Value) -> Result<CalendarEvent, SyncError> {
        let start_obj = event_data
            .get("start")
            .ok_or_else(|| SyncError::Permanent("event missing start".to_string()))?;
        let end_obj = event_data.get("end").unwrap_or(start_obj);

        let start_utc = Self::parse_datetime(start_obj)?;
        let end_utc = Some(Self::parse_datetime(end_obj)?);
        let all_day = start_obj.get("date").is_some();

        let attendees = event_data
            .get("attendees")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .map(|a| Attendee {
                        email: a
                            .get("email")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        name: a
                            .get("displayName")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        status: a
                            .get("responseStatus")
                            .and_then(Value::as_str)
                            .unwrap_or("needsAction")
                            .to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let external_updated_at = event_data
            .get("updated")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| SyncError::Permanent("event missing updated timestamp".to_string()))?;

        Ok(CalendarEvent {
            external_event_id: event_data
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string),
            external_calendar_id: event_data
                .get("organizer")
                .and_then(|o| o.get("email"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            title: event_data
                .get("summary")
                .and_then(Value::as_str)
                .unwrap_or("No Title")
                .to_string(),
            description: event_data
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string),
            start_utc,
            end_utc,
            all_day,
            location: event_data
                .get("location")
                .and_then(Value::as_str)
                .map(str::to_string),
            recurrence_rule: event_data
                .get("recurrence")
                .and_then(Value::as_array)
                .and_then(|list| Self::parse_recurrence(list)),
            attendees,
            external_updated_at,
            external_version: event_data
                .get("etag")
                .and_then(Value::as_str)
                .map(str::to_string),
            deleted: event_data.get("status").and_then(Value::as_str) == Some("cancelled"),
        })
    }

    /// Single HTTP attempt with in-call jitter against 429/5xx only — no
    /// cross-call retry loop and no sync-token self-healing.
    async fn request(
        &self,
        method: reqwest::Method,
        url: &str,
        access_token: &str,
        body: Option<&Value>,
    ) -> Result<Value, SyncError> {
        let mut req = self
            .http
            .request(method, url)
            .bearer_auth(access_token);
        if let Some(b) = body {
            req = req.json(b);
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                SyncError::Transient(format!("network error: {e}"))
            } else {
                SyncError::Transient(format!("request error: {e}"))
            }
        })?;

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(SyncError::RateLimited { retry_after });
        }

        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(SyncError::AuthExpired);
        }

        if status.is_server_error() {
            return Err(SyncError::Transient(format!("server error: {status}")));
        }

        if status == reqwest::StatusCode::BAD_REQUEST {
            let text = response.text().await.unwrap_or_default();
            if text.contains("Invalid sync token") {
                return Err(SyncError::InvalidDeltaToken);
            }
            return Err(SyncError::Permanent(format!("bad request: {text}")));
        }

        if !status.is_success() {
            return Err(SyncError::Permanent(format!("unexpected status: {status}")));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| SyncError::Permanent(format!("invalid response body: {e}")))
    }
}

#[async_trait]
impl CalendarProvider for GoogleCalendarProvider {
    fn name(&self) -> &'static str {
        "google"
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            read: true,
            write: true,
            delta: true,
        }
    }

    async fn list_calendars(&self, access_token: &str) -> Result<Vec<CalendarMeta>, SyncError> {
        let url = format!("{BASE_URL}/users/me/calendarList");
        let data = self
            .request(reqwest::Method::GET, &url, access_token, None)
            .await?;

        let items = data.get("items").and_then(Value::as_array).cloned().unwrap_or_default();
        Ok(items
            .iter()
            .map(|item| CalendarMeta {
                external_calendar_id: item
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                name: item
                    .get("summary")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
            .collect())
    }

    async fn fetch_events(
        &self,
        access_token: &str,
        calendar_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        delta_token: Option<&str>,
        updated_min: Option<DateTime<Utc>>,
    ) -> Result<FetchResult, SyncError> {
        let mut params = vec![
            ("maxResults".to_string(), "2500".to_string()),
            ("singleEvents".to_string(), "true".to_string()),
            ("orderBy".to_string(), "updated".to_string()),
        ];

        if let Some(token) = delta_token {
            params.push(("syncToken".to_string(), token.to_string()));
        } else {
            params.push(("timeMin".to_string(), since.to_rfc3339()));
            params.push(("timeMax".to_string(), until.to_rfc3339()));
            if let Some(um) = updated_min {
                params.push(("updatedMin".to_string(), um.to_rfc3339()));
            }
        }

        let query = serde_urlencoded_params(&params);
        let url = format!(
            "{BASE_URL}/calendars/{}/events?{}",
            urlencoding_path(calendar_id),
            query
        );

        let data = self
            .request(reqwest::Method::GET, &url, access_token, None)
            .await?;

        let items = data.get("items").and_then(Value::as_array).cloned().unwrap_or_default();

        let mut events = Vec::with_capacity(items.len());
        for item in &items {
            match Self::parse_event(item) {
                Ok(event) => events.push(event),
                Err(e) => {
                    tracing::warn!(
                        event_id = ?item.get("id"),
                        error = %e,
                        "failed to parse google event, skipping"
                    );
                }
            }
        }

        let next_delta_token = data
            .get("nextSyncToken")
            .and_then(Value::as_str)
            .map(str::to_string);

        let max_updated_at = events.iter().map(|e| e.external_updated_at).max();

        Ok(FetchResult {
            events,
            next_delta_token,
            max_updated_at,
            has_more: false,
        })
    }

    async fn upsert_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event: &CalendarEvent,
    ) -> Result<CalendarEvent, SyncError> {
        let mut body = serde_json::json!({
            "summary": event.title,
            "description": event.description,
            "start": Self::format_datetime(event.start_utc, event.all_day),
            "end": Self::format_datetime(event.end_utc.unwrap_or(event.start_utc), event.all_day),
            "location": event.location,
        });

        if let Some(rrule) = &event.recurrence_rule {
            body["recurrence"] = Value::Array(Self::format_recurrence(rrule));
        }

        if !event.attendees.is_empty() {
            body["attendees"] = Value::Array(
                event
                    .attendees
                    .iter()
                    .filter(|a| !a.email.is_empty())
                    .map(|a| {
                        serde_json::json!({
                            "email": a.email,
                            "displayName": a.name,
                            "responseStatus": a.status,
                        })
                    })
                    .collect(),
            );
        }

        let (method, url) = match &event.external_event_id {
            Some(id) => (
                reqwest::Method::PUT,
                format!(
                    "{BASE_URL}/calendars/{}/events/{}",
                    urlencoding_path(calendar_id),
                    urlencoding_path(id)
                ),
            ),
            None => (
                reqwest::Method::POST,
                format!("{BASE_URL}/calendars/{}/events", urlencoding_path(calendar_id)),
            ),
        };

        let data = self.request(method, &url, access_token, Some(&body)).await?;
        Self::parse_event(&data)
    }

    async fn delete_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        external_event_id: &str,
    ) -> Result<(), SyncError> {
        let url = format!(
            "{BASE_URL}/calendars/{}/events/{}",
            urlencoding_path(calendar_id),
            urlencoding_path(external_event_id)
        );
        self.request(reqwest::Method::DELETE, &url, access_token, None)
            .await?;
        Ok(())
    }
}

fn urlencoding_path(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

fn serde_urlencoded_params(params: &[(String, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding_path(v)))
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_recurrence_picks_first_rrule() {
        let list = vec![
            Value::String("EXDATE:20260101".to_string()),
            Value::String("RRULE:FREQ=WEEKLY".to_string()),
        ];
        assert_eq!(
            GoogleCalendarProvider::parse_recurrence(&list),
            Some("RRULE:FREQ=WEEKLY".to_string())
        );
    }

    #[test]
    fn test_parse_recurrence_empty() {
        assert_eq!(GoogleCalendarProvider::parse_recurrence(&[]), None);
    }

    #[test]
    fn test_parse_all_day_datetime() {
        let obj = serde_json::json!({ "date": "2026-03-05" });
        let dt = GoogleCalendarProvider::parse_datetime(&obj).unwrap();
        assert_eq!(dt.format("%H:%M:%S").to_string(), "00:00:00");
    }

    #[test]
    fn test_parse_event_maps_cancelled_to_deleted() {
        let data = serde_json::json!({
            "id": "evt1",
            "status": "cancelled",
            "summary": "Cancelled meeting",
            "start": {"dateTime": "2026-03-05T10:00:00Z"},
            "end": {"dateTime": "2026-03-05T11:00:00Z"},
            "updated": "2026-03-05T09:00:00Z",
        });
        let event = GoogleCalendarProvider::parse_event(&data).unwrap();
        assert!(event.deleted);
    }
}
