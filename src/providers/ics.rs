//! ICS-class adapter (write-only, plus optional `http(s)` URL read).
//!
//! Mirrors the source system's Naver integration: writes go out as a
//! form-posted VCALENDAR/VEVENT payload, delete is unsupported, and read
//! is only possible when the engine passes an `http(s)` URL as the
//! `calendar_id` — a deliberately preserved sharp edge (spec §9(b)).

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};

use crate::models::{CalendarEvent, CalendarMeta, ProviderCapabilities};

use super::{CalendarProvider, FetchResult, SyncError};

const CREATE_SCHEDULE_URL: &str = "https://openapi.example-ics.net/calendar/createSchedule.json";

pub struct IcsCalendarProvider {
    http: reqwest::Client,
}

impl IcsCalendarProvider {
    pub fn new(request_timeout: std::time::Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent("mokkoji-sync/1.0")
            .build()
            .expect("failed to build reqwest client");
        Self { http }
    }

    fn escape_text(text: &str) -> String {
        text.replace('\\', "\\\\")
            .replace(',', "\\,")
            .replace(';', "\\;")
            .replace('\n', "\\n")
    }

    fn unescape_text(text: &str) -> String {
        text.replace("\\n", "\n")
            .replace("\\;", ";")
            .replace("\\,", ",")
            .replace("\\\\", "\\")
    }

    /// Deterministic UID for events the provider has never assigned one to.
    /// The source language falls back to its process-randomized `hash()`
    /// builtin here; this crate uses a stable content hash instead so the
    /// same event always maps to the same UID across syncs and processes.
    fn synthesize_uid(title: &str, start: DateTime<Utc>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(title.as_bytes());
        hasher.update(start.to_rfc3339().as_bytes());
        format!("mokkoji-{:x}", hasher.finalize())
    }

    fn generate_ics_content(event: &CalendarEvent) -> String {
        let mut lines = vec![
            "BEGIN:VCALENDAR".to_string(),
            "VERSION:2.0".to_string(),
            "PRODID:-//Mokkoji//Calendar//EN".to_string(),
            "CALSCALE:GREGORIAN".to_string(),
            "METHOD:REQUEST".to_string(),
            "BEGIN:VEVENT".to_string(),
        ];

        let uid = event
            .external_event_id
            .clone()
            .unwrap_or_else(|| Self::synthesize_uid(&event.title, event.start_utc));
        lines.push(format!("UID:{uid}"));

        lines.push(format!("SUMMARY:{}", Self::escape_text(&event.title)));
        if let Some(desc) = &event.description {
            lines.push(format!("DESCRIPTION:{}", Self::escape_text(desc)));
        }
        if let Some(loc) = &event.location {
            lines.push(format!("LOCATION:{}", Self::escape_text(loc)));
        }

        if event.all_day {
            lines.push(format!(
                "DTSTART;VALUE=DATE:{}",
                event.start_utc.format("%Y%m%d")
            ));
            let end = event.end_utc.unwrap_or(event.start_utc);
            lines.push(format!("DTEND;VALUE=DATE:{}", end.format("%Y%m%d")));
        } else {
            lines.push(format!(
                "DTSTART:{}",
                event.start_utc.format("%Y%m%dT%H%M%SZ")
            ));
            let end = event.end_utc.unwrap_or(event.start_utc);
            lines.push(format!("DTEND:{}", end.format("%Y%m%dT%H%M%SZ")));
        }

        if let Some(rrule) = &event.recurrence_rule {
            lines.push(rrule.clone());
        }

        for attendee in &event.attendees {
            if attendee.email.is_empty() {
                continue;
            }
            let name = attendee.name.clone().unwrap_or_default();
            let status = attendee.status.to_uppercase();
            lines.push(format!(
                "ATTENDEE;CN={name};PARTSTAT={status}:MAILTO:{}",
                attendee.email
            ));
        }

        lines.push(format!("DTSTAMP:{}", Utc::now().format("%Y%m%dT%H%M%SZ")));
        lines.push("STATUS:CONFIRMED".to_string());
        lines.push("TRANSP:OPAQUE".to_string());
        lines.push("END:VEVENT".to_string());
        lines.push("END:VCALENDAR".to_string());

        lines.join("\r\n")
    }

    fn parse_ics_datetime(raw: &str, all_day: bool) -> Result<DateTime<Utc>, SyncError> {
        if all_day {
            let date = NaiveDate::parse_from_str(raw, "%Y%m%d")
                .map_err(|e| SyncError::Permanent(format!("invalid ICS date: {e}")))?;
            return Ok(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap()));
        }
        let trimmed = raw.trim_end_matches('Z');
        let naive = NaiveDateTime::parse_from_str(trimmed, "%Y%m%dT%H%M%S")
            .map_err(|e| SyncError::Permanent(format!("invalid ICS datetime: {e}")))?;
        Ok(Utc.from_utc_datetime(&naive))
    }

    fn parse_ics_content(content: &str) -> Vec<CalendarEvent> {
        let mut events = Vec::new();
        let mut current: std::collections::HashMap<String, String> = std::collections::HashMap::new();
        let mut in_event = false;

        for raw_line in content.replace("\r\n", "\n").split('\n') {
            let line = raw_line.trim();
            if line == "BEGIN:VEVENT" {
                in_event = true;
                current.clear();
                continue;
            }
            if line == "END:VEVENT" {
                if in_event && !current.is_empty() {
                    match Self::parse_ics_event(&current) {
                        Ok(event) => events.push(event),
                        Err(e) => tracing::warn!(error = %e, "failed to parse ICS event, skipping"),
                    }
                }
                in_event = false;
                continue;
            }
            if !in_event {
                continue;
            }
            if let Some(idx) = line.find(':') {
                let (key_part, value) = line.split_at(idx);
                let value = &value[1..];
                let key = key_part.split(';').next().unwrap_or(key_part);
                current.insert(key.to_string(), value.to_string());
            }
        }

        events
    }

    fn parse_ics_event(
        data: &std::collections::HashMap<String, String>,
    ) -> Result<CalendarEvent, SyncError> {
        let uid = data.get("UID").cloned().unwrap_or_default();
        let title = Self::unescape_text(data.get("SUMMARY").map(String::as_str).unwrap_or("No Title"));
        let description = data.get("DESCRIPTION").map(|s| Self::unescape_text(s));
        let location = data.get("LOCATION").map(|s| Self::unescape_text(s));

        let dtstart = data.get("DTSTART").cloned().unwrap_or_default();
        let dtend = data.get("DTEND").cloned();

        let all_day = dtstart.contains("VALUE=DATE");
        let start_raw = dtstart.rsplit(':').next().unwrap_or(&dtstart);
        let start_utc = Self::parse_ics_datetime(start_raw, all_day)?;
        let end_utc = match &dtend {
            Some(e) => {
                let end_raw = e.rsplit(':').next().unwrap_or(e);
                Some(Self::parse_ics_datetime(end_raw, all_day)?)
            }
            None => Some(start_utc),
        };

        let external_updated_at = match data.get("DTSTAMP") {
            Some(stamp) => Self::parse_ics_datetime(stamp, false)?,
            None => Utc::now(),
        };

        Ok(CalendarEvent {
            external_event_id: if uid.is_empty() { None } else { Some(uid) },
            external_calendar_id: "ics-default".to_string(),
            title,
            description: description.filter(|s| !s.is_empty()),
            start_utc,
            end_utc,
            all_day,
            location: location.filter(|s| !s.is_empty()),
            recurrence_rule: data.get("RRULE").cloned(),
            attendees: Vec::new(),
            external_updated_at,
            external_version: None,
            deleted: false,
        })
    }
}

#[async_trait]
impl CalendarProvider for IcsCalendarProvider {
    fn name(&self) -> &'static str {
        "ics"
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            read: false,
            write: true,
            delta: false,
        }
    }

    async fn list_calendars(&self, _access_token: &str) -> Result<Vec<CalendarMeta>, SyncError> {
        Ok(vec![CalendarMeta {
            external_calendar_id: "ics-default".to_string(),
            name: Some("ICS calendar".to_string()),
        }])
    }

    async fn fetch_events(
        &self,
        _access_token: &str,
        calendar_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        _delta_token: Option<&str>,
        _updated_min: Option<DateTime<Utc>>,
    ) -> Result<FetchResult, SyncError> {
        if !calendar_id.starts_with("http") {
            return Err(SyncError::Unsupported(
                "ICS calendar read not supported; provide an http(s) feed URL as calendar_id"
                    .to_string(),
            ));
        }

        let response = self
            .http
            .get(calendar_id)
            .send()
            .await
            .map_err(|e| SyncError::Transient(format!("ICS feed request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(SyncError::Transient(format!(
                "ICS feed returned {}",
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| SyncError::Transient(format!("failed to read ICS feed body: {e}")))?;

        let events: Vec<CalendarEvent> = Self::parse_ics_content(&body)
            .into_iter()
            .filter(|e| e.start_utc >= since && e.start_utc < until)
            .collect();

        let max_updated_at = events.iter().map(|e| e.external_updated_at).max();

        Ok(FetchResult {
            events,
            next_delta_token: None,
            max_updated_at,
            has_more: false,
        })
    }

    async fn upsert_event(
        &self,
        access_token: &str,
        _calendar_id: &str,
        event: &CalendarEvent,
    ) -> Result<CalendarEvent, SyncError> {
        let ics_content = Self::generate_ics_content(event);

        let form = [
            ("calendarId", "defaultCalendarId"),
            ("scheduleIcalString", ics_content.as_str()),
        ];

        let response = self
            .http
            .post(CREATE_SCHEDULE_URL)
            .bearer_auth(access_token)
            .form(&form)
            .send()
            .await
            .map_err(|e| SyncError::Transient(format!("ICS schedule request failed: {e}")))?;

        match response.status() {
            reqwest::StatusCode::UNAUTHORIZED => return Err(SyncError::AuthExpired),
            reqwest::StatusCode::TOO_MANY_REQUESTS => {
                return Err(SyncError::RateLimited { retry_after: None })
            }
            s if !s.is_success() => {
                return Err(SyncError::Permanent(format!("ICS schedule creation failed: {s}")))
            }
            _ => {}
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SyncError::Permanent(format!("invalid ICS response body: {e}")))?;

        let external_id = body
            .get("result")
            .and_then(|r| r.get("id"))
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
            .or_else(|| event.external_event_id.clone());

        Ok(CalendarEvent {
            external_event_id: external_id,
            external_updated_at: Utc::now(),
            external_version: None,
            ..event.clone()
        })
    }

    async fn delete_event(
        &self,
        _access_token: &str,
        _calendar_id: &str,
        _external_event_id: &str,
    ) -> Result<(), SyncError> {
        Err(SyncError::Unsupported(
            "ICS calendar delete not supported; event will be marked deleted locally".to_string(),
        ))
    }
}
