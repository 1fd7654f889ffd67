//! Sync Dispatcher: Pull / Push / State (spec §4.5).
//!
//! Grounded on `original_source/.../sync_routes.py` for the three
//! operations' shapes, and on `jobs/executor.rs::execute_async`'s
//! `tokio::spawn` background-job pattern for Pull. Unlike the source
//! system, Pull here deduplicates in-flight jobs per triple via
//! [`crate::lease::LeaseRegistry`] (spec §4.5/§8 requires this; the
//! source's `/pull` endpoint does not implement it — see DESIGN.md).

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::credentials::TokenEncryptor;
use crate::engine::SyncEngine;
use crate::error::Result;
use crate::lease::{LeaseRegistry, SyncTriple};
use crate::models::{CalendarMeta, SyncOptions};
use crate::providers::registry::ProviderRegistry;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub connection_ids: Vec<Uuid>,
    pub calendar_ids: Option<Vec<String>>,
    pub force_full: bool,
    pub window_days_past: i64,
    pub window_days_future: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Queued,
    AlreadyRunning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullResultItem {
    pub connection_id: Uuid,
    pub calendar_id: String,
    pub status: QueueStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullResponse {
    pub success: bool,
    pub message: String,
    pub results: Vec<PullResultItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPushData {
    pub local_id: String,
    pub external_event_id: Option<String>,
    pub external_calendar_id: String,
    pub title: String,
    pub description: Option<String>,
    pub start_utc: chrono::DateTime<chrono::Utc>,
    pub end_utc: Option<chrono::DateTime<chrono::Utc>>,
    pub all_day: bool,
    pub location: Option<String>,
    pub recurrence_rule: Option<String>,
    pub attendees: Vec<crate::models::Attendee>,
    pub action: PushAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushAction {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    pub connection_id: Uuid,
    pub events: Vec<EventPushData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPushResult {
    pub local_id: String,
    pub action: PushAction,
    pub success: bool,
    pub external_event_id: Option<String>,
    pub external_version: Option<String>,
    pub external_updated_at: Option<chrono::DateTime<chrono::Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushResponse {
    pub success: bool,
    pub message: String,
    pub results: Vec<EventPushResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarSyncStateView {
    pub external_calendar_id: String,
    pub last_sync_window_start: Option<chrono::DateTime<chrono::Utc>>,
    pub last_sync_window_end: Option<chrono::DateTime<chrono::Utc>>,
    pub has_delta_token: bool,
    pub updated_min: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStateView {
    pub connection_id: Uuid,
    pub platform_type: String,
    pub sync_enabled: bool,
    pub sync_status: String,
    pub last_sync_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_error: Option<String>,
    pub calendars: Vec<CalendarSyncStateView>,
}

pub struct SyncDispatcher {
    db: PgPool,
    engine: Arc<SyncEngine>,
    providers: Arc<ProviderRegistry>,
    leases: Arc<LeaseRegistry>,
}

impl SyncDispatcher {
    pub fn new(
        db: PgPool,
        engine: Arc<SyncEngine>,
        providers: Arc<ProviderRegistry>,
        leases: Arc<LeaseRegistry>,
    ) -> Self {
        Self {
            db,
            engine,
            providers,
            leases,
        }
    }

    /// Pull: enumerate calendars and fan out per-(connection, calendar)
    /// background sync jobs, deduplicated by the lease registry.
    pub async fn pull(&self, user_id: Uuid, request: PullRequest) -> Result<PullResponse> {
        let connections = self
            .validate_connections(user_id, &request.connection_ids)
            .await?;

        if connections.is_empty() {
            return Ok(PullResponse {
                success: false,
                message: "No valid connections found".to_string(),
                results: Vec::new(),
            });
        }

        let options = Arc::new(SyncOptions {
            force_full: request.force_full,
            window_days_past: request.window_days_past,
            window_days_future: request.window_days_future,
            ..SyncOptions::default()
        });
        options.validate()?;

        let mut results = Vec::new();

        for connection in connections {
            let adapter = self.providers.get(&connection.platform_type);
            let calendars: Vec<String> = match &request.calendar_ids {
                Some(ids) => ids.clone(),
                None => match &adapter {
                    Some(adapter) => match &connection.access_token_encrypted {
                        Some(_) => self
                            .list_calendars(&connection)
                            .await
                            .unwrap_or_default()
                            .into_iter()
                            .map(|c: CalendarMeta| c.external_calendar_id)
                            .collect(),
                        None => Vec::new(),
                    },
                    None => Vec::new(),
                },
            };

            for calendar_id in calendars {
                let triple = SyncTriple {
                    user_id,
                    connection_id: connection.id,
                    external_calendar_id: calendar_id.clone(),
                };

                match self.leases.try_acquire(triple) {
                    None => {
                        results.push(PullResultItem {
                            connection_id: connection.id,
                            calendar_id,
                            status: QueueStatus::AlreadyRunning,
                        });
                    }
                    Some(guard) => {
                        let engine = Arc::clone(&self.engine);
                        let options = Arc::clone(&options);
                        let connection_id = connection.id;
                        let calendar_id_owned = calendar_id.clone();

                        tokio::spawn(async move {
                            let _guard = guard;
                            match engine
                                .sync_calendar(user_id, connection_id, &calendar_id_owned, &options)
                                .await
                            {
                                Ok(outcome) => {
                                    tracing::info!(?outcome, "background sync completed");
                                }
                                Err(e) => {
                                    tracing::error!(error = %e, "background sync failed");
                                }
                            }
                        });

                        results.push(PullResultItem {
                            connection_id: connection.id,
                            calendar_id,
                            status: QueueStatus::Queued,
                        });
                    }
                }
            }
        }

        Ok(PullResponse {
            success: true,
            message: format!("Queued {} calendar sync tasks", results.len()),
            results,
        })
    }

    /// Push: synchronous per-event create/update/delete. Not subject to
    /// the triple lease (spec §9 Open Question (a)).
    pub async fn push(&self, user_id: Uuid, request: PushRequest) -> Result<PushResponse> {
        let connection = match self
            .validate_connections(user_id, std::slice::from_ref(&request.connection_id))
            .await?
            .into_iter()
            .next()
        {
            Some(c) => c,
            None => {
                return Ok(PushResponse {
                    success: false,
                    message: "Invalid or disabled connection".to_string(),
                    results: Vec::new(),
                })
            }
        };

        let adapter = match self.providers.get(&connection.platform_type) {
            Some(a) if a.capabilities().write => a,
            _ => {
                return Ok(PushResponse {
                    success: false,
                    message: format!(
                        "Provider {} does not support writing",
                        connection.platform_type
                    ),
                    results: Vec::new(),
                })
            }
        };

        let encryptor = self.encryptor();
        let access_token = match &connection.access_token_encrypted {
            Some(enc) => encryptor.decrypt(enc, &connection.id)?,
            None => {
                return Ok(PushResponse {
                    success: false,
                    message: "Connection has no access token".to_string(),
                    results: Vec::new(),
                })
            }
        };

        let mut results = Vec::with_capacity(request.events.len());

        for event_data in request.events {
            let result = match event_data.action {
                PushAction::Delete => {
                    let Some(ext_id) = event_data.external_event_id.clone() else {
                        results.push(EventPushResult {
                            local_id: event_data.local_id,
                            action: PushAction::Delete,
                            success: false,
                            external_event_id: None,
                            external_version: None,
                            external_updated_at: None,
                            error: Some("external_event_id required for delete".to_string()),
                        });
                        continue;
                    };
                    adapter
                        .delete_event(&access_token, &event_data.external_calendar_id, &ext_id)
                        .await
                        .map(|_| None)
                }
                PushAction::Create | PushAction::Update => {
                    let event = crate::models::CalendarEvent {
                        external_event_id: event_data.external_event_id.clone(),
                        external_calendar_id: event_data.external_calendar_id.clone(),
                        title: event_data.title.clone(),
                        description: event_data.description.clone(),
                        start_utc: event_data.start_utc,
                        end_utc: event_data.end_utc,
                        all_day: event_data.all_day,
                        location: event_data.location.clone(),
                        recurrence_rule: event_data.recurrence_rule.clone(),
                        attendees: event_data.attendees.clone(),
                        external_updated_at: chrono::Utc::now(),
                        external_version: None,
                        deleted: false,
                    };
                    adapter
                        .upsert_event(&access_token, &event_data.external_calendar_id, &event)
                        .await
                        .map(Some)
                }
            };

            results.push(match result {
                Ok(updated_event) => EventPushResult {
                    local_id: event_data.local_id,
                    action: event_data.action,
                    success: true,
                    external_event_id: updated_event
                        .as_ref()
                        .and_then(|e| e.external_event_id.clone()),
                    external_version: updated_event.as_ref().and_then(|e| e.external_version.clone()),
                    external_updated_at: updated_event.as_ref().map(|e| e.external_updated_at),
                    error: None,
                },
                Err(e) => {
                    tracing::error!(local_id = %event_data.local_id, error = %e, "failed to push event");
                    EventPushResult {
                        local_id: event_data.local_id,
                        action: event_data.action,
                        success: false,
                        external_event_id: None,
                        external_version: None,
                        external_updated_at: None,
                        error: Some(e.to_string()),
                    }
                }
            });
        }

        let success_count = results.iter().filter(|r| r.success).count();
        Ok(PushResponse {
            success: success_count > 0,
            message: format!(
                "Processed {} events, {} successful",
                results.len(),
                success_count
            ),
            results,
        })
    }

    /// State: connection health plus per-calendar sync state.
    pub async fn state(&self, user_id: Uuid) -> Result<Vec<ConnectionStateView>> {
        let connections = sqlx::query_as!(
            crate::models::ExternalConnection,
            r#"
            SELECT id, user_id, platform_type, access_token_encrypted,
                   refresh_token_encrypted, sync_enabled, last_sync_at,
                   sync_status, last_error, consecutive_full_sync_failures,
                   created_at, updated_at
            FROM external_connections
            WHERE user_id = $1
            "#,
            user_id,
        )
        .fetch_all(&self.db)
        .await?;

        let mut views = Vec::with_capacity(connections.len());
        for connection in connections {
            let states = sqlx::query_as!(
                crate::models::SyncState,
                r#"
                SELECT id, user_id, connection_id, external_calendar_id, delta_token,
                       updated_min, last_window_start, last_window_end, created_at, updated_at
                FROM sync_state
                WHERE connection_id = $1
                "#,
                connection.id,
            )
            .fetch_all(&self.db)
            .await?;

            views.push(ConnectionStateView {
                connection_id: connection.id,
                platform_type: connection.platform_type,
                sync_enabled: connection.sync_enabled,
                sync_status: connection.sync_status,
                last_sync_at: connection.last_sync_at,
                last_error: connection.last_error,
                calendars: states
                    .into_iter()
                    .map(|s| CalendarSyncStateView {
                        external_calendar_id: s.external_calendar_id,
                        last_sync_window_start: s.last_window_start,
                        last_sync_window_end: s.last_window_end,
                        has_delta_token: s.delta_token.is_some(),
                        updated_min: s.updated_min,
                    })
                    .collect(),
            });
        }

        Ok(views)
    }

    async fn validate_connections(
        &self,
        user_id: Uuid,
        connection_ids: &[Uuid],
    ) -> Result<Vec<crate::models::ExternalConnection>> {
        let rows = sqlx::query_as!(
            crate::models::ExternalConnection,
            r#"
            SELECT id, user_id, platform_type, access_token_encrypted,
                   refresh_token_encrypted, sync_enabled, last_sync_at,
                   sync_status, last_error, consecutive_full_sync_failures,
                   created_at, updated_at
            FROM external_connections
            WHERE user_id = $1 AND id = ANY($2) AND sync_enabled = true
            "#,
            user_id,
            connection_ids,
        )
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    async fn list_calendars(
        &self,
        connection: &crate::models::ExternalConnection,
    ) -> Result<Vec<CalendarMeta>> {
        let adapter = self
            .providers
            .get(&connection.platform_type)
            .ok_or_else(|| crate::providers::SyncError::ProviderUnknown(connection.platform_type.clone()))?;

        let access_token = match &connection.access_token_encrypted {
            Some(enc) => self.encryptor().decrypt(enc, &connection.id)?,
            None => return Ok(Vec::new()),
        };

        Ok(adapter.list_calendars(&access_token).await?)
    }

    fn encryptor(&self) -> &TokenEncryptor {
        self.engine.encryptor()
    }
}
