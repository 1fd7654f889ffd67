//! Sync Engine: orchestrates a single calendar sync (spec §4.3).
//!
//! Grounded on `sources/google/calendar/mod.rs::sync_internal`'s control
//! flow (load cursor → branch incremental/full → fetch through retry →
//! transaction-wrapped upsert → advance cursor), generalized across
//! adapter classes and rewritten against the relational Event Store
//! instead of the teacher's S3/StreamWriter sink.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::credentials::TokenEncryptor;
use crate::error::{Error, Result};
use crate::models::{ExternalConnection, SyncOptions, SyncOutcome, SyncState};
use crate::providers::{registry::ProviderRegistry, FetchResult, SyncError};
use crate::retry::{self, RetryDecision};
use crate::upsert;

/// Default per-request deadline (spec §5).
pub const DEFAULT_REQUEST_DEADLINE: Duration = Duration::from_secs(30);

pub struct SyncEngine {
    db: PgPool,
    providers: Arc<ProviderRegistry>,
    encryptor: TokenEncryptor,
    request_deadline: Duration,
}

impl SyncEngine {
    /// `providers` is shared with the dispatcher so the per-adapter HTTP
    /// client pool is genuinely shared across pull and push (spec §5).
    pub fn new(db: PgPool, providers: Arc<ProviderRegistry>, encryptor: TokenEncryptor) -> Self {
        Self {
            db,
            providers,
            encryptor,
            request_deadline: DEFAULT_REQUEST_DEADLINE,
        }
    }

    /// Override the per-request deadline used to bound each adapter call
    /// (spec §5's "every external request carries a deadline").
    pub fn with_request_deadline(mut self, deadline: Duration) -> Self {
        self.request_deadline = deadline;
        self
    }

    /// Exposes the process-wide credential codec so the dispatcher's
    /// synchronous push path can decrypt tokens without holding its own
    /// copy (spec §9: the engine must not cache decrypted tokens beyond a
    /// single sync job, but the codec itself is a shared collaborator).
    pub fn encryptor(&self) -> &TokenEncryptor {
        &self.encryptor
    }

    /// Public operation: `sync_calendar` (spec §4.3).
    #[tracing::instrument(skip(self, options), fields(%user_id, %connection_id, %external_calendar_id))]
    pub async fn sync_calendar(
        &self,
        user_id: Uuid,
        connection_id: Uuid,
        external_calendar_id: &str,
        options: &SyncOptions,
    ) -> Result<SyncOutcome> {
        options.validate()?;

        // Step 1: load connection, fail if missing/not-owned/disabled.
        let connection = self.load_connection(user_id, connection_id).await?;
        if !connection.sync_enabled {
            return Err(SyncError::ConnectionDisabled.into());
        }

        // Step 2: resolve adapter.
        let adapter = self
            .providers
            .get(&connection.platform_type)
            .ok_or_else(|| SyncError::ProviderUnknown(connection.platform_type.clone()))?;

        // Step 3: decrypt access token through the credential codec. The
        // plaintext is held only for the duration of this sync job.
        let access_token = match &connection.access_token_encrypted {
            Some(encrypted) => self.encryptor.decrypt(encrypted, &connection_id)?,
            None => return Err(SyncError::AuthExpired.into()),
        };

        // Step 4: load-or-create sync state.
        let mut sync_state = self
            .load_or_create_sync_state(user_id, connection_id, external_calendar_id)
            .await?;

        // Step 5: compute the sync window.
        let now = Utc::now();
        let since = now - ChronoDuration::days(options.window_days_past);
        let until = now + ChronoDuration::days(options.window_days_future);

        // Step 6: choose strategy.
        let mut use_delta = !options.force_full
            && adapter.capabilities().delta
            && sync_state.delta_token.is_some();

        // Step 7: retry loop.
        let mut k: u32 = 0;
        let fetch_result: FetchResult = loop {
            let delta_token = if use_delta {
                sync_state.delta_token.as_deref()
            } else {
                None
            };

            let call = adapter.fetch_events(
                &access_token,
                external_calendar_id,
                since,
                until,
                delta_token,
                sync_state.updated_min,
            );

            let attempt = match tokio::time::timeout(self.request_deadline, call).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    // Cancellation: abandon the in-flight call, do not advance
                    // SyncState, leave the connection in an error state with a
                    // cancellation reason (spec §5). The retry policy does not
                    // get a say here - a deadline is an immediate give-up.
                    self.mark_connection_failed(
                        connection_id,
                        "sync cancelled: request deadline exceeded",
                        !use_delta,
                    )
                    .await?;
                    return Err(Error::Other(
                        "sync cancelled: request deadline exceeded".to_string(),
                    ));
                }
            };

            match attempt {
                Ok(result) => break result,
                Err(SyncError::InvalidDeltaToken) if use_delta => {
                    // Clear in memory, do not count the attempt, retry as window sync.
                    use_delta = false;
                    sync_state.delta_token = None;
                    continue;
                }
                Err(e) => match retry::decide(k, &e, options.max_retries) {
                    RetryDecision::Retry(sleep_for) => {
                        tokio::time::sleep(sleep_for).await;
                        k += 1;
                        continue;
                    }
                    RetryDecision::RetryAsWindowSync => {
                        use_delta = false;
                        sync_state.delta_token = None;
                        continue;
                    }
                    RetryDecision::GiveUp => {
                        self.mark_connection_failed(connection_id, &e.to_string(), !use_delta)
                            .await?;
                        return Err(e.into());
                    }
                },
            }
        };

        // Steps 8-9: apply events and advance sync state in one transaction.
        let mut counts = upsert::UpsertCounts::default();
        let mut tx = self.db.begin().await.map_err(Error::from)?;

        for batch in fetch_result.events.chunks(options.batch_size.max(1)) {
            let batch_counts = upsert::apply_batch(
                &mut tx,
                user_id,
                &connection.platform_type,
                batch,
            )
            .await?;
            counts.created += batch_counts.created;
            counts.updated += batch_counts.updated;
            counts.deleted += batch_counts.deleted;
        }

        let new_updated_min = match (sync_state.updated_min, fetch_result.max_updated_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, None) => a,
            (None, b) => b,
        };

        sqlx::query!(
            r#"
            UPDATE sync_state
            SET delta_token = $1, updated_min = $2, last_window_start = $3,
                last_window_end = $4, updated_at = $5
            WHERE id = $6
            "#,
            fetch_result.next_delta_token,
            new_updated_min,
            since,
            until,
            now,
            sync_state.id,
        )
        .execute(&mut *tx)
        .await
        .map_err(Error::from)?;

        tx.commit().await.map_err(Error::from)?;

        // Step 10: connection health, a separate transaction.
        self.mark_connection_succeeded(connection_id).await?;

        Ok(SyncOutcome {
            success: true,
            created: counts.created,
            updated: counts.updated,
            deleted: counts.deleted,
            error: None,
        })
    }

    async fn load_connection(
        &self,
        user_id: Uuid,
        connection_id: Uuid,
    ) -> Result<ExternalConnection> {
        let row = sqlx::query_as!(
            ExternalConnection,
            r#"
            SELECT id, user_id, platform_type, access_token_encrypted,
                   refresh_token_encrypted, sync_enabled, last_sync_at,
                   sync_status, last_error, consecutive_full_sync_failures,
                   created_at, updated_at
            FROM external_connections
            WHERE id = $1
            "#,
            connection_id,
        )
        .fetch_optional(&self.db)
        .await
        .map_err(Error::from)?;

        let connection = row.ok_or(SyncError::ConnectionMissing)?;
        if connection.user_id != user_id {
            return Err(SyncError::ConnectionMissing.into());
        }
        Ok(connection)
    }

    async fn load_or_create_sync_state(
        &self,
        user_id: Uuid,
        connection_id: Uuid,
        external_calendar_id: &str,
    ) -> Result<SyncState> {
        let existing = sqlx::query_as!(
            SyncState,
            r#"
            SELECT id, user_id, connection_id, external_calendar_id, delta_token,
                   updated_min, last_window_start, last_window_end, created_at, updated_at
            FROM sync_state
            WHERE user_id = $1 AND connection_id = $2 AND external_calendar_id = $3
            "#,
            user_id,
            connection_id,
            external_calendar_id,
        )
        .fetch_optional(&self.db)
        .await
        .map_err(Error::from)?;

        if let Some(state) = existing {
            return Ok(state);
        }

        let created = sqlx::query_as!(
            SyncState,
            r#"
            INSERT INTO sync_state (user_id, connection_id, external_calendar_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, connection_id, external_calendar_id) DO UPDATE
                SET updated_at = sync_state.updated_at
            RETURNING id, user_id, connection_id, external_calendar_id, delta_token,
                      updated_min, last_window_start, last_window_end, created_at, updated_at
            "#,
            user_id,
            connection_id,
            external_calendar_id,
        )
        .fetch_one(&self.db)
        .await
        .map_err(Error::from)?;

        Ok(created)
    }

    async fn mark_connection_succeeded(&self, connection_id: Uuid) -> Result<()> {
        sqlx::query!(
            r#"
            UPDATE external_connections
            SET sync_status = 'idle', last_sync_at = $1, last_error = NULL,
                consecutive_full_sync_failures = 0, updated_at = $1
            WHERE id = $2
            "#,
            Utc::now(),
            connection_id,
        )
        .execute(&self.db)
        .await
        .map_err(Error::from)?;
        Ok(())
    }

    /// Records a failed sync attempt. Every failure sets `sync_status='error'`
    /// and `last_error=message` (spec §4.3 step 10; §7's taxonomy marks the
    /// connection `error` on a single `AuthExpired` or exhausted
    /// `RateLimited`). `consecutive_full_sync_failures` is separate
    /// bookkeeping for §7's "two consecutive full-sync failures" escalation
    /// note and only counts full (non-delta) sync failures; it is reset to
    /// 0 on any successful sync.
    async fn mark_connection_failed(
        &self,
        connection_id: Uuid,
        message: &str,
        is_full_sync: bool,
    ) -> Result<()> {
        if is_full_sync {
            sqlx::query!(
                r#"
                UPDATE external_connections
                SET sync_status = 'error', last_error = $1,
                    updated_at = $2,
                    consecutive_full_sync_failures = consecutive_full_sync_failures + 1
                WHERE id = $3
                "#,
                message,
                Utc::now(),
                connection_id,
            )
            .execute(&self.db)
            .await
            .map_err(Error::from)?;
        } else {
            sqlx::query!(
                r#"
                UPDATE external_connections
                SET sync_status = 'error', last_error = $1, updated_at = $2
                WHERE id = $3
                "#,
                message,
                Utc::now(),
                connection_id,
            )
            .execute(&self.db)
            .await
            .map_err(Error::from)?;
        }
        Ok(())
    }
}
