//! PostgreSQL storage implementation for webhook destinations, the delivery
//! queue and delivery logs.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde_json::Value;
use sqlx_postgres::{PgPool, PgQueryResult};
use time::OffsetDateTime;
use tracing::{debug, info, instrument};

use hookrelay_delivery::{
    DeliveryError, DeliveryLogEntry, DeliveryLogStorage, DeliveryQueueStorage, Destination,
    DestinationId, DestinationStorage, EventRef, FetchEligibility, HealthState, IdRange,
    QueueEntry, QueueEntryId, codec,
};

use crate::error::{PG_FOREIGN_KEY_VIOLATION, has_pg_error_code, storage_error};
use crate::time_conv::{chrono_to_time, chrono_to_time_opt, time_to_chrono, time_to_chrono_opt};

const WEBHOOK_TABLES: &str = "webhooks";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS _webhook_destinations (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL,
        url TEXT NOT NULL,
        secret TEXT,
        published BOOLEAN NOT NULL DEFAULT TRUE,
        triggers TEXT[] NOT NULL DEFAULT '{}',
        marked_unhealthy_at TIMESTAMPTZ,
        unhealthy_since TIMESTAMPTZ,
        last_notification_sent_at TIMESTAMPTZ,
        consecutive_failures INTEGER NOT NULL DEFAULT 0,
        created_by BIGINT,
        modified_by BIGINT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS _webhook_queue (
        id BIGSERIAL PRIMARY KEY,
        destination_id BIGINT NOT NULL REFERENCES _webhook_destinations(id) ON DELETE CASCADE,
        event_id TEXT NOT NULL,
        event_type TEXT NOT NULL,
        payload BYTEA,
        date_added TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        date_modified TIMESTAMPTZ,
        retries INTEGER NOT NULL DEFAULT 0,
        claimed_until TIMESTAMPTZ
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_webhook_queue_destination ON _webhook_queue(destination_id, id)",
    r#"
    CREATE TABLE IF NOT EXISTS _webhook_logs (
        id BIGSERIAL PRIMARY KEY,
        destination_id BIGINT NOT NULL REFERENCES _webhook_destinations(id) ON DELETE CASCADE,
        status_code INTEGER,
        runtime DOUBLE PRECISION NOT NULL DEFAULT 0,
        note TEXT NOT NULL DEFAULT '',
        date_added TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_webhook_logs_destination ON _webhook_logs(destination_id, id DESC)",
];

type DestinationRow = (
    i64,
    String,
    String,
    Option<String>,
    bool,
    Vec<String>,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
    i32,
    Option<i64>,
    Option<i64>,
);

type QueueRow = (
    i64,
    i64,
    String,
    String,
    Option<Vec<u8>>,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
    i32,
    Option<DateTime<Utc>>,
);

const DESTINATION_COLUMNS: &str = "id, name, url, secret, published, triggers, \
    marked_unhealthy_at, unhealthy_since, last_notification_sent_at, \
    consecutive_failures, created_by, modified_by";

const QUEUE_COLUMNS: &str = "id, destination_id, event_id, event_type, payload, \
    date_added, date_modified, retries, claimed_until";

/// PostgreSQL implementation of the webhook storage traits.
#[derive(Clone)]
pub struct PostgresWebhookStorage {
    pool: PgPool,
    tables_created: Arc<DashSet<String>>,
}

impl PostgresWebhookStorage {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            tables_created: Arc::new(DashSet::new()),
        }
    }

    /// Ensure the webhook tables exist.
    #[instrument(skip(self))]
    pub async fn ensure_tables(&self) -> Result<(), DeliveryError> {
        if self.tables_created.contains(WEBHOOK_TABLES) {
            return Ok(());
        }

        for statement in SCHEMA {
            sqlx_core::query::query(statement)
                .execute(&self.pool)
                .await
                .map_err(storage_error)?;
        }

        info!("Created webhook tables");
        self.tables_created.insert(WEBHOOK_TABLES.to_string());
        Ok(())
    }

    /// Insert a destination, or replace every column of an existing one.
    /// Returns the stored destination with its assigned ID when `id <= 0`.
    pub async fn save_destination(
        &self,
        destination: &Destination,
    ) -> Result<Destination, DeliveryError> {
        self.ensure_tables().await?;

        let (marked, since) = destination.health.to_columns();
        let sql = format!(
            r#"
            INSERT INTO _webhook_destinations (
                id, name, url, secret, published, triggers, marked_unhealthy_at,
                unhealthy_since, last_notification_sent_at, consecutive_failures,
                created_by, modified_by
            ) VALUES (
                COALESCE($1, nextval(pg_get_serial_sequence('_webhook_destinations', 'id'))),
                $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12
            )
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                url = EXCLUDED.url,
                secret = EXCLUDED.secret,
                published = EXCLUDED.published,
                triggers = EXCLUDED.triggers,
                marked_unhealthy_at = EXCLUDED.marked_unhealthy_at,
                unhealthy_since = EXCLUDED.unhealthy_since,
                last_notification_sent_at = EXCLUDED.last_notification_sent_at,
                consecutive_failures = EXCLUDED.consecutive_failures,
                created_by = EXCLUDED.created_by,
                modified_by = EXCLUDED.modified_by
            RETURNING {DESTINATION_COLUMNS}
            "#
        );

        let row: DestinationRow = sqlx_core::query_as::query_as(&sql)
            .bind((destination.id > 0).then_some(destination.id))
            .bind(&destination.name)
            .bind(&destination.url)
            .bind(&destination.secret)
            .bind(destination.published)
            .bind(&destination.triggers)
            .bind(time_to_chrono_opt(marked))
            .bind(time_to_chrono_opt(since))
            .bind(time_to_chrono_opt(destination.last_notification_sent_at))
            .bind(failures_to_db(destination.consecutive_failures))
            .bind(destination.created_by)
            .bind(destination.modified_by)
            .fetch_one(&self.pool)
            .await
            .map_err(storage_error)?;

        Ok(destination_from_row(row))
    }

    /// Delete a destination; its queue rows and logs go with it.
    pub async fn delete_destination(&self, id: DestinationId) -> Result<bool, DeliveryError> {
        self.ensure_tables().await?;

        let result = sqlx_core::query::query("DELETE FROM _webhook_destinations WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;

        Ok(result.rows_affected() > 0)
    }

    /// Pending rows of one destination in ID order, without claiming them.
    pub async fn entries_for(
        &self,
        destination_id: DestinationId,
    ) -> Result<Vec<QueueEntry>, DeliveryError> {
        self.ensure_tables().await?;

        let sql = format!(
            "SELECT {QUEUE_COLUMNS} FROM _webhook_queue WHERE destination_id = $1 ORDER BY id"
        );
        let rows: Vec<QueueRow> = sqlx_core::query_as::query_as(&sql)
            .bind(destination_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)?;

        Ok(rows.into_iter().map(queue_entry_from_row).collect())
    }
}

/// An UPDATE by primary key that touched nothing means the destination is gone.
fn require_row(result: PgQueryResult, id: DestinationId) -> Result<(), DeliveryError> {
    if result.rows_affected() == 0 {
        return Err(DeliveryError::DestinationNotFound(id));
    }
    Ok(())
}

fn failures_to_db(failures: u32) -> i32 {
    i32::try_from(failures).unwrap_or(i32::MAX)
}

fn destination_from_row(row: DestinationRow) -> Destination {
    let (
        id,
        name,
        url,
        secret,
        published,
        triggers,
        marked_unhealthy_at,
        unhealthy_since,
        last_notification_sent_at,
        consecutive_failures,
        created_by,
        modified_by,
    ) = row;

    Destination {
        id,
        name,
        url,
        secret,
        published,
        triggers,
        health: HealthState::from_columns(
            chrono_to_time_opt(marked_unhealthy_at),
            chrono_to_time_opt(unhealthy_since),
        ),
        last_notification_sent_at: chrono_to_time_opt(last_notification_sent_at),
        consecutive_failures: consecutive_failures.max(0) as u32,
        created_by,
        modified_by,
    }
}

fn queue_entry_from_row(row: QueueRow) -> QueueEntry {
    let (
        id,
        destination_id,
        event_id,
        event_type,
        payload,
        date_added,
        date_modified,
        retries,
        claimed_until,
    ) = row;

    QueueEntry {
        id,
        destination_id,
        event: EventRef::new(event_id, event_type),
        payload,
        date_added: chrono_to_time(date_added),
        date_modified: chrono_to_time_opt(date_modified),
        retries: retries.max(0) as u32,
        claimed_until: chrono_to_time_opt(claimed_until),
    }
}

#[async_trait]
impl DeliveryQueueStorage for PostgresWebhookStorage {
    #[instrument(skip(self, payload), fields(event_type = %event.event_type))]
    async fn append(
        &self,
        destination_id: DestinationId,
        event: &EventRef,
        payload: &Value,
        now: OffsetDateTime,
    ) -> Result<QueueEntry, DeliveryError> {
        self.ensure_tables().await?;

        let text =
            serde_json::to_string(payload).map_err(|e| DeliveryError::Codec(e.to_string()))?;
        let compressed = codec::compress(&text)?;

        let sql = format!(
            r#"
            INSERT INTO _webhook_queue (destination_id, event_id, event_type, payload, date_added)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {QUEUE_COLUMNS}
            "#
        );
        let row: QueueRow = sqlx_core::query_as::query_as(&sql)
            .bind(destination_id)
            .bind(&event.id)
            .bind(&event.event_type)
            .bind(compressed)
            .bind(time_to_chrono(now))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                if has_pg_error_code(&e, PG_FOREIGN_KEY_VIOLATION) {
                    DeliveryError::DestinationNotFound(destination_id)
                } else {
                    storage_error(e)
                }
            })?;

        let entry = queue_entry_from_row(row);
        debug!(destination_id, row_id = entry.id, "Queued webhook payload");
        Ok(entry)
    }

    #[instrument(skip(self, eligibility))]
    async fn fetch_batch(
        &self,
        destination_id: DestinationId,
        limit: u32,
        range: Option<IdRange>,
        eligibility: FetchEligibility,
    ) -> Result<Vec<QueueEntry>, DeliveryError> {
        self.ensure_tables().await?;

        if range.is_some_and(|r| r.min > r.max) || limit == 0 {
            return Ok(Vec::new());
        }

        // Claim in one statement; concurrent drains skip each other's rows.
        let sql = format!(
            r#"
            UPDATE _webhook_queue
            SET claimed_until = $7
            WHERE id IN (
                SELECT id FROM _webhook_queue
                WHERE destination_id = $1
                  AND ($2::BIGINT IS NULL OR id >= $2)
                  AND ($3::BIGINT IS NULL OR id <= $3)
                  AND (claimed_until IS NULL OR claimed_until <= $4)
                  AND (retries = 0
                       OR date_modified IS NULL
                       OR date_modified + $5::DOUBLE PRECISION * INTERVAL '1 second' <= $4)
                ORDER BY id
                LIMIT $6
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {QUEUE_COLUMNS}
            "#
        );
        let mut rows: Vec<QueueRow> = sqlx_core::query_as::query_as(&sql)
            .bind(destination_id)
            .bind(range.map(|r| r.min))
            .bind(range.map(|r| r.max))
            .bind(time_to_chrono(eligibility.now))
            .bind(eligibility.retry_delay.as_seconds_f64())
            .bind(i64::from(limit))
            .bind(time_to_chrono(eligibility.claim_until()))
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)?;

        // RETURNING does not keep the subquery order
        rows.sort_by_key(|row| row.0);
        Ok(rows.into_iter().map(queue_entry_from_row).collect())
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn delete_by_ids(&self, ids: &[QueueEntryId]) -> Result<u64, DeliveryError> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.ensure_tables().await?;

        let result = sqlx_core::query::query("DELETE FROM _webhook_queue WHERE id = ANY($1)")
            .bind(ids.to_vec())
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn increment_retry(
        &self,
        ids: &[QueueEntryId],
        now: OffsetDateTime,
    ) -> Result<u64, DeliveryError> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.ensure_tables().await?;

        let result = sqlx_core::query::query(
            r#"
            UPDATE _webhook_queue
            SET retries = retries + 1,
                date_modified = $2,
                claimed_until = NULL
            WHERE id = ANY($1)
            "#,
        )
        .bind(ids.to_vec())
        .bind(time_to_chrono(now))
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(result.rows_affected())
    }

    async fn delete_exhausted(
        &self,
        destination_id: DestinationId,
        max_retries: u32,
    ) -> Result<u64, DeliveryError> {
        if max_retries == 0 {
            return Ok(0);
        }
        self.ensure_tables().await?;

        let result = sqlx_core::query::query(
            "DELETE FROM _webhook_queue WHERE destination_id = $1 AND retries >= $2",
        )
        .bind(destination_id)
        .bind(failures_to_db(max_retries))
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(result.rows_affected())
    }

    async fn exists_for_destination(
        &self,
        destination_id: DestinationId,
    ) -> Result<bool, DeliveryError> {
        self.ensure_tables().await?;

        let (exists,): (bool,) = sqlx_core::query_as::query_as(
            "SELECT EXISTS (SELECT 1 FROM _webhook_queue WHERE destination_id = $1)",
        )
        .bind(destination_id)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(exists)
    }

    #[instrument(skip(self))]
    async fn purge_destination(&self, destination_id: DestinationId) -> Result<u64, DeliveryError> {
        self.ensure_tables().await?;

        let result = sqlx_core::query::query("DELETE FROM _webhook_queue WHERE destination_id = $1")
            .bind(destination_id)
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;

        info!(
            destination_id,
            purged = result.rows_affected(),
            "Purged webhook queue"
        );
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl DestinationStorage for PostgresWebhookStorage {
    async fn get(&self, id: DestinationId) -> Result<Option<Destination>, DeliveryError> {
        self.ensure_tables().await?;

        let sql = format!("SELECT {DESTINATION_COLUMNS} FROM _webhook_destinations WHERE id = $1");
        let row: Option<DestinationRow> = sqlx_core::query_as::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?;

        Ok(row.map(destination_from_row))
    }

    async fn list_published(&self) -> Result<Vec<Destination>, DeliveryError> {
        self.ensure_tables().await?;

        let sql = format!(
            "SELECT {DESTINATION_COLUMNS} FROM _webhook_destinations WHERE published ORDER BY id"
        );
        let rows: Vec<DestinationRow> = sqlx_core::query_as::query_as(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)?;

        Ok(rows.into_iter().map(destination_from_row).collect())
    }

    async fn list_for_event(&self, event_type: &str) -> Result<Vec<Destination>, DeliveryError> {
        self.ensure_tables().await?;

        let sql = format!(
            r#"
            SELECT {DESTINATION_COLUMNS} FROM _webhook_destinations
            WHERE published AND $1 = ANY(triggers)
            ORDER BY id
            "#
        );
        let rows: Vec<DestinationRow> = sqlx_core::query_as::query_as(&sql)
            .bind(event_type)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)?;

        Ok(rows.into_iter().map(destination_from_row).collect())
    }

    async fn save_health(
        &self,
        id: DestinationId,
        health: HealthState,
        consecutive_failures: u32,
    ) -> Result<(), DeliveryError> {
        self.ensure_tables().await?;

        let (marked, since) = health.to_columns();
        let result = sqlx_core::query::query(
            r#"
            UPDATE _webhook_destinations
            SET marked_unhealthy_at = $2, unhealthy_since = $3, consecutive_failures = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(time_to_chrono_opt(marked))
        .bind(time_to_chrono_opt(since))
        .bind(failures_to_db(consecutive_failures))
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        require_row(result, id)
    }

    async fn set_published(
        &self,
        id: DestinationId,
        published: bool,
    ) -> Result<(), DeliveryError> {
        self.ensure_tables().await?;

        let result =
            sqlx_core::query::query("UPDATE _webhook_destinations SET published = $2 WHERE id = $1")
                .bind(id)
                .bind(published)
                .execute(&self.pool)
                .await
                .map_err(storage_error)?;

        require_row(result, id)
    }

    async fn set_last_notification_sent_at(
        &self,
        id: DestinationId,
        at: OffsetDateTime,
    ) -> Result<(), DeliveryError> {
        self.ensure_tables().await?;

        let result = sqlx_core::query::query(
            "UPDATE _webhook_destinations SET last_notification_sent_at = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(time_to_chrono(at))
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        require_row(result, id)
    }
}

#[async_trait]
impl DeliveryLogStorage for PostgresWebhookStorage {
    async fn append_log(&self, entry: &DeliveryLogEntry, keep: u32) -> Result<(), DeliveryError> {
        self.ensure_tables().await?;

        sqlx_core::query::query(
            r#"
            INSERT INTO _webhook_logs (destination_id, status_code, runtime, note, date_added)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(entry.destination_id)
        .bind(entry.status_code.map(i32::from))
        .bind(entry.runtime)
        .bind(&entry.note)
        .bind(time_to_chrono(entry.date_added))
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        sqlx_core::query::query(
            r#"
            DELETE FROM _webhook_logs
            WHERE destination_id = $1
              AND id NOT IN (
                  SELECT id FROM _webhook_logs
                  WHERE destination_id = $1
                  ORDER BY id DESC
                  LIMIT $2
              )
            "#,
        )
        .bind(entry.destination_id)
        .bind(i64::from(keep))
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(())
    }

    async fn list_logs(
        &self,
        destination_id: DestinationId,
        limit: u32,
    ) -> Result<Vec<DeliveryLogEntry>, DeliveryError> {
        self.ensure_tables().await?;

        let rows: Vec<(i64, Option<i32>, f64, String, DateTime<Utc>)> =
            sqlx_core::query_as::query_as(
                r#"
                SELECT destination_id, status_code, runtime, note, date_added
                FROM _webhook_logs
                WHERE destination_id = $1
                ORDER BY id DESC
                LIMIT $2
                "#,
            )
            .bind(destination_id)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)?;

        Ok(rows
            .into_iter()
            .map(
                |(destination_id, status_code, runtime, note, date_added)| DeliveryLogEntry {
                    destination_id,
                    status_code: status_code.and_then(|c| u16::try_from(c).ok()),
                    runtime,
                    note,
                    date_added: chrono_to_time(date_added),
                },
            )
            .collect())
    }
}
