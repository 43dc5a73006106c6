//! User lookup and in-app notifications backed by PostgreSQL.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashSet;
use sqlx_postgres::PgPool;
use tracing::{debug, info, instrument};

use hookrelay_delivery::{
    DeliveryError, InAppNotification, InAppNotificationSink, User, UserDirectory, UserId,
};

use crate::error::storage_error;

const USER_TABLES: &str = "users";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS _users (
        id BIGINT PRIMARY KEY,
        name TEXT NOT NULL,
        email TEXT NOT NULL,
        is_admin BOOLEAN NOT NULL DEFAULT FALSE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS _inapp_notifications (
        id BIGSERIAL PRIMARY KEY,
        user_id BIGINT NOT NULL REFERENCES _users(id) ON DELETE CASCADE,
        header TEXT NOT NULL,
        message TEXT NOT NULL,
        kind TEXT NOT NULL,
        is_read BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_inapp_notifications_user ON _inapp_notifications(user_id, is_read)",
];

/// PostgreSQL user directory and in-app notification inbox.
#[derive(Clone)]
pub struct PostgresUserDirectory {
    pool: PgPool,
    tables_created: Arc<DashSet<String>>,
}

impl PostgresUserDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            tables_created: Arc::new(DashSet::new()),
        }
    }

    #[instrument(skip(self))]
    pub async fn ensure_tables(&self) -> Result<(), DeliveryError> {
        if self.tables_created.contains(USER_TABLES) {
            return Ok(());
        }

        for statement in SCHEMA {
            sqlx_core::query::query(statement)
                .execute(&self.pool)
                .await
                .map_err(storage_error)?;
        }

        info!("Created user and in-app notification tables");
        self.tables_created.insert(USER_TABLES.to_string());
        Ok(())
    }

    pub async fn save_user(&self, user: &User, is_admin: bool) -> Result<(), DeliveryError> {
        self.ensure_tables().await?;

        sqlx_core::query::query(
            r#"
            INSERT INTO _users (id, name, email, is_admin)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                email = EXCLUDED.email,
                is_admin = EXCLUDED.is_admin
            "#,
        )
        .bind(user.id)
        .bind(&user.name)
        .bind(&user.email)
        .bind(is_admin)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(())
    }

    /// Unread notifications of a user, newest first.
    pub async fn unread(&self, user_id: UserId) -> Result<Vec<InAppNotification>, DeliveryError> {
        self.ensure_tables().await?;

        let rows: Vec<(i64, String, String, String)> = sqlx_core::query_as::query_as(
            r#"
            SELECT user_id, header, message, kind
            FROM _inapp_notifications
            WHERE user_id = $1 AND NOT is_read
            ORDER BY id DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(rows
            .into_iter()
            .map(|(user_id, header, message, kind)| InAppNotification {
                user_id,
                header,
                message,
                kind,
            })
            .collect())
    }
}

#[async_trait]
impl UserDirectory for PostgresUserDirectory {
    async fn get(&self, id: UserId) -> Result<Option<User>, DeliveryError> {
        self.ensure_tables().await?;

        let row: Option<(i64, String, String)> =
            sqlx_core::query_as::query_as("SELECT id, name, email FROM _users WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage_error)?;

        Ok(row.map(|(id, name, email)| User { id, name, email }))
    }

    async fn administrators(&self) -> Result<Vec<User>, DeliveryError> {
        self.ensure_tables().await?;

        let rows: Vec<(i64, String, String)> = sqlx_core::query_as::query_as(
            "SELECT id, name, email FROM _users WHERE is_admin ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(rows
            .into_iter()
            .map(|(id, name, email)| User { id, name, email })
            .collect())
    }
}

#[async_trait]
impl InAppNotificationSink for PostgresUserDirectory {
    async fn add(&self, notification: &InAppNotification) -> Result<(), DeliveryError> {
        self.ensure_tables().await?;

        sqlx_core::query::query(
            r#"
            INSERT INTO _inapp_notifications (user_id, header, message, kind)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(notification.user_id)
        .bind(&notification.header)
        .bind(&notification.message)
        .bind(&notification.kind)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        debug!(user_id = notification.user_id, "Stored in-app notification");
        Ok(())
    }
}
