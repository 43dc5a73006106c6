//! PostgreSQL storage backend for hookrelay.
//!
//! Implements the delivery queue, destination and delivery log storage
//! traits from `hookrelay-delivery`, plus the user directory and in-app
//! notification inbox used by failure alerts. Tables are created on first
//! use.
//!
//! ```ignore
//! use hookrelay_db_postgres::{PostgresConfig, PostgresWebhookStorage, create_pool};
//!
//! let pool = create_pool(&PostgresConfig::new("postgres://hooks@localhost/hookrelay")).await?;
//! let storage = PostgresWebhookStorage::new(pool);
//! storage.ensure_tables().await?;
//! ```

mod config;
mod error;
mod pool;
mod time_conv;
mod users;
mod webhook_storage;

pub use config::PostgresConfig;
pub use error::{PostgresError, Result};
pub use pool::{PgPoolOptions, create_pool, mask_password};
pub use users::PostgresUserDirectory;
pub use webhook_storage::PostgresWebhookStorage;

pub use sqlx_postgres::PgPool;
