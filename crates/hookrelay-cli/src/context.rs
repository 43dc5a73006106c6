use std::sync::Arc;

use anyhow::{Context, Result};
use hookrelay_db_postgres::{PostgresUserDirectory, PostgresWebhookStorage, create_pool};
use hookrelay_delivery::{
    Clock, DrainOrchestrator, FailureNotifier, HttpTransport, LogMailer, Mailer, SmtpMailer,
    SystemClock,
};

use crate::config::AppConfig;

/// Everything a command needs, wired against PostgreSQL.
pub struct AppContext {
    pub clock: Arc<dyn Clock>,
    pub storage: Arc<PostgresWebhookStorage>,
    pub transport: Arc<HttpTransport>,
    pub orchestrator: DrainOrchestrator,
}

impl AppContext {
    pub async fn connect(cfg: &AppConfig) -> Result<Self> {
        let pool = create_pool(&cfg.storage.postgres.pool_config())
            .await
            .context("failed to connect to PostgreSQL")?;

        let storage = Arc::new(PostgresWebhookStorage::new(pool.clone()));
        storage
            .ensure_tables()
            .await
            .context("failed to prepare webhook tables")?;
        let users = Arc::new(PostgresUserDirectory::new(pool));
        users
            .ensure_tables()
            .await
            .context("failed to prepare user tables")?;

        let mailer: Arc<dyn Mailer> = match &cfg.smtp {
            Some(smtp) => Arc::new(SmtpMailer::new(smtp).context("invalid SMTP settings")?),
            None => Arc::new(LogMailer),
        };

        let delivery = Arc::new(cfg.delivery.clone());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let transport =
            Arc::new(HttpTransport::new(&delivery).context("failed to build HTTP client")?);

        let notifier = FailureNotifier::new(
            delivery.clone(),
            clock.clone(),
            storage.clone(),
            users.clone(),
            users,
            mailer,
        );
        let orchestrator = DrainOrchestrator::new(
            delivery,
            clock.clone(),
            storage.clone(),
            storage.clone(),
            storage.clone(),
            transport.clone(),
        )
        .with_notifier(notifier);

        Ok(Self {
            clock,
            storage,
            transport,
            orchestrator,
        })
    }
}
