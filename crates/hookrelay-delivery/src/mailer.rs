use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::DeliveryError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), DeliveryError>;
}

/// SMTP relay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpSettings {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub from: String,
}

fn default_smtp_port() -> u16 {
    587
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(settings: &SmtpSettings) -> Result<Self, DeliveryError> {
        let from = settings
            .from
            .parse()
            .map_err(|e| DeliveryError::InvalidConfig(format!("Invalid from: {}", e)))?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.host)
            .map_err(|e| DeliveryError::InvalidConfig(e.to_string()))?
            .port(settings.port);

        if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

/// Build the lettre message; at least one `to` address is required.
pub fn build_message(from: Mailbox, email: &OutgoingEmail) -> Result<Message, DeliveryError> {
    if email.to.is_empty() {
        return Err(DeliveryError::Mail("no recipients".into()));
    }

    let mut builder = Message::builder().from(from).subject(&email.subject);
    for to in &email.to {
        builder = builder.to(to
            .parse()
            .map_err(|e| DeliveryError::Mail(format!("Invalid to {}: {}", to, e)))?);
    }
    for cc in &email.cc {
        builder = builder.cc(cc
            .parse()
            .map_err(|e| DeliveryError::Mail(format!("Invalid cc {}: {}", cc, e)))?);
    }

    builder
        .header(ContentType::TEXT_PLAIN)
        .body(email.body.clone())
        .map_err(|e| DeliveryError::Mail(e.to_string()))
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), DeliveryError> {
        let message = build_message(self.from.clone(), email)?;
        self.transport
            .send(message)
            .await
            .map_err(|e| DeliveryError::Mail(e.to_string()))?;
        Ok(())
    }
}

/// Used when no SMTP relay is configured: the alert is only logged.
#[derive(Debug, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), DeliveryError> {
        info!(
            to = ?email.to,
            cc = ?email.cc,
            subject = %email.subject,
            "SMTP not configured, email not sent"
        );
        Ok(())
    }
}
