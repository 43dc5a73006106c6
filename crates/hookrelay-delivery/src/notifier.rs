//! Throttled alerts about destinations that stay unhealthy.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use time::format_description::well_known::Rfc3339;
use tracing::{debug, info, warn};

use crate::clock::{Clock, saturating_before};
use crate::config::DeliveryConfig;
use crate::error::DeliveryError;
use crate::mailer::{Mailer, OutgoingEmail};
use crate::queue::DestinationStorage;
use crate::templates::{FAILURE_ALERT_TEMPLATE, TemplateRenderer};
use crate::types::{Destination, User, UserId};

/// Returns `true` to suppress an alert regardless of the gates.
pub type VetoFn = Arc<dyn Fn(&Destination) -> bool + Send + Sync>;

/// Message shown in the recipient's in-app notification list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InAppNotification {
    pub user_id: UserId,
    pub header: String,
    pub message: String,
    /// Display category, e.g. `error`
    pub kind: String,
}

#[async_trait]
pub trait InAppNotificationSink: Send + Sync {
    async fn add(&self, notification: &InAppNotification) -> Result<(), DeliveryError>;
}

/// Read access to users for alert routing
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get(&self, id: UserId) -> Result<Option<User>, DeliveryError>;

    async fn administrators(&self) -> Result<Vec<User>, DeliveryError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyOutcome {
    Vetoed,
    /// Healthy, or unhealthy for less than the first-alert delay
    OutageTooShort,
    /// Already alerted within the notification interval
    Throttled,
    NoRecipient,
    Sent { recipients: Vec<UserId> },
}

struct Recipients {
    primary: Vec<User>,
    cc: Option<User>,
}

pub struct FailureNotifier {
    config: Arc<DeliveryConfig>,
    clock: Arc<dyn Clock>,
    destinations: Arc<dyn DestinationStorage>,
    users: Arc<dyn UserDirectory>,
    inbox: Arc<dyn InAppNotificationSink>,
    mailer: Arc<dyn Mailer>,
    templates: TemplateRenderer,
    vetoes: Vec<VetoFn>,
}

impl FailureNotifier {
    pub fn new(
        config: Arc<DeliveryConfig>,
        clock: Arc<dyn Clock>,
        destinations: Arc<dyn DestinationStorage>,
        users: Arc<dyn UserDirectory>,
        inbox: Arc<dyn InAppNotificationSink>,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        let mut vetoes: Vec<VetoFn> = Vec::new();
        if !config.notifications_enabled {
            vetoes.push(Arc::new(|_| true));
        }
        Self {
            config,
            clock,
            destinations,
            users,
            inbox,
            mailer,
            templates: TemplateRenderer::with_defaults(),
            vetoes,
        }
    }

    pub fn with_veto(mut self, veto: VetoFn) -> Self {
        self.vetoes.push(veto);
        self
    }

    pub fn with_templates(mut self, templates: TemplateRenderer) -> Self {
        self.templates = templates;
        self
    }

    /// Alert the destination's editor (or owner, or administrators) if the
    /// outage is long enough and no alert went out recently.
    pub async fn maybe_notify(
        &self,
        destination: &mut Destination,
        reason: &str,
    ) -> Result<NotifyOutcome, DeliveryError> {
        if self.vetoes.iter().any(|veto| veto(destination)) {
            debug!(destination_id = destination.id, "Failure alert vetoed");
            return Ok(NotifyOutcome::Vetoed);
        }

        let now = self.clock.now();
        let Some(since) = destination.health.unhealthy_since() else {
            return Ok(NotifyOutcome::OutageTooShort);
        };
        if since >= saturating_before(now, self.config.first_failure_notification_time()) {
            return Ok(NotifyOutcome::OutageTooShort);
        }
        if let Some(last) = destination.last_notification_sent_at
            && last >= saturating_before(now, self.config.failure_notification_interval())
        {
            return Ok(NotifyOutcome::Throttled);
        }

        let Some(recipients) = self.resolve_recipients(destination).await? else {
            warn!(destination_id = destination.id, "No recipient for failure alert");
            return Ok(NotifyOutcome::NoRecipient);
        };

        let content = self
            .templates
            .render(FAILURE_ALERT_TEMPLATE, &self.template_data(destination, reason, since))?;
        let subject = content
            .subject
            .unwrap_or_else(|| format!("Webhook \"{}\" is failing", destination.name));

        for user in &recipients.primary {
            self.inbox
                .add(&InAppNotification {
                    user_id: user.id,
                    header: subject.clone(),
                    message: content.body.clone(),
                    kind: "error".into(),
                })
                .await?;
        }

        let email = OutgoingEmail {
            to: recipients.primary.iter().map(|u| u.email.clone()).collect(),
            cc: recipients.cc.iter().map(|u| u.email.clone()).collect(),
            subject,
            body: content.body,
        };
        if let Err(e) = self.mailer.send(&email).await {
            warn!(destination_id = destination.id, error = %e, "Failure alert email not sent");
        }

        self.destinations
            .set_last_notification_sent_at(destination.id, now)
            .await?;
        destination.last_notification_sent_at = Some(now);

        let ids: Vec<UserId> = recipients.primary.iter().map(|u| u.id).collect();
        info!(
            destination_id = destination.id,
            recipients = ?ids,
            "Failure alert sent"
        );
        Ok(NotifyOutcome::Sent { recipients: ids })
    }

    /// Editor first, then owner, then every administrator. The owner is
    /// copied when someone else edited the destination last.
    async fn resolve_recipients(
        &self,
        destination: &Destination,
    ) -> Result<Option<Recipients>, DeliveryError> {
        let owner = match destination.created_by {
            Some(id) => self.users.get(id).await?,
            None => None,
        };
        let editor = match destination.modified_by {
            Some(id) => self.users.get(id).await?,
            None => None,
        };

        let recipients = match (editor, owner) {
            (Some(editor), Some(owner)) if editor.id != owner.id => Recipients {
                primary: vec![editor],
                cc: Some(owner),
            },
            (Some(user), _) | (None, Some(user)) => Recipients {
                primary: vec![user],
                cc: None,
            },
            (None, None) => Recipients {
                primary: self.users.administrators().await?,
                cc: None,
            },
        };

        Ok((!recipients.primary.is_empty()).then_some(recipients))
    }

    fn template_data(
        &self,
        destination: &Destination,
        reason: &str,
        since: time::OffsetDateTime,
    ) -> HashMap<String, Value> {
        let details = if self.config.webhook_email_details {
            json!(format!("URL: {}", destination.url))
        } else {
            Value::Null
        };
        HashMap::from([
            ("name".to_string(), json!(destination.name)),
            ("reason".to_string(), json!(reason)),
            (
                "since".to_string(),
                json!(since.format(&Rfc3339).unwrap_or_default()),
            ),
            ("sender".to_string(), json!(self.config.sender_name)),
            ("details".to_string(), details),
        ])
    }
}
