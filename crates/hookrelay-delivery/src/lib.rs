pub mod clock;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod mailer;
pub mod memory;
pub mod notifier;
pub mod orchestrator;
pub mod queue;
pub mod ssrf;
pub mod templates;
pub mod test_send;
pub mod transport;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DeliveryConfig, QueueMode};
pub use dispatcher::{FireReport, WebhookDispatcher};
pub use error::DeliveryError;
pub use health::HealthTracker;
pub use mailer::{LogMailer, Mailer, OutgoingEmail, SmtpMailer, SmtpSettings};
pub use memory::{InMemoryUsers, InMemoryWebhookStorage};
pub use notifier::{
    FailureNotifier, InAppNotification, InAppNotificationSink, NotifyOutcome, UserDirectory,
    VetoFn,
};
pub use orchestrator::{DrainOrchestrator, DrainOutcome, DrainReport, DrainRequest};
pub use queue::{DeliveryLogStorage, DeliveryQueueStorage, DestinationStorage, FetchEligibility};
pub use ssrf::SsrfPolicy;
pub use templates::{Template, TemplateRenderer};
pub use test_send::{Banner, TestSendOutcome, sample_payload, send_test};
pub use transport::{HttpTransport, TransportClient, TransportResponse};
pub use types::*;
