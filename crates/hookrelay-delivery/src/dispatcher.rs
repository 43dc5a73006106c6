use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::QueueMode;
use crate::error::DeliveryError;
use crate::orchestrator::{AttemptResult, DrainOrchestrator, build_event_body};
use crate::types::{DestinationId, EventRef};

/// What happened to a fired event for each subscribed destination
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FireReport {
    pub queued: Vec<DestinationId>,
    pub delivered: Vec<DestinationId>,
    pub failed: Vec<DestinationId>,
    /// Unhealthy destinations skipped in immediate mode
    pub skipped: Vec<DestinationId>,
}

/// Entry point for fired domain events.
///
/// In queued mode the event is appended to the queue of every subscribed
/// destination. In immediate mode it is posted right away with the same
/// bookkeeping as a drained batch.
pub struct WebhookDispatcher {
    orchestrator: Arc<DrainOrchestrator>,
}

impl WebhookDispatcher {
    pub fn new(orchestrator: Arc<DrainOrchestrator>) -> Self {
        Self { orchestrator }
    }

    pub async fn fire(&self, event: &EventRef, payload: &Value) -> Result<FireReport, DeliveryError> {
        let destinations = self
            .orchestrator
            .destinations()
            .list_for_event(&event.event_type)
            .await?;
        let mut report = FireReport::default();
        let now = self.orchestrator.now();

        match self.orchestrator.config().queue_mode {
            QueueMode::Queued => {
                for destination in destinations {
                    let entry = self
                        .orchestrator
                        .queue()
                        .append(destination.id, event, payload, now)
                        .await?;
                    debug!(
                        destination_id = destination.id,
                        row_id = entry.id,
                        event_type = %event.event_type,
                        "Queued event"
                    );
                    report.queued.push(destination.id);
                }
            }
            QueueMode::Immediate => {
                for mut destination in destinations {
                    if !self.orchestrator.health().is_healthy(&destination) {
                        debug!(destination_id = destination.id, "Skipping unhealthy destination");
                        report.skipped.push(destination.id);
                        continue;
                    }
                    let body = build_event_body(&event.event_type, payload.clone(), now)?;
                    match self.orchestrator.attempt(&mut destination, &body).await? {
                        AttemptResult::Delivered => report.delivered.push(destination.id),
                        AttemptResult::Failed { .. } => report.failed.push(destination.id),
                    }
                }
            }
        }

        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            queued = report.queued.len(),
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "Event fired"
        );
        Ok(report)
    }
}
