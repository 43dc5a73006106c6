//! Batch drain of the delivery queue.
//!
//! One `run` is one job invocation: pick the eligible destinations, post
//! their pending rows in batches of `webhook_limit`, and do the health,
//! retry and alert bookkeeping for every attempt. Destinations and batches
//! are processed sequentially; parallelism comes from running several jobs
//! over disjoint ID ranges.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::{Map, Value};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, saturating_after};
use crate::config::{DeliveryConfig, QueueMode};
use crate::error::DeliveryError;
use crate::health::HealthTracker;
use crate::notifier::FailureNotifier;
use crate::queue::{DeliveryLogStorage, DeliveryQueueStorage, DestinationStorage, FetchEligibility};
use crate::transport::TransportClient;
use crate::types::{DeliveryLogEntry, Destination, DestinationId, IdRange, QueueEntry};

const LOG_NOTE_MAX_CHARS: usize = 255;

/// Arguments of one drain job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainRequest {
    /// Restrict the job to one destination
    pub destination_id: Option<DestinationId>,
    /// Range mode; only valid together with `destination_id`
    pub range: Option<IdRange>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Events are delivered when they fire; nothing to drain.
    NotQueuedMode,
    NoEligibleDestinations,
    Completed(DrainReport),
}

/// Counters of a completed drain job
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub destinations: u32,
    pub batches: u32,
    /// Rows deleted after a 2xx response
    pub delivered: u64,
    /// Rows whose attempt failed and were kept for a retry
    pub failed: u64,
    /// Rows dropped at the retry ceiling; never also counted in `failed`
    pub dropped: u64,
    /// Destinations unpublished during this run
    pub disabled: u32,
    pub time_limit_reached: bool,
}

/// How a single POST went, after bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AttemptResult {
    Delivered,
    Failed { reason: String },
}

enum BatchResult {
    Empty,
    Delivered,
    Failed,
}

pub struct DrainOrchestrator {
    config: Arc<DeliveryConfig>,
    clock: Arc<dyn Clock>,
    queue: Arc<dyn DeliveryQueueStorage>,
    destinations: Arc<dyn DestinationStorage>,
    logs: Arc<dyn DeliveryLogStorage>,
    transport: Arc<dyn TransportClient>,
    health: HealthTracker,
    notifier: Option<FailureNotifier>,
}

impl DrainOrchestrator {
    pub fn new(
        config: Arc<DeliveryConfig>,
        clock: Arc<dyn Clock>,
        queue: Arc<dyn DeliveryQueueStorage>,
        destinations: Arc<dyn DestinationStorage>,
        logs: Arc<dyn DeliveryLogStorage>,
        transport: Arc<dyn TransportClient>,
    ) -> Self {
        let health = HealthTracker::new(config.clone(), clock.clone(), destinations.clone());
        Self {
            config,
            clock,
            queue,
            destinations,
            logs,
            transport,
            health,
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: FailureNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    pub(crate) fn queue(&self) -> &Arc<dyn DeliveryQueueStorage> {
        &self.queue
    }

    pub(crate) fn destinations(&self) -> &Arc<dyn DestinationStorage> {
        &self.destinations
    }

    pub(crate) fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    /// Run one drain job.
    #[instrument(skip(self), fields(destination_id = ?request.destination_id, range = ?request.range))]
    pub async fn run(&self, request: DrainRequest) -> Result<DrainOutcome, DeliveryError> {
        if self.config.queue_mode != QueueMode::Queued {
            info!("Queue mode is not enabled, nothing to drain");
            return Ok(DrainOutcome::NotQueuedMode);
        }
        self.validate(&request)?;

        let Some(selected) = self.select(&request).await? else {
            info!("No published and healthy destinations to drain");
            return Ok(DrainOutcome::NoEligibleDestinations);
        };

        let deadline = saturating_after(self.clock.now(), self.config.time_limit());
        let mut report = DrainReport::default();

        'destinations: for mut destination in selected {
            report.destinations += 1;
            debug!(destination_id = destination.id, "Draining destination");

            match request.range {
                Some(range) => {
                    for window in range.windows(self.config.webhook_limit) {
                        if self.clock.now() >= deadline {
                            report.time_limit_reached = true;
                            break 'destinations;
                        }
                        let result = self
                            .drain_batch(&mut destination, Some(window), &mut report)
                            .await?;
                        if matches!(result, BatchResult::Failed) {
                            break;
                        }
                    }
                }
                None => loop {
                    if self.clock.now() >= deadline {
                        report.time_limit_reached = true;
                        break 'destinations;
                    }
                    match self.drain_batch(&mut destination, None, &mut report).await? {
                        BatchResult::Delivered => continue,
                        BatchResult::Empty | BatchResult::Failed => break,
                    }
                },
            }
        }

        if report.time_limit_reached {
            warn!(
                time_limit = self.config.webhook_time_limit,
                "Drain time limit reached, remaining rows are left for the next run"
            );
        }
        info!(
            destinations = report.destinations,
            batches = report.batches,
            delivered = report.delivered,
            failed = report.failed,
            dropped = report.dropped,
            "Drain finished"
        );
        Ok(DrainOutcome::Completed(report))
    }

    fn validate(&self, request: &DrainRequest) -> Result<(), DeliveryError> {
        if self.config.webhook_limit == 0 {
            return Err(DeliveryError::InvalidConfig(
                "webhook_limit must be greater than 0".into(),
            ));
        }
        if let Some(range) = request.range {
            if request.destination_id.is_none() {
                return Err(DeliveryError::InvalidConfig(
                    "range mode requires a destination id".into(),
                ));
            }
            if range.min > range.max {
                return Err(DeliveryError::InvalidConfig(format!(
                    "min id {} is greater than max id {}",
                    range.min, range.max
                )));
            }
        }
        Ok(())
    }

    /// `None` when no destination is published and healthy. Otherwise the
    /// eligible destinations that have queued rows; a named destination is
    /// always kept.
    async fn select(
        &self,
        request: &DrainRequest,
    ) -> Result<Option<Vec<Destination>>, DeliveryError> {
        if let Some(id) = request.destination_id {
            let destination = self
                .destinations
                .get(id)
                .await?
                .ok_or(DeliveryError::DestinationNotFound(id))?;
            if !destination.published || !self.health.is_healthy(&destination) {
                debug!(destination_id = id, "Destination is unpublished or unhealthy");
                return Ok(None);
            }
            return Ok(Some(vec![destination]));
        }

        let mut eligible = 0usize;
        let mut selected = Vec::new();
        for destination in self.destinations.list_published().await? {
            if !self.health.is_healthy(&destination) {
                debug!(destination_id = destination.id, "Skipping unhealthy destination");
                continue;
            }
            eligible += 1;
            if self.queue.exists_for_destination(destination.id).await? {
                selected.push(destination);
            }
        }
        Ok((eligible > 0).then_some(selected))
    }

    async fn drain_batch(
        &self,
        destination: &mut Destination,
        window: Option<IdRange>,
        report: &mut DrainReport,
    ) -> Result<BatchResult, DeliveryError> {
        let now = self.clock.now();
        let eligibility = FetchEligibility {
            now,
            lease: self.config.lease_time(),
            retry_delay: self.config.retry_delay(),
        };
        let rows = self
            .queue
            .fetch_batch(destination.id, self.config.webhook_limit, window, eligibility)
            .await?;
        if rows.is_empty() {
            return Ok(BatchResult::Empty);
        }

        report.batches += 1;
        let ids: Vec<_> = rows.iter().map(|row| row.id).collect();
        let body = build_batch_body(&rows, now)?;
        let was_published = destination.published;

        let result = match self.attempt(destination, &body).await? {
            AttemptResult::Delivered => {
                let deleted = self.queue.delete_by_ids(&ids).await?;
                report.delivered += deleted;
                BatchResult::Delivered
            }
            AttemptResult::Failed { .. } => {
                self.queue.increment_retry(&ids, self.clock.now()).await?;

                let dropped = self
                    .queue
                    .delete_exhausted(destination.id, self.config.webhook_max_retries)
                    .await?;
                if dropped > 0 {
                    warn!(
                        destination_id = destination.id,
                        dropped,
                        max_retries = self.config.webhook_max_retries,
                        "Dropped rows that reached the retry ceiling"
                    );
                }
                report.dropped += dropped;
                report.failed += (ids.len() as u64).saturating_sub(dropped);
                BatchResult::Failed
            }
        };

        if was_published && !destination.published {
            report.disabled += 1;
        }
        Ok(result)
    }

    /// POST `body` to the destination and record the attempt: delivery log,
    /// health state, failure counter, auto-unpublish and failure alert.
    ///
    /// Transport failures and rejected addresses are folded into
    /// `AttemptResult::Failed`; only storage and codec errors are returned.
    pub(crate) async fn attempt(
        &self,
        destination: &mut Destination,
        body: &Value,
    ) -> Result<AttemptResult, DeliveryError> {
        let started = Instant::now();
        let response = self
            .transport
            .post(&destination.url, body, destination.secret.as_deref())
            .await;
        let runtime = started.elapsed().as_secs_f64();

        let (status_code, note, result, permanent) = match response {
            Ok(response) if response.is_success() => (
                Some(response.status),
                truncate_note(&response.body),
                AttemptResult::Delivered,
                false,
            ),
            Ok(response) => (
                Some(response.status),
                truncate_note(&response.body),
                AttemptResult::Failed {
                    reason: format!("HTTP {}", response.status),
                },
                false,
            ),
            Err(e @ (DeliveryError::Transport(_)
            | DeliveryError::PrivateAddress(_)
            | DeliveryError::InvalidUrl(_))) => {
                let permanent = e.is_permanent();
                let reason = e.to_string();
                (
                    None,
                    truncate_note(&reason),
                    AttemptResult::Failed { reason },
                    permanent,
                )
            }
            Err(e) => return Err(e),
        };

        self.logs
            .append_log(
                &DeliveryLogEntry {
                    destination_id: destination.id,
                    status_code,
                    runtime,
                    note,
                    date_added: self.clock.now(),
                },
                self.config.webhook_log_max,
            )
            .await?;

        match &result {
            AttemptResult::Delivered => {
                debug!(destination_id = destination.id, runtime, "Delivered");
                self.health.record_success(destination).await?;
            }
            AttemptResult::Failed { reason } => {
                warn!(
                    destination_id = destination.id,
                    status = ?status_code,
                    reason = %reason,
                    "Delivery failed"
                );
                self.health.record_failure(destination).await?;
                if permanent {
                    self.health.disable_permanently(destination, reason).await?;
                }
                if let Some(notifier) = &self.notifier {
                    notifier.maybe_notify(destination, reason).await?;
                }
            }
        }
        Ok(result)
    }
}

/// Wire body of one event: `{ "<event_type>": [payload], "timestamp": ... }`.
pub fn build_event_body(
    event_type: &str,
    payload: Value,
    now: OffsetDateTime,
) -> Result<Value, DeliveryError> {
    let mut groups = BTreeMap::new();
    groups.insert(event_type.to_string(), vec![payload]);
    finish_body(groups, now)
}

/// Wire body of a batch: payloads grouped by event type in queue order.
/// Rows without a payload contribute nothing; undecodable rows are skipped.
pub fn build_batch_body(rows: &[QueueEntry], now: OffsetDateTime) -> Result<Value, DeliveryError> {
    let mut groups: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for row in rows {
        match row.decoded_payload() {
            Ok(Some(payload)) => groups
                .entry(row.event.event_type.clone())
                .or_default()
                .push(payload),
            Ok(None) => {}
            Err(e) => warn!(row_id = row.id, error = %e, "Skipping undecodable payload"),
        }
    }
    finish_body(groups, now)
}

fn finish_body(
    groups: BTreeMap<String, Vec<Value>>,
    now: OffsetDateTime,
) -> Result<Value, DeliveryError> {
    let timestamp = now
        .format(&Rfc3339)
        .map_err(|e| DeliveryError::Internal(e.to_string()))?;
    let mut body: Map<String, Value> = groups
        .into_iter()
        .map(|(event_type, payloads)| (event_type, Value::Array(payloads)))
        .collect();
    body.insert("timestamp".into(), Value::String(timestamp));
    Ok(Value::Object(body))
}

fn truncate_note(text: &str) -> String {
    text.chars().take(LOG_NOTE_MAX_CHARS).collect()
}
