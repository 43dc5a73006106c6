use async_trait::async_trait;
use serde_json::Value;
use time::OffsetDateTime;

use crate::clock::saturating_after;
use crate::error::DeliveryError;
use crate::types::{
    DeliveryLogEntry, Destination, DestinationId, EventRef, HealthState, IdRange, QueueEntry,
    QueueEntryId,
};

/// Which rows `fetch_batch` may hand out, evaluated against `now`.
#[derive(Debug, Clone, Copy)]
pub struct FetchEligibility {
    pub now: OffsetDateTime,
    /// Claimed rows stay invisible until `now + lease`
    pub lease: time::Duration,
    /// A row with `retries > 0` is skipped until `date_modified + retry_delay`
    pub retry_delay: time::Duration,
}

impl FetchEligibility {
    pub fn is_eligible(&self, entry: &QueueEntry) -> bool {
        if entry.claimed_until.is_some_and(|until| until > self.now) {
            return false;
        }
        if entry.retries > 0
            && let Some(modified) = entry.date_modified
        {
            return saturating_after(modified, self.retry_delay) <= self.now;
        }
        true
    }

    pub fn claim_until(&self) -> OffsetDateTime {
        saturating_after(self.now, self.lease)
    }
}

/// Storage trait for the delivery queue
#[async_trait]
pub trait DeliveryQueueStorage: Send + Sync {
    /// Compress `payload` and append one pending row
    async fn append(
        &self,
        destination_id: DestinationId,
        event: &EventRef,
        payload: &Value,
        now: OffsetDateTime,
    ) -> Result<QueueEntry, DeliveryError>;

    /// Claim up to `limit` eligible rows of a destination in ID order,
    /// optionally restricted to an inclusive ID window
    async fn fetch_batch(
        &self,
        destination_id: DestinationId,
        limit: u32,
        range: Option<IdRange>,
        eligibility: FetchEligibility,
    ) -> Result<Vec<QueueEntry>, DeliveryError>;

    /// Bulk delete; empty input is a no-op
    async fn delete_by_ids(&self, ids: &[QueueEntryId]) -> Result<u64, DeliveryError>;

    /// Bulk `retries += 1`, `date_modified = now`, lease released
    async fn increment_retry(
        &self,
        ids: &[QueueEntryId],
        now: OffsetDateTime,
    ) -> Result<u64, DeliveryError>;

    /// Drop rows that reached the retry ceiling
    async fn delete_exhausted(
        &self,
        destination_id: DestinationId,
        max_retries: u32,
    ) -> Result<u64, DeliveryError>;

    async fn exists_for_destination(
        &self,
        destination_id: DestinationId,
    ) -> Result<bool, DeliveryError>;

    /// Administrative purge of every pending row of a destination
    async fn purge_destination(&self, destination_id: DestinationId) -> Result<u64, DeliveryError>;
}

/// Storage trait for destinations. Creation and editing belong to the
/// administration layer; this side only reads them and writes health fields.
#[async_trait]
pub trait DestinationStorage: Send + Sync {
    async fn get(&self, id: DestinationId) -> Result<Option<Destination>, DeliveryError>;

    async fn list_published(&self) -> Result<Vec<Destination>, DeliveryError>;

    /// Published destinations subscribed to `event_type`
    async fn list_for_event(&self, event_type: &str) -> Result<Vec<Destination>, DeliveryError>;

    async fn save_health(
        &self,
        id: DestinationId,
        health: HealthState,
        consecutive_failures: u32,
    ) -> Result<(), DeliveryError>;

    async fn set_published(&self, id: DestinationId, published: bool)
    -> Result<(), DeliveryError>;

    async fn set_last_notification_sent_at(
        &self,
        id: DestinationId,
        at: OffsetDateTime,
    ) -> Result<(), DeliveryError>;
}

/// Storage trait for delivery attempt logs
#[async_trait]
pub trait DeliveryLogStorage: Send + Sync {
    /// Append one entry, then keep only the newest `keep` entries of that destination
    async fn append_log(&self, entry: &DeliveryLogEntry, keep: u32) -> Result<(), DeliveryError>;

    /// Newest first
    async fn list_logs(
        &self,
        destination_id: DestinationId,
        limit: u32,
    ) -> Result<Vec<DeliveryLogEntry>, DeliveryError>;
}
