use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::codec;
use crate::error::DeliveryError;

pub type DestinationId = i64;
pub type QueueEntryId = i64;
pub type UserId = i64;

/// Health of a destination.
///
/// `Unhealthy` carries both the start of the current outage and the last time
/// a delivery failed; the destination becomes eligible again once
/// `last_marked` falls behind the health-check threshold, without any write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum HealthState {
    #[default]
    Healthy,
    Unhealthy {
        #[serde(with = "time::serde::rfc3339")]
        since: OffsetDateTime,
        #[serde(with = "time::serde::rfc3339")]
        last_marked: OffsetDateTime,
    },
}

impl HealthState {
    /// Rebuild from the two nullable persisted columns. A half-set pair is
    /// repaired by using the present value for both.
    pub fn from_columns(
        marked_unhealthy_at: Option<OffsetDateTime>,
        unhealthy_since: Option<OffsetDateTime>,
    ) -> Self {
        match (marked_unhealthy_at, unhealthy_since) {
            (None, None) => Self::Healthy,
            (Some(last_marked), Some(since)) => Self::Unhealthy { since, last_marked },
            (Some(t), None) | (None, Some(t)) => Self::Unhealthy {
                since: t,
                last_marked: t,
            },
        }
    }

    /// `(marked_unhealthy_at, unhealthy_since)`
    pub fn to_columns(self) -> (Option<OffsetDateTime>, Option<OffsetDateTime>) {
        match self {
            Self::Healthy => (None, None),
            Self::Unhealthy { since, last_marked } => (Some(last_marked), Some(since)),
        }
    }

    pub fn is_healthy(&self, threshold: OffsetDateTime) -> bool {
        match self {
            Self::Healthy => true,
            Self::Unhealthy { last_marked, .. } => *last_marked < threshold,
        }
    }

    /// Failure transition. The outage start is kept across repeated failures.
    pub fn failed(self, now: OffsetDateTime) -> Self {
        match self {
            Self::Healthy => Self::Unhealthy {
                since: now,
                last_marked: now,
            },
            Self::Unhealthy { since, .. } => Self::Unhealthy {
                since,
                last_marked: now,
            },
        }
    }

    /// Success transition, closes any outage.
    pub fn recovered(self) -> Self {
        Self::Healthy
    }

    pub fn unhealthy_since(&self) -> Option<OffsetDateTime> {
        match self {
            Self::Healthy => None,
            Self::Unhealthy { since, .. } => Some(*since),
        }
    }

    pub fn marked_unhealthy_at(&self) -> Option<OffsetDateTime> {
        match self {
            Self::Healthy => None,
            Self::Unhealthy { last_marked, .. } => Some(*last_marked),
        }
    }
}

/// A configured webhook endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Destination {
    pub id: DestinationId,
    pub name: String,
    pub url: String,
    /// HMAC signing secret; unsigned deliveries when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    pub published: bool,
    /// Event types this destination receives
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default)]
    pub health: HealthState,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub last_notification_sent_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub consecutive_failures: u32,
    /// Owner
    pub created_by: Option<UserId>,
    /// Last editor
    pub modified_by: Option<UserId>,
}

impl Destination {
    pub fn new(id: DestinationId, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            url: url.into(),
            secret: None,
            published: true,
            triggers: Vec::new(),
            health: HealthState::Healthy,
            last_notification_sent_at: None,
            consecutive_failures: 0,
            created_by: None,
            modified_by: None,
        }
    }

    pub fn subscribes_to(&self, event_type: &str) -> bool {
        self.triggers.iter().any(|t| t == event_type)
    }
}

/// The source event a queued delivery belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRef {
    pub id: String,
    /// e.g. `contact.updated`
    pub event_type: String,
}

impl EventRef {
    pub fn new(id: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            event_type: event_type.into(),
        }
    }
}

/// One pending delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: QueueEntryId,
    pub destination_id: DestinationId,
    pub event: EventRef,
    /// zlib-compressed JSON; `None` for rows whose payload was never written
    #[serde(skip)]
    pub payload: Option<Vec<u8>>,
    #[serde(with = "time::serde::rfc3339")]
    pub date_added: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub date_modified: Option<OffsetDateTime>,
    pub retries: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub claimed_until: Option<OffsetDateTime>,
}

impl QueueEntry {
    /// Decompressed payload text.
    pub fn payload_text(&self) -> Result<Option<String>, DeliveryError> {
        codec::decompress(self.payload.as_deref())
    }

    /// Decompressed and parsed payload.
    pub fn decoded_payload(&self) -> Result<Option<serde_json::Value>, DeliveryError> {
        match self.payload_text()? {
            Some(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| DeliveryError::Codec(e.to_string())),
            None => Ok(None),
        }
    }
}

/// Inclusive queue-ID window used by range-partitioned draining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRange {
    pub min: QueueEntryId,
    pub max: QueueEntryId,
}

impl IdRange {
    pub fn new(min: QueueEntryId, max: QueueEntryId) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, id: QueueEntryId) -> bool {
        id >= self.min && id <= self.max
    }

    /// Consecutive windows of `size` IDs covering `[min, max]`.
    pub fn windows(self, size: u32) -> impl Iterator<Item = IdRange> {
        let size = i64::from(size.max(1));
        let max = self.max;
        let mut next = Some(self.min).filter(|m| *m <= max);
        std::iter::from_fn(move || {
            let start = next?;
            let end = start.saturating_add(size - 1).min(max);
            next = end.checked_add(1).filter(|n| *n <= max);
            Some(IdRange::new(start, end))
        })
    }
}

/// Result of one delivery attempt, kept for operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryLogEntry {
    pub destination_id: DestinationId,
    /// `None` when no HTTP response was received
    pub status_code: Option<u16>,
    /// Seconds spent on the attempt
    pub runtime: f64,
    pub note: String,
    #[serde(with = "time::serde::rfc3339")]
    pub date_added: OffsetDateTime,
}

/// A user that can receive failure alerts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: String,
}
