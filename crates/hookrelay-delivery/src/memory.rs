//! In-memory storage backend.
//!
//! Backs tests and single-process setups. Every trait operation takes one
//! lock for its whole duration, so bulk operations are atomic per call.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::codec;
use crate::error::DeliveryError;
use crate::notifier::{InAppNotification, InAppNotificationSink, UserDirectory};
use crate::queue::{DeliveryLogStorage, DeliveryQueueStorage, DestinationStorage, FetchEligibility};
use crate::types::{
    DeliveryLogEntry, Destination, DestinationId, EventRef, HealthState, IdRange, QueueEntry,
    QueueEntryId, User, UserId,
};

#[derive(Debug)]
pub struct InMemoryWebhookStorage {
    destinations: RwLock<HashMap<DestinationId, Destination>>,
    /// Ordered by ID so batches come out in queue order
    queue: RwLock<BTreeMap<QueueEntryId, QueueEntry>>,
    logs: RwLock<HashMap<DestinationId, VecDeque<DeliveryLogEntry>>>,
    next_id: AtomicI64,
}

impl InMemoryWebhookStorage {
    pub fn new() -> Self {
        Self {
            destinations: RwLock::new(HashMap::new()),
            queue: RwLock::new(BTreeMap::new()),
            logs: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    /// Stand-in for the administration layer.
    pub async fn upsert_destination(&self, destination: Destination) {
        self.destinations
            .write()
            .await
            .insert(destination.id, destination);
    }

    /// Removes the destination together with its queue rows and logs.
    pub async fn delete_destination(&self, id: DestinationId) -> bool {
        let removed = self.destinations.write().await.remove(&id).is_some();
        self.queue
            .write()
            .await
            .retain(|_, entry| entry.destination_id != id);
        self.logs.write().await.remove(&id);
        removed
    }

    /// Insert a row as-is, bypassing compression (and ID allocation).
    pub async fn insert_raw_entry(&self, entry: QueueEntry) {
        self.next_id.fetch_max(entry.id + 1, Ordering::SeqCst);
        self.queue.write().await.insert(entry.id, entry);
    }

    /// Snapshot of the pending rows of one destination, in ID order.
    pub async fn entries_for(&self, destination_id: DestinationId) -> Vec<QueueEntry> {
        self.queue
            .read()
            .await
            .values()
            .filter(|e| e.destination_id == destination_id)
            .cloned()
            .collect()
    }

    fn next_id(&self) -> QueueEntryId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for InMemoryWebhookStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeliveryQueueStorage for InMemoryWebhookStorage {
    async fn append(
        &self,
        destination_id: DestinationId,
        event: &EventRef,
        payload: &Value,
        now: OffsetDateTime,
    ) -> Result<QueueEntry, DeliveryError> {
        let text =
            serde_json::to_string(payload).map_err(|e| DeliveryError::Codec(e.to_string()))?;
        let entry = QueueEntry {
            id: self.next_id(),
            destination_id,
            event: event.clone(),
            payload: Some(codec::compress(&text)?),
            date_added: now,
            date_modified: None,
            retries: 0,
            claimed_until: None,
        };
        self.queue.write().await.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn fetch_batch(
        &self,
        destination_id: DestinationId,
        limit: u32,
        range: Option<IdRange>,
        eligibility: FetchEligibility,
    ) -> Result<Vec<QueueEntry>, DeliveryError> {
        if range.is_some_and(|r| r.min > r.max) {
            return Ok(Vec::new());
        }
        let mut queue = self.queue.write().await;
        let claim_until = eligibility.claim_until();
        let mut batch = Vec::new();

        let candidates = match range {
            Some(r) => queue.range_mut(r.min..=r.max),
            None => queue.range_mut(..),
        };
        for (_, entry) in candidates {
            if batch.len() >= limit as usize {
                break;
            }
            if entry.destination_id != destination_id || !eligibility.is_eligible(entry) {
                continue;
            }
            entry.claimed_until = Some(claim_until);
            batch.push(entry.clone());
        }

        Ok(batch)
    }

    async fn delete_by_ids(&self, ids: &[QueueEntryId]) -> Result<u64, DeliveryError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut queue = self.queue.write().await;
        Ok(ids.iter().filter(|id| queue.remove(*id).is_some()).count() as u64)
    }

    async fn increment_retry(
        &self,
        ids: &[QueueEntryId],
        now: OffsetDateTime,
    ) -> Result<u64, DeliveryError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut queue = self.queue.write().await;
        let mut updated = 0;
        for id in ids {
            if let Some(entry) = queue.get_mut(id) {
                entry.retries += 1;
                entry.date_modified = Some(now);
                entry.claimed_until = None;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn delete_exhausted(
        &self,
        destination_id: DestinationId,
        max_retries: u32,
    ) -> Result<u64, DeliveryError> {
        if max_retries == 0 {
            return Ok(0);
        }
        let mut queue = self.queue.write().await;
        let before = queue.len();
        queue.retain(|_, e| !(e.destination_id == destination_id && e.retries >= max_retries));
        Ok((before - queue.len()) as u64)
    }

    async fn exists_for_destination(
        &self,
        destination_id: DestinationId,
    ) -> Result<bool, DeliveryError> {
        Ok(self
            .queue
            .read()
            .await
            .values()
            .any(|e| e.destination_id == destination_id))
    }

    async fn purge_destination(&self, destination_id: DestinationId) -> Result<u64, DeliveryError> {
        let mut queue = self.queue.write().await;
        let before = queue.len();
        queue.retain(|_, e| e.destination_id != destination_id);
        Ok((before - queue.len()) as u64)
    }
}

#[async_trait]
impl DestinationStorage for InMemoryWebhookStorage {
    async fn get(&self, id: DestinationId) -> Result<Option<Destination>, DeliveryError> {
        Ok(self.destinations.read().await.get(&id).cloned())
    }

    async fn list_published(&self) -> Result<Vec<Destination>, DeliveryError> {
        let mut list: Vec<_> = self
            .destinations
            .read()
            .await
            .values()
            .filter(|d| d.published)
            .cloned()
            .collect();
        list.sort_by_key(|d| d.id);
        Ok(list)
    }

    async fn list_for_event(&self, event_type: &str) -> Result<Vec<Destination>, DeliveryError> {
        Ok(self
            .list_published()
            .await?
            .into_iter()
            .filter(|d| d.subscribes_to(event_type))
            .collect())
    }

    async fn save_health(
        &self,
        id: DestinationId,
        health: HealthState,
        consecutive_failures: u32,
    ) -> Result<(), DeliveryError> {
        let mut destinations = self.destinations.write().await;
        let destination = destinations
            .get_mut(&id)
            .ok_or(DeliveryError::DestinationNotFound(id))?;
        destination.health = health;
        destination.consecutive_failures = consecutive_failures;
        Ok(())
    }

    async fn set_published(
        &self,
        id: DestinationId,
        published: bool,
    ) -> Result<(), DeliveryError> {
        let mut destinations = self.destinations.write().await;
        let destination = destinations
            .get_mut(&id)
            .ok_or(DeliveryError::DestinationNotFound(id))?;
        destination.published = published;
        Ok(())
    }

    async fn set_last_notification_sent_at(
        &self,
        id: DestinationId,
        at: OffsetDateTime,
    ) -> Result<(), DeliveryError> {
        let mut destinations = self.destinations.write().await;
        let destination = destinations
            .get_mut(&id)
            .ok_or(DeliveryError::DestinationNotFound(id))?;
        destination.last_notification_sent_at = Some(at);
        Ok(())
    }
}

#[async_trait]
impl DeliveryLogStorage for InMemoryWebhookStorage {
    async fn append_log(&self, entry: &DeliveryLogEntry, keep: u32) -> Result<(), DeliveryError> {
        let mut logs = self.logs.write().await;
        let log = logs.entry(entry.destination_id).or_default();
        log.push_front(entry.clone());
        log.truncate(keep as usize);
        Ok(())
    }

    async fn list_logs(
        &self,
        destination_id: DestinationId,
        limit: u32,
    ) -> Result<Vec<DeliveryLogEntry>, DeliveryError> {
        Ok(self
            .logs
            .read()
            .await
            .get(&destination_id)
            .map(|log| log.iter().take(limit as usize).cloned().collect())
            .unwrap_or_default())
    }
}

/// In-memory user table and notification inbox.
#[derive(Debug, Default)]
pub struct InMemoryUsers {
    users: RwLock<HashMap<UserId, (User, bool)>>,
    inbox: RwLock<Vec<InAppNotification>>,
}

impl InMemoryUsers {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_user(&self, user: User, is_admin: bool) {
        self.users.write().await.insert(user.id, (user, is_admin));
    }

    pub async fn inbox(&self) -> Vec<InAppNotification> {
        self.inbox.read().await.clone()
    }
}

#[async_trait]
impl UserDirectory for InMemoryUsers {
    async fn get(&self, id: UserId) -> Result<Option<User>, DeliveryError> {
        Ok(self.users.read().await.get(&id).map(|(u, _)| u.clone()))
    }

    async fn administrators(&self) -> Result<Vec<User>, DeliveryError> {
        let mut admins: Vec<_> = self
            .users
            .read()
            .await
            .values()
            .filter(|(_, admin)| *admin)
            .map(|(u, _)| u.clone())
            .collect();
        admins.sort_by_key(|u| u.id);
        Ok(admins)
    }
}

#[async_trait]
impl InAppNotificationSink for InMemoryUsers {
    async fn add(&self, notification: &InAppNotification) -> Result<(), DeliveryError> {
        self.inbox.write().await.push(notification.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2024-05-01 10:00 UTC);

    fn eligibility() -> FetchEligibility {
        FetchEligibility {
            now: NOW,
            lease: time::Duration::seconds(120),
            retry_delay: time::Duration::seconds(3600),
        }
    }

    async fn queue_with(rows: usize) -> InMemoryWebhookStorage {
        let storage = InMemoryWebhookStorage::new();
        for i in 0..rows {
            storage
                .append(
                    1,
                    &EventRef::new(i.to_string(), "contact.updated"),
                    &json!({"i": i}),
                    NOW,
                )
                .await
                .unwrap();
        }
        storage
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_ids_and_compresses() {
        let storage = queue_with(3).await;
        let rows = storage.entries_for(1).await;
        let ids: Vec<_> = rows.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(rows[1].decoded_payload().unwrap(), Some(json!({"i": 1})));
        assert_eq!(rows[0].retries, 0);
    }

    #[tokio::test]
    async fn test_fetch_batch_respects_limit_and_range() {
        let storage = queue_with(10).await;
        let batch = storage.fetch_batch(1, 3, None, eligibility()).await.unwrap();
        assert_eq!(batch.iter().map(|e| e.id).collect::<Vec<_>>(), vec![1, 2, 3]);

        let windowed = storage
            .fetch_batch(1, 10, Some(IdRange::new(5, 7)), eligibility())
            .await
            .unwrap();
        assert_eq!(windowed.iter().map(|e| e.id).collect::<Vec<_>>(), vec![5, 6, 7]);
    }

    #[tokio::test]
    async fn test_claimed_rows_are_not_handed_out_twice() {
        let storage = queue_with(4).await;
        let first = storage.fetch_batch(1, 2, None, eligibility()).await.unwrap();
        let second = storage.fetch_batch(1, 10, None, eligibility()).await.unwrap();
        assert_eq!(first.iter().map(|e| e.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(second.iter().map(|e| e.id).collect::<Vec<_>>(), vec![3, 4]);
    }

    #[tokio::test]
    async fn test_increment_retry_and_delete() {
        let storage = queue_with(3).await;
        assert_eq!(storage.delete_by_ids(&[]).await.unwrap(), 0);
        assert_eq!(storage.increment_retry(&[1, 2], NOW).await.unwrap(), 2);
        assert_eq!(storage.delete_by_ids(&[3]).await.unwrap(), 1);

        let rows = storage.entries_for(1).await;
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|e| e.retries == 1 && e.date_modified == Some(NOW)));
        assert!(rows.iter().all(|e| e.claimed_until.is_none()));
    }

    #[tokio::test]
    async fn test_delete_exhausted_and_purge() {
        let storage = queue_with(3).await;
        storage.increment_retry(&[1], NOW).await.unwrap();
        storage.increment_retry(&[1], NOW).await.unwrap();
        assert_eq!(storage.delete_exhausted(1, 0).await.unwrap(), 0);
        assert_eq!(storage.delete_exhausted(1, 2).await.unwrap(), 1);
        assert!(storage.exists_for_destination(1).await.unwrap());
        assert_eq!(storage.purge_destination(1).await.unwrap(), 2);
        assert!(!storage.exists_for_destination(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_destination_cascades() {
        let storage = queue_with(2).await;
        storage.upsert_destination(Destination::new(1, "crm", "https://example.com")).await;
        assert!(storage.delete_destination(1).await);
        assert!(storage.entries_for(1).await.is_empty());
    }

    #[tokio::test]
    async fn test_log_is_pruned_to_keep() {
        let storage = InMemoryWebhookStorage::new();
        for code in [200u16, 500, 502] {
            let entry = DeliveryLogEntry {
                destination_id: 1,
                status_code: Some(code),
                runtime: 0.1,
                note: String::new(),
                date_added: NOW,
            };
            storage.append_log(&entry, 2).await.unwrap();
        }
        let logs = storage.list_logs(1, 10).await.unwrap();
        let codes: Vec<_> = logs.iter().map(|l| l.status_code).collect();
        assert_eq!(codes, vec![Some(502), Some(500)]);
    }
}
