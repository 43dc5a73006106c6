//! Per-destination health: the circuit breaker in front of every delivery.

use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{info, warn};

use crate::clock::{Clock, saturating_before};
use crate::config::DeliveryConfig;
use crate::error::DeliveryError;
use crate::queue::DestinationStorage;
use crate::types::Destination;

pub struct HealthTracker {
    config: Arc<DeliveryConfig>,
    clock: Arc<dyn Clock>,
    destinations: Arc<dyn DestinationStorage>,
}

impl HealthTracker {
    pub fn new(
        config: Arc<DeliveryConfig>,
        clock: Arc<dyn Clock>,
        destinations: Arc<dyn DestinationStorage>,
    ) -> Self {
        Self {
            config,
            clock,
            destinations,
        }
    }

    /// Destinations last marked unhealthy before this instant are tried again.
    pub fn healthy_threshold(&self) -> OffsetDateTime {
        saturating_before(self.clock.now(), self.config.health_check_time())
    }

    pub fn is_healthy(&self, destination: &Destination) -> bool {
        destination.health.is_healthy(self.healthy_threshold())
    }

    pub fn mark_unhealthy(&self, destination: &mut Destination) {
        destination.health = destination.health.failed(self.clock.now());
    }

    pub fn mark_healthy(&self, destination: &mut Destination) {
        destination.health = destination.health.recovered();
    }

    /// The failure counter is past the limit and auto-unpublish is allowed.
    pub fn should_auto_disable(&self, destination: &Destination) -> bool {
        !self.config.disable_auto_unpublish
            && destination.published
            && destination.consecutive_failures > self.config.webhook_disable_limit
    }

    /// Failure bookkeeping: health transition, counter, and auto-unpublish.
    /// Returns `true` when the destination was unpublished.
    pub async fn record_failure(&self, destination: &mut Destination) -> Result<bool, DeliveryError> {
        self.mark_unhealthy(destination);
        destination.consecutive_failures = destination.consecutive_failures.saturating_add(1);
        self.destinations
            .save_health(
                destination.id,
                destination.health,
                destination.consecutive_failures,
            )
            .await?;

        if self.should_auto_disable(destination) {
            warn!(
                destination_id = destination.id,
                failures = destination.consecutive_failures,
                limit = self.config.webhook_disable_limit,
                "Unpublishing destination after too many consecutive failures"
            );
            self.unpublish(destination).await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Success bookkeeping. Writes only when there is an outage to close.
    pub async fn record_success(&self, destination: &mut Destination) -> Result<(), DeliveryError> {
        let was_unhealthy = destination.health.unhealthy_since();
        if was_unhealthy.is_none() && destination.consecutive_failures == 0 {
            return Ok(());
        }

        self.mark_healthy(destination);
        destination.consecutive_failures = 0;
        self.destinations
            .save_health(destination.id, destination.health, 0)
            .await?;

        if let Some(since) = was_unhealthy {
            info!(
                destination_id = destination.id,
                unhealthy_since = %since,
                "Destination recovered"
            );
        }
        Ok(())
    }

    /// Unpublish a destination whose URL can never be delivered to.
    /// Returns `true` when the destination was unpublished.
    pub async fn disable_permanently(
        &self,
        destination: &mut Destination,
        reason: &str,
    ) -> Result<bool, DeliveryError> {
        if self.config.disable_auto_unpublish || !destination.published {
            return Ok(false);
        }
        warn!(
            destination_id = destination.id,
            reason, "Unpublishing destination after a permanent failure"
        );
        self.unpublish(destination).await?;
        Ok(true)
    }

    async fn unpublish(&self, destination: &mut Destination) -> Result<(), DeliveryError> {
        self.destinations
            .set_published(destination.id, false)
            .await?;
        destination.published = false;
        Ok(())
    }
}
