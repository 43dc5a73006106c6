use std::time::Duration;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

/// Upper bound for every duration setting (ten years).
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// How fired events reach their destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    /// Delivered synchronously when the event fires; the queue is never used.
    #[default]
    Immediate,
    /// Appended to the delivery queue and drained by the batch job.
    Queued,
}

/// Delivery tuning. Injected into every component at construction.
///
/// All durations are in whole seconds, matching the on-disk configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Rows per batch (and range-mode window size)
    #[serde(default = "default_webhook_limit")]
    pub webhook_limit: u32,
    /// Wall-clock budget of one drain job
    #[serde(default = "default_webhook_time_limit")]
    pub webhook_time_limit: u64,
    /// Delivery log rows kept per destination
    #[serde(default = "default_webhook_log_max")]
    pub webhook_log_max: u32,
    /// Cooldown after which an unhealthy destination is tried again
    #[serde(default = "default_webhook_health_check_time")]
    pub webhook_health_check_time: u64,
    /// Minimum spacing between two attempts of the same failed row
    #[serde(default = "default_webhook_retry_delay")]
    pub webhook_retry_delay: u64,
    /// Consecutive failures tolerated before the destination is unpublished
    #[serde(default = "default_webhook_disable_limit")]
    pub webhook_disable_limit: u32,
    /// Timeout of one HTTP call
    #[serde(default = "default_webhook_timeout")]
    pub webhook_timeout: u64,
    /// Rows that reach this many retries are dropped (0 keeps them forever)
    #[serde(default = "default_webhook_max_retries")]
    pub webhook_max_retries: u32,
    /// How long a fetched row stays invisible to other drain instances
    #[serde(default = "default_webhook_lease_time")]
    pub webhook_lease_time: u64,
    #[serde(default)]
    pub queue_mode: QueueMode,
    /// Include the destination URL in failure alerts
    #[serde(default = "default_true")]
    pub webhook_email_details: bool,
    #[serde(default)]
    pub disable_auto_unpublish: bool,
    #[serde(default = "default_first_failure_notification_time")]
    pub first_webhook_failure_notification_time: u64,
    #[serde(default = "default_failure_notification_interval")]
    pub webhook_failure_notification_interval: u64,
    /// IPs or CIDR blocks exempt from the private-address check
    #[serde(default)]
    pub webhook_allowed_private_addresses: Vec<String>,
    /// IPs or CIDR blocks always refused, even when public
    #[serde(default)]
    pub webhook_denied_addresses: Vec<String>,
    /// Sent as `X-Origin-Base-URL`
    #[serde(default = "default_site_url")]
    pub site_url: String,
    /// Signing identity shown in failure alerts
    #[serde(default = "default_sender_name")]
    pub sender_name: String,
    /// Global kill-switch for failure alerts
    #[serde(default = "default_true")]
    pub notifications_enabled: bool,
}

fn default_webhook_limit() -> u32 {
    10
}
fn default_webhook_time_limit() -> u64 {
    600
}
fn default_webhook_log_max() -> u32 {
    1000
}
fn default_webhook_health_check_time() -> u64 {
    300
}
fn default_webhook_retry_delay() -> u64 {
    3600
}
fn default_webhook_disable_limit() -> u32 {
    100
}
fn default_webhook_timeout() -> u64 {
    15
}
fn default_webhook_max_retries() -> u32 {
    100
}
fn default_webhook_lease_time() -> u64 {
    120
}
fn default_first_failure_notification_time() -> u64 {
    3600
}
fn default_failure_notification_interval() -> u64 {
    86400
}
fn default_site_url() -> String {
    "http://localhost".into()
}
fn default_sender_name() -> String {
    "Hookrelay".into()
}
fn default_true() -> bool {
    true
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            webhook_limit: default_webhook_limit(),
            webhook_time_limit: default_webhook_time_limit(),
            webhook_log_max: default_webhook_log_max(),
            webhook_health_check_time: default_webhook_health_check_time(),
            webhook_retry_delay: default_webhook_retry_delay(),
            webhook_disable_limit: default_webhook_disable_limit(),
            webhook_timeout: default_webhook_timeout(),
            webhook_max_retries: default_webhook_max_retries(),
            webhook_lease_time: default_webhook_lease_time(),
            queue_mode: QueueMode::default(),
            webhook_email_details: true,
            disable_auto_unpublish: false,
            first_webhook_failure_notification_time: default_first_failure_notification_time(),
            webhook_failure_notification_interval: default_failure_notification_interval(),
            webhook_allowed_private_addresses: Vec::new(),
            webhook_denied_addresses: Vec::new(),
            site_url: default_site_url(),
            sender_name: default_sender_name(),
            notifications_enabled: true,
        }
    }
}

impl DeliveryConfig {
    pub fn validate(&self) -> Result<(), String> {
        for (name, secs) in [
            ("webhook_time_limit", self.webhook_time_limit),
            ("webhook_health_check_time", self.webhook_health_check_time),
            ("webhook_retry_delay", self.webhook_retry_delay),
            ("webhook_timeout", self.webhook_timeout),
            ("webhook_lease_time", self.webhook_lease_time),
            (
                "first_webhook_failure_notification_time",
                self.first_webhook_failure_notification_time,
            ),
            (
                "webhook_failure_notification_interval",
                self.webhook_failure_notification_interval,
            ),
        ] {
            if secs > MAX_DURATION_SECS {
                return Err(format!(
                    "delivery.{name} must be <= {MAX_DURATION_SECS} seconds"
                ));
            }
        }
        if self.webhook_limit == 0 {
            return Err("delivery.webhook_limit must be > 0".into());
        }
        if self.webhook_timeout == 0 {
            return Err("delivery.webhook_timeout must be > 0".into());
        }
        if self.webhook_lease_time <= self.webhook_timeout {
            return Err("delivery.webhook_lease_time must be > delivery.webhook_timeout".into());
        }
        if self.webhook_log_max == 0 {
            return Err("delivery.webhook_log_max must be > 0".into());
        }
        if url::Url::parse(&self.site_url).is_err() {
            return Err(format!("delivery.site_url is not a valid URL: {}", self.site_url));
        }
        for entry in &self.webhook_allowed_private_addresses {
            parse_network(entry).map_err(|e| {
                format!("delivery.webhook_allowed_private_addresses: {entry}: {e}")
            })?;
        }
        for entry in &self.webhook_denied_addresses {
            parse_network(entry)
                .map_err(|e| format!("delivery.webhook_denied_addresses: {entry}: {e}"))?;
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout)
    }

    pub fn time_limit(&self) -> time::Duration {
        seconds(self.webhook_time_limit)
    }

    pub fn health_check_time(&self) -> time::Duration {
        seconds(self.webhook_health_check_time)
    }

    pub fn retry_delay(&self) -> time::Duration {
        seconds(self.webhook_retry_delay)
    }

    pub fn lease_time(&self) -> time::Duration {
        seconds(self.webhook_lease_time)
    }

    pub fn first_failure_notification_time(&self) -> time::Duration {
        seconds(self.first_webhook_failure_notification_time)
    }

    pub fn failure_notification_interval(&self) -> time::Duration {
        seconds(self.webhook_failure_notification_interval)
    }

    /// Parsed allow-list; malformed entries are skipped (rejected earlier by `validate`).
    pub fn allowed_private_networks(&self) -> Vec<IpNetwork> {
        self.webhook_allowed_private_addresses
            .iter()
            .filter_map(|s| parse_network(s).ok())
            .collect()
    }

    pub fn denied_networks(&self) -> Vec<IpNetwork> {
        self.webhook_denied_addresses
            .iter()
            .filter_map(|s| parse_network(s).ok())
            .collect()
    }
}

/// Accepts a bare IP (`10.0.0.5`) or a CIDR block (`10.0.0.0/8`).
pub fn parse_network(entry: &str) -> Result<IpNetwork, String> {
    entry
        .trim()
        .parse::<IpNetwork>()
        .map_err(|e| e.to_string())
}

fn seconds(secs: u64) -> time::Duration {
    time::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
}
