use anyhow::{bail, Result};
use serde::Deserialize;
use std::time::Duration;

fn default_min_large_message_size() -> u64 {
    100 * 1024
}

fn default_flush_timeout_millis() -> u64 {
    30_000
}

fn default_transfer_timeout_millis() -> u64 {
    10_000
}

fn default_consumer_priority() -> u8 {
    0
}

/// Tuning knobs for a consumer's delivery engine.
///
/// `min_large_message_size` doubles as the continuation chunk size: payloads
/// above the threshold stream as a header packet plus chunks of at most this
/// many bytes.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_min_large_message_size")]
    pub min_large_message_size: u64,
    /// Deadline for draining pending deliveries when a consumer stops.
    #[serde(default = "default_flush_timeout_millis")]
    pub flush_timeout_millis: u64,
    /// Deadline for the queue-executor barrier when a consumer starts transferring.
    #[serde(default = "default_transfer_timeout_millis")]
    pub transfer_timeout_millis: u64,
    #[serde(default = "default_consumer_priority")]
    pub default_consumer_priority: u8,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            min_large_message_size: default_min_large_message_size(),
            flush_timeout_millis: default_flush_timeout_millis(),
            transfer_timeout_millis: default_transfer_timeout_millis(),
            default_consumer_priority: default_consumer_priority(),
        }
    }
}

impl DeliveryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_large_message_size == 0 {
            bail!("delivery.min_large_message_size must be positive");
        }
        if self.flush_timeout_millis == 0 {
            bail!("delivery.flush_timeout_millis must be positive");
        }
        if self.transfer_timeout_millis == 0 {
            bail!("delivery.transfer_timeout_millis must be positive");
        }
        Ok(())
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_millis)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_millis)
    }
}
