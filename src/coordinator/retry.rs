//! Retry Backoff and Delivery Policy

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff settings shared by storage and delivery retries
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 10,
            max_backoff_ms: 5_000,
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self)
    }
}

/// What to do when a participant never acknowledges a durable decision
///
/// Abandoning never deletes the coordinator document: it stays for operator
/// intervention and is picked up again by the next recovery.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum DeliveryPolicy {
    #[default]
    RetryForever,
    GiveUpAfter { attempts: u32 },
}

impl DeliveryPolicy {
    /// Whether another attempt is allowed after `attempts` failed ones
    #[inline]
    pub fn allows_retry(&self, attempts: u32) -> bool {
        match self {
            DeliveryPolicy::RetryForever => true,
            DeliveryPolicy::GiveUpAfter { attempts: limit } => attempts < *limit,
        }
    }
}

/// Backoff state for one retry loop
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
    multiplier: f64,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: &RetryConfig) -> Self {
        let max = Duration::from_millis(config.max_backoff_ms.max(config.initial_backoff_ms));
        Self {
            next: Duration::from_millis(config.initial_backoff_ms),
            max,
            multiplier: config.multiplier.max(1.0),
            attempts: 0,
        }
    }

    /// Failed attempts recorded so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record a failure and return how long to wait before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        let delay = self.next;
        let scaled = (self.next.as_nanos() as f64 * self.multiplier) as u64;
        self.next = Duration::from_nanos(scaled).min(self.max);
        delay
    }

    /// Record a failure and sleep for the backoff
    pub async fn wait(&mut self) {
        let delay = self.next_delay();
        tokio::time::sleep(delay).await;
    }
}
