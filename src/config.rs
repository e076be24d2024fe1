//! Broker configuration.
//!
//! Defines the tunables for lease striping, batch planning, redelivery backoff
//! and streaming-pull sessions. Every field has a default, so a config file
//! only needs to name what it overrides.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Upper bound for any backoff, matching the maximum ack deadline.
pub const MAX_BACKOFF: Duration = Duration::from_secs(600);

/// Configuration for a broker instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Number of lock stripes in each subscription's lease table.
    /// Default: 64
    pub lease_shards: usize,

    /// Maximum number of deliverable log messages inspected when planning
    /// one batch. Settled messages and live leases are not counted.
    /// Default: 4096
    pub scan_window: usize,

    /// Largest `max_messages` accepted by a single pull.
    /// Default: 1000
    pub max_pull_messages: usize,

    /// How long a pull with `return_immediately = false` waits for messages.
    /// Default: 1000 ms
    pub pull_wait_ms: u64,

    /// Interval between background expiry/compaction runs.
    /// Default: 1000 ms
    pub sweep_interval_ms: u64,

    /// Default redelivery policy for subscriptions without their own.
    /// Default: immediate
    pub redelivery: RedeliveryPolicy,

    /// Streaming-pull session settings.
    pub session: SessionConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            lease_shards: 64,
            scan_window: 4096,
            max_pull_messages: 1000,
            pull_wait_ms: 1000,
            sweep_interval_ms: 1000,
            redelivery: RedeliveryPolicy::default(),
            session: SessionConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Loads and validates a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let config: BrokerConfig = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.lease_shards == 0 {
            return Err(Error::InvalidArgument("lease_shards must be > 0".into()));
        }
        if self.scan_window == 0 {
            return Err(Error::InvalidArgument("scan_window must be > 0".into()));
        }
        if self.max_pull_messages == 0 {
            return Err(Error::InvalidArgument(
                "max_pull_messages must be > 0".into(),
            ));
        }
        if self.sweep_interval_ms == 0 {
            return Err(Error::InvalidArgument(
                "sweep_interval_ms must be > 0".into(),
            ));
        }
        self.redelivery.validate()?;
        self.session.validate()
    }

    pub fn pull_wait(&self) -> Duration {
        Duration::from_millis(self.pull_wait_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Settings shared by every streaming-pull session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Close a session after this long without client activity.
    /// Default: 30 s
    pub idle_timeout_ms: u64,

    /// Fallback delivery poll when no publish wakes the session.
    /// Default: 100 ms
    pub poll_interval_ms: u64,

    /// Outbound batches buffered before the scheduler stops feeding a session.
    /// Default: 16
    pub outbound_queue_capacity: usize,

    /// Inbound ack/modack requests buffered per session.
    /// Default: 64
    pub inbound_queue_capacity: usize,

    /// Flow control applied when the client does not send its own.
    /// Default: 1000 messages
    pub default_max_outstanding_messages: u64,

    /// Default: 100 MiB
    pub default_max_outstanding_bytes: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 30_000,
            poll_interval_ms: 100,
            outbound_queue_capacity: 16,
            inbound_queue_capacity: 64,
            default_max_outstanding_messages: 1000,
            default_max_outstanding_bytes: 100 * 1024 * 1024,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(Error::InvalidArgument(
                "session.poll_interval_ms must be > 0".into(),
            ));
        }
        if self.outbound_queue_capacity == 0 || self.inbound_queue_capacity == 0 {
            return Err(Error::InvalidArgument(
                "session queue capacities must be > 0".into(),
            ));
        }
        if self.default_max_outstanding_messages == 0 || self.default_max_outstanding_bytes == 0 {
            return Err(Error::InvalidArgument(
                "session flow control defaults must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// How long a nacked or expired message waits before it is eligible again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RedeliveryPolicy {
    /// Eligible on the next scheduling pass.
    Immediate,

    /// `min_backoff * 2^(attempt - 1)`, capped at `max_backoff`.
    ExponentialBackoff {
        min_backoff_ms: u64,
        max_backoff_ms: u64,
    },
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        RedeliveryPolicy::Immediate
    }
}

impl RedeliveryPolicy {
    pub fn exponential(min_backoff: Duration, max_backoff: Duration) -> Self {
        RedeliveryPolicy::ExponentialBackoff {
            min_backoff_ms: min_backoff.as_millis() as u64,
            max_backoff_ms: max_backoff.as_millis() as u64,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            RedeliveryPolicy::Immediate => Ok(()),
            RedeliveryPolicy::ExponentialBackoff {
                min_backoff_ms,
                max_backoff_ms,
            } => {
                let max_ms = MAX_BACKOFF.as_millis() as u64;
                if *min_backoff_ms > *max_backoff_ms {
                    return Err(Error::InvalidArgument(format!(
                        "min_backoff_ms {min_backoff_ms} exceeds max_backoff_ms {max_backoff_ms}"
                    )));
                }
                if *max_backoff_ms > max_ms {
                    return Err(Error::InvalidArgument(format!(
                        "max_backoff_ms {max_backoff_ms} exceeds {max_ms}"
                    )));
                }
                Ok(())
            }
        }
    }

    /// Backoff after the `delivery_count`-th failed delivery.
    pub fn backoff(&self, delivery_count: u32) -> Duration {
        match self {
            RedeliveryPolicy::Immediate => Duration::ZERO,
            RedeliveryPolicy::ExponentialBackoff {
                min_backoff_ms,
                max_backoff_ms,
            } => {
                let exponent = delivery_count.saturating_sub(1).min(32);
                let backoff = min_backoff_ms.saturating_mul(1u64 << exponent);
                Duration::from_millis(backoff.min(*max_backoff_ms))
            }
        }
    }
}
