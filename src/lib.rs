//! Subscription delivery engine for a publish/subscribe broker.
//!
//! Messages live in an append-only [`MessageLog`]. Each subscription tracks
//! delivery leases over that log, schedules messages to pull and
//! streaming-pull consumers, and processes acknowledgements, deadline changes,
//! redelivery, dead-lettering and exactly-once fencing.

pub mod ack;
pub mod ack_id;
pub mod broker;
pub mod clock;
pub mod config;
pub mod context;
pub mod dead_letter;
pub mod error;
pub mod fencing;
pub mod lease;
pub mod message;
pub mod message_log;
mod retention;
pub mod scheduler;
pub mod session;
pub mod snapshot;
pub mod stats;
pub mod streaming;
pub mod subscription;

pub use ack::AckConfirmation;
pub use ack_id::AckId;
pub use broker::{Broker, MaintenanceReport};
pub use clock::{Clock, ManualClock, QuantaClock, SystemClock};
pub use config::{BrokerConfig, RedeliveryPolicy, SessionConfig};
pub use error::{Error, Result};
pub use lease::{AckOutcome, LeaseState};
pub use message::{Message, PublishRequest, ReceivedMessage};
pub use message_log::{InMemoryLog, MessageLog};
pub use session::{CloseReason, FlowControl, SessionState};
pub use snapshot::{SeekTarget, Snapshot};
pub use stats::StatsSnapshot;
pub use streaming::{
    StreamEvent, StreamRequest, StreamingPull, StreamingPullRequest, SubscriptionProperties,
};
pub use subscription::{DeadLetterPolicy, Subscription, SubscriptionField, SubscriptionUpdate};
