use thiserror::Error;

use crate::session::SessionId;

#[derive(Debug, Error)]
pub enum Error {
    /// Unknown, expired, superseded (at-least-once mode) or malformed ack id.
    #[error("invalid ack id: {0}")]
    InvalidAckId(String),
    /// Exactly-once conflict: a newer delivery of the message fenced this one out.
    #[error("fencing token stale for ack id {ack_id}: presented {presented}, current {current}")]
    FencingTokenStale {
        ack_id: String,
        presented: u64,
        current: u64,
    },
    /// Internal race between schedulers. Absorbed by the scheduler, never surfaced.
    #[error("message already leased")]
    AlreadyLeased,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("subscription not found: {0}")]
    SubscriptionNotFound(String),
    #[error("subscription deleted: {0}")]
    SubscriptionDeleted(String),
    #[error("subscription already exists: {0}")]
    SubscriptionExists(String),
    #[error("topic not found: {0}")]
    TopicNotFound(String),
    #[error("topic already exists: {0}")]
    TopicExists(String),
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),
    #[error("snapshot already exists: {0}")]
    SnapshotExists(String),
    #[error("session {0} closed")]
    SessionClosed(SessionId),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),
}

impl Error {
    /// Errors the client recovers from by re-pulling or dropping its copy.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::InvalidAckId(_) | Error::FencingTokenStale { .. } | Error::AlreadyLeased
        )
    }

    /// Errors that terminate a streaming-pull session.
    pub fn closes_session(&self) -> bool {
        matches!(
            self,
            Error::SubscriptionNotFound(_) | Error::SubscriptionDeleted(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
