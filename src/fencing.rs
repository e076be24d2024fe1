//! Exactly-once fencing.
//!
//! Every lease grant bumps the message's fencing token. When exactly-once
//! delivery is enabled, an ack or deadline change carrying an older token is
//! rejected with [`Error::FencingTokenStale`] instead of the generic
//! [`Error::InvalidAckId`], telling the consumer its copy was superseded.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::ack_id::{AckId, AckToken};
use crate::{Error, Result};

#[derive(Debug)]
pub struct FencingTracker {
    enabled: AtomicBool,
}

impl FencingTracker {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Token for a new delivery, strictly greater than the previous one.
    pub fn issue(&self, previous: u64) -> u64 {
        previous + 1
    }

    /// The token a client may see for a grant.
    pub fn expose(&self, token: u64) -> Option<u64> {
        self.is_enabled().then_some(token)
    }

    /// Accepts `presented` only if it names the current delivery.
    pub(crate) fn admit(
        &self,
        ack_id: &AckId,
        presented: &AckToken,
        current_serial: u64,
        current_token: u64,
    ) -> Result<()> {
        if presented.serial == current_serial {
            return Ok(());
        }
        if presented.fencing_token < current_token && self.is_enabled() {
            return Err(Error::FencingTokenStale {
                ack_id: ack_id.to_string(),
                presented: presented.fencing_token,
                current: current_token,
            });
        }
        Err(Error::InvalidAckId(ack_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(serial: u64, fencing_token: u64) -> AckToken {
        AckToken {
            incarnation: 1,
            offset: 0,
            serial,
            fencing_token,
        }
    }

    #[test]
    fn issue_is_strictly_increasing() {
        let tracker = FencingTracker::new(true);
        let first = tracker.issue(0);
        let second = tracker.issue(first);
        assert!(second > first);
    }

    #[test]
    fn current_delivery_admitted() {
        let tracker = FencingTracker::new(true);
        let presented = token(10, 2);
        tracker
            .admit(&presented.encode(), &presented, 10, 2)
            .unwrap();
    }

    #[test]
    fn superseded_delivery_is_stale_when_enabled() {
        let tracker = FencingTracker::new(true);
        let presented = token(10, 1);
        let err = tracker
            .admit(&presented.encode(), &presented, 11, 2)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::FencingTokenStale {
                presented: 1,
                current: 2,
                ..
            }
        ));
    }

    #[test]
    fn superseded_delivery_is_invalid_when_disabled() {
        let tracker = FencingTracker::new(false);
        let presented = token(10, 1);
        let err = tracker
            .admit(&presented.encode(), &presented, 11, 2)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAckId(_)));
        assert_eq!(tracker.expose(2), None);
    }
}
