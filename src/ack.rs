//! Acknowledge, nack and deadline changes.
//!
//! Maps client requests onto lease-table transitions and decides, from a
//! message's delivery count, whether it is delivered again or dead-lettered.

use crate::ack_id::AckId;
use crate::clock::duration_ns;
use crate::context::SubscriptionContext;
use crate::lease::AckOutcome;
use crate::subscription::{DeadLetterPolicy, MAX_ACK_DEADLINE};
use crate::{Error, Result};

/// What the scheduler does with an eligible message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryDecision {
    Deliver,
    DeadLetter { topic: String, attempts: u32 },
}

/// Dead-letters once a message has been delivered `max_delivery_attempts`
/// times without being acknowledged.
pub fn delivery_decision(delivery_count: u32, policy: Option<&DeadLetterPolicy>) -> DeliveryDecision {
    match policy {
        Some(policy) if delivery_count >= policy.max_delivery_attempts => {
            DeliveryDecision::DeadLetter {
                topic: policy.dead_letter_topic.clone(),
                attempts: delivery_count,
            }
        }
        _ => DeliveryDecision::Deliver,
    }
}

/// Per-id result of a batch acknowledge or deadline change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckConfirmation {
    pub succeeded: Vec<AckId>,
    /// Unknown, expired or malformed ids.
    pub invalid: Vec<AckId>,
    /// Ids fenced out by a newer delivery (exactly-once only).
    pub stale: Vec<AckId>,
}

impl AckConfirmation {
    pub fn is_success(&self) -> bool {
        self.invalid.is_empty() && self.stale.is_empty()
    }

    /// Appends `other`'s outcomes to this confirmation.
    pub fn merge(&mut self, other: AckConfirmation) {
        self.succeeded.extend(other.succeeded);
        self.invalid.extend(other.invalid);
        self.stale.extend(other.stale);
    }

    fn record(&mut self, ack_id: &AckId, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => self.succeeded.push(ack_id.clone()),
            Err(Error::InvalidAckId(_)) => self.invalid.push(ack_id.clone()),
            Err(Error::FencingTokenStale { .. }) => self.stale.push(ack_id.clone()),
            Err(e) if e.closes_session() => return Err(e),
            Err(_) => self.invalid.push(ack_id.clone()),
        }
        Ok(())
    }
}

pub fn acknowledge(ctx: &SubscriptionContext, ack_id: &AckId) -> Result<AckOutcome> {
    ctx.ensure_live()?;
    let result = ctx
        .leases()
        .acknowledge(ack_id, ctx.now(), &ctx.redelivery_policy());
    match &result {
        Ok(AckOutcome::Acked) => {
            ctx.stats().record_ack();
            ctx.wake();
        }
        Ok(AckOutcome::AlreadyAcked) => {}
        Err(e) => note_rejection(ctx, e),
    }
    result
}

/// `seconds == 0` nacks the delivery; any other value in range moves its
/// deadline to `now + seconds`.
pub fn modify_ack_deadline(ctx: &SubscriptionContext, ack_id: &AckId, seconds: i64) -> Result<()> {
    let deadline = validate_seconds(seconds)?;
    ctx.ensure_live()?;
    let now = ctx.now();
    let policy = ctx.redelivery_policy();
    let result = if seconds == 0 {
        ctx.leases().release(ack_id, now, &policy).map(|()| {
            ctx.stats().record_nack();
            ctx.wake();
        })
    } else {
        ctx.leases()
            .extend(ack_id, now.saturating_add(deadline), now, &policy)
    };
    if let Err(e) = &result {
        note_rejection(ctx, e);
    }
    result
}

pub fn acknowledge_batch(ctx: &SubscriptionContext, ack_ids: &[AckId]) -> Result<AckConfirmation> {
    ctx.ensure_live()?;
    let mut confirmation = AckConfirmation::default();
    for ack_id in ack_ids {
        let result = acknowledge(ctx, ack_id).map(|_| ());
        confirmation.record(ack_id, result)?;
    }
    Ok(confirmation)
}

pub fn modify_ack_deadline_batch(
    ctx: &SubscriptionContext,
    ack_ids: &[AckId],
    seconds: i64,
) -> Result<AckConfirmation> {
    validate_seconds(seconds)?;
    ctx.ensure_live()?;
    let mut confirmation = AckConfirmation::default();
    for ack_id in ack_ids {
        let result = modify_ack_deadline(ctx, ack_id, seconds);
        confirmation.record(ack_id, result)?;
    }
    Ok(confirmation)
}

fn validate_seconds(seconds: i64) -> Result<u64> {
    let max = MAX_ACK_DEADLINE.as_secs() as i64;
    if !(0..=max).contains(&seconds) {
        return Err(Error::InvalidArgument(format!(
            "ack deadline seconds {seconds} outside [0, {max}]"
        )));
    }
    Ok(duration_ns(std::time::Duration::from_secs(seconds as u64)))
}

fn note_rejection(ctx: &SubscriptionContext, err: &Error) {
    match err {
        Error::InvalidAckId(_) => ctx.stats().record_invalid_ack(),
        Error::FencingTokenStale { .. } => ctx.stats().record_stale_ack(),
        _ => {}
    }
}
