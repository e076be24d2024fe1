//! Forwarding of undeliverable messages to a dead-letter topic.

use log::{info, warn};

use crate::context::SubscriptionContext;
use crate::message::{Message, PublishRequest};
use crate::Result;

/// Attribute naming the subscription a dead-lettered message came from.
pub const SOURCE_SUBSCRIPTION_ATTRIBUTE: &str = "courier.source_subscription";
/// Attribute carrying the delivery count at the time of forwarding.
pub const DELIVERY_ATTEMPTS_ATTRIBUTE: &str = "courier.delivery_attempts";

/// Settles `message` as dead-lettered and publishes a copy to `topic`.
///
/// Returns `Ok(false)` when another scheduler moved the message first. If the
/// publish fails the message is left pending for this subscription.
pub(crate) fn forward(
    ctx: &SubscriptionContext,
    message: &Message,
    topic: &str,
    attempts: u32,
) -> Result<bool> {
    let now = ctx.now();
    let Some(delivery_count) = ctx.leases().mark_dead_lettered(message.offset, now) else {
        return Ok(false);
    };
    let attempts = attempts.max(delivery_count);

    let mut request = PublishRequest::new(message.payload.clone());
    request.ordering_key = message.ordering_key.clone();
    request.attributes = message.attributes.clone();
    let request = request
        .with_attribute(SOURCE_SUBSCRIPTION_ATTRIBUTE, ctx.name())
        .with_attribute(DELIVERY_ATTEMPTS_ATTRIBUTE, attempts.to_string());

    match ctx.log().append(topic, request, now) {
        Ok(copy) => {
            ctx.stats().record_dead_letter();
            info!(
                "subscription {}: message {} dead-lettered to {} as {} after {} attempts",
                ctx.name(),
                message.id,
                topic,
                copy.id,
                attempts
            );
            Ok(true)
        }
        Err(e) => {
            ctx.leases().revert_dead_letter(message.offset);
            warn!(
                "subscription {}: dead-lettering message {} to {} failed: {e}",
                ctx.name(),
                message.id,
                topic
            );
            Err(e)
        }
    }
}
