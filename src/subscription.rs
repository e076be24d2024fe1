//! Subscription settings and their administrative updates.

use std::time::Duration;

use crate::config::RedeliveryPolicy;
use crate::{Error, Result};

pub const MIN_ACK_DEADLINE: Duration = Duration::from_secs(10);
pub const MAX_ACK_DEADLINE: Duration = Duration::from_secs(600);
pub const DEFAULT_ACK_DEADLINE: Duration = MIN_ACK_DEADLINE;

pub const MIN_MESSAGE_RETENTION: Duration = Duration::from_secs(10 * 60);
pub const MAX_MESSAGE_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

pub const MIN_DELIVERY_ATTEMPTS: u32 = 5;
pub const MAX_DELIVERY_ATTEMPTS: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterPolicy {
    pub dead_letter_topic: String,
    pub max_delivery_attempts: u32,
}

impl DeadLetterPolicy {
    pub fn new(dead_letter_topic: impl Into<String>, max_delivery_attempts: u32) -> Self {
        Self {
            dead_letter_topic: dead_letter_topic.into(),
            max_delivery_attempts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub name: String,
    pub topic: String,
    pub ack_deadline: Duration,
    pub retain_acked_messages: bool,
    pub message_retention: Duration,
    pub ordering_enabled: bool,
    pub exactly_once_enabled: bool,
    pub dead_letter_policy: Option<DeadLetterPolicy>,
    /// Overrides the broker's default redelivery policy.
    pub redelivery_policy: Option<RedeliveryPolicy>,
}

impl Subscription {
    pub fn new(name: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            topic: topic.into(),
            ack_deadline: DEFAULT_ACK_DEADLINE,
            retain_acked_messages: false,
            message_retention: MAX_MESSAGE_RETENTION,
            ordering_enabled: false,
            exactly_once_enabled: false,
            dead_letter_policy: None,
            redelivery_policy: None,
        }
    }

    pub fn with_ack_deadline(mut self, deadline: Duration) -> Self {
        self.ack_deadline = deadline;
        self
    }

    pub fn with_ordering(mut self) -> Self {
        self.ordering_enabled = true;
        self
    }

    pub fn with_exactly_once(mut self) -> Self {
        self.exactly_once_enabled = true;
        self
    }

    pub fn with_dead_letter_policy(mut self, policy: DeadLetterPolicy) -> Self {
        self.dead_letter_policy = Some(policy);
        self
    }

    pub fn with_redelivery_policy(mut self, policy: RedeliveryPolicy) -> Self {
        self.redelivery_policy = Some(policy);
        self
    }

    pub fn with_retained_acks(mut self) -> Self {
        self.retain_acked_messages = true;
        self
    }

    pub fn with_message_retention(mut self, retention: Duration) -> Self {
        self.message_retention = retention;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidArgument(
                "subscription name cannot be empty".into(),
            ));
        }
        if self.topic.is_empty() {
            return Err(Error::InvalidArgument("topic cannot be empty".into()));
        }
        validate_ack_deadline(self.ack_deadline)?;
        if self.message_retention < MIN_MESSAGE_RETENTION
            || self.message_retention > MAX_MESSAGE_RETENTION
        {
            return Err(Error::InvalidArgument(format!(
                "message_retention {:?} outside [{:?}, {:?}]",
                self.message_retention, MIN_MESSAGE_RETENTION, MAX_MESSAGE_RETENTION
            )));
        }
        if let Some(policy) = &self.dead_letter_policy {
            if policy.dead_letter_topic.is_empty() {
                return Err(Error::InvalidArgument(
                    "dead_letter_topic cannot be empty".into(),
                ));
            }
            if policy.dead_letter_topic == self.topic {
                return Err(Error::InvalidArgument(
                    "dead_letter_topic must differ from the subscription topic".into(),
                ));
            }
            if !(MIN_DELIVERY_ATTEMPTS..=MAX_DELIVERY_ATTEMPTS)
                .contains(&policy.max_delivery_attempts)
            {
                return Err(Error::InvalidArgument(format!(
                    "max_delivery_attempts {} outside [{MIN_DELIVERY_ATTEMPTS}, {MAX_DELIVERY_ATTEMPTS}]",
                    policy.max_delivery_attempts
                )));
            }
        }
        if let Some(policy) = &self.redelivery_policy {
            policy.validate()?;
        }
        Ok(())
    }
}

pub(crate) fn validate_ack_deadline(deadline: Duration) -> Result<()> {
    if deadline < MIN_ACK_DEADLINE || deadline > MAX_ACK_DEADLINE {
        return Err(Error::InvalidArgument(format!(
            "ack deadline {deadline:?} outside [{MIN_ACK_DEADLINE:?}, {MAX_ACK_DEADLINE:?}]"
        )));
    }
    Ok(())
}

/// Mutable subscription fields addressable by an update mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionField {
    AckDeadline,
    RetainAckedMessages,
    MessageRetention,
    ExactlyOnce,
    DeadLetterPolicy,
    RedeliveryPolicy,
}

/// Partial update: only the fields named in `mask` are copied from `subscription`.
#[derive(Debug, Clone)]
pub struct SubscriptionUpdate {
    pub subscription: Subscription,
    pub mask: Vec<SubscriptionField>,
}

impl SubscriptionUpdate {
    pub fn new(subscription: Subscription, mask: Vec<SubscriptionField>) -> Self {
        Self { subscription, mask }
    }

    /// Applies the masked fields onto `current`, returning the validated result.
    pub fn apply(&self, current: &Subscription) -> Result<Subscription> {
        if self.mask.is_empty() {
            return Err(Error::InvalidArgument("update mask cannot be empty".into()));
        }
        if self.subscription.name != current.name {
            return Err(Error::InvalidArgument(format!(
                "update names {} but targets {}",
                self.subscription.name, current.name
            )));
        }
        let source = &self.subscription;
        let mut next = current.clone();
        for field in &self.mask {
            match field {
                SubscriptionField::AckDeadline => next.ack_deadline = source.ack_deadline,
                SubscriptionField::RetainAckedMessages => {
                    next.retain_acked_messages = source.retain_acked_messages
                }
                SubscriptionField::MessageRetention => {
                    next.message_retention = source.message_retention
                }
                SubscriptionField::ExactlyOnce => {
                    next.exactly_once_enabled = source.exactly_once_enabled
                }
                SubscriptionField::DeadLetterPolicy => {
                    next.dead_letter_policy = source.dead_letter_policy.clone()
                }
                SubscriptionField::RedeliveryPolicy => {
                    next.redelivery_policy = source.redelivery_policy.clone()
                }
            }
        }
        next.validate()?;
        Ok(next)
    }
}
