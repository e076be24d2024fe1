use std::collections::BTreeMap;
use std::sync::Arc;

use crate::ack_id::AckId;

/// A published message. Immutable once the log has assigned its offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub topic: String,
    pub offset: u64,
    pub payload: Vec<u8>,
    pub publish_time_ns: u64,
    pub ordering_key: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

impl Message {
    /// Bytes charged against flow control: payload, key and attributes.
    pub fn size_bytes(&self) -> u64 {
        let key = self.ordering_key.as_ref().map_or(0, |key| key.len());
        let attributes: usize = self
            .attributes
            .iter()
            .map(|(name, value)| name.len() + value.len())
            .sum();
        (self.payload.len() + key + attributes) as u64
    }
}

/// What a publisher hands to the log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishRequest {
    pub payload: Vec<u8>,
    pub ordering_key: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

impl PublishRequest {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            ..Self::default()
        }
    }

    pub fn with_ordering_key(mut self, key: impl Into<String>) -> Self {
        self.ordering_key = Some(key.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }
}

/// One delivery of a message to a consumer.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub ack_id: AckId,
    pub message: Arc<Message>,
    /// Number of times this message has been delivered, including this one.
    pub delivery_attempt: u32,
    /// Present only on exactly-once subscriptions.
    pub fencing_token: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_counts_key_and_attributes() {
        let message = Message {
            id: "1".into(),
            topic: "t".into(),
            offset: 0,
            payload: vec![0; 10],
            publish_time_ns: 0,
            ordering_key: Some("key".into()),
            attributes: BTreeMap::from([("a".to_string(), "bc".to_string())]),
        };
        assert_eq!(message.size_bytes(), 16);
    }

    #[test]
    fn publish_request_builder() {
        let req = PublishRequest::new(b"hello".to_vec())
            .with_ordering_key("k")
            .with_attribute("origin", "test");
        assert_eq!(req.payload, b"hello");
        assert_eq!(req.ordering_key.as_deref(), Some("k"));
        assert_eq!(req.attributes.get("origin").map(String::as_str), Some("test"));
    }
}
