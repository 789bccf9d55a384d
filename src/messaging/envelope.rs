//! Message envelope handed to handlers by every backend

use crate::messaging::carrier::{CarrierReader, MessageHeaders};
use crate::messaging::error::HandlerError;
use serde::{de::DeserializeOwned, Serialize};

/// Discriminator naming the payload type
pub const MESSAGE_TYPE_HEADER: &str = "x-message-type";

/// Partition / ordering key, usually the correlation id
pub const MESSAGE_KEY_HEADER: &str = "x-message-key";

/// Payload encoding
pub const CONTENT_TYPE_HEADER: &str = "content-type";

/// Content type of every payload this crate publishes
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A payload type that travels through the pipeline
pub trait TypedMessage: Serialize + DeserializeOwned + Send + Sync {
    /// Value of [`MESSAGE_TYPE_HEADER`] for this type
    const MESSAGE_TYPE: &'static str;

    /// Ordering key; messages sharing a key keep their relative order
    fn message_key(&self) -> String;
}

/// Broker-level delivery facts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryInfo {
    pub destination: String,
    /// 1 for the first delivery, incremented on each redelivery
    pub attempt: u32,
    pub redelivered: bool,
    pub partition: Option<i32>,
    pub offset: Option<i64>,
}

/// Payload plus headers plus delivery metadata
#[derive(Debug, Clone)]
pub struct Envelope {
    pub payload: Vec<u8>,
    pub headers: MessageHeaders,
    pub delivery: DeliveryInfo,
}

impl Envelope {
    pub fn new(destination: impl Into<String>, payload: Vec<u8>, headers: MessageHeaders) -> Self {
        Self {
            payload,
            headers,
            delivery: DeliveryInfo {
                destination: destination.into(),
                attempt: 1,
                ..Default::default()
            },
        }
    }

    pub fn with_position(mut self, partition: i32, offset: i64) -> Self {
        self.delivery.partition = Some(partition);
        self.delivery.offset = Some(offset);
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.delivery.attempt = attempt.max(1);
        self.delivery.redelivered = attempt > 1;
        self
    }

    pub fn destination(&self) -> &str {
        &self.delivery.destination
    }

    pub fn message_type(&self) -> Option<&str> {
        self.headers.get(MESSAGE_TYPE_HEADER)
    }

    pub fn message_key(&self) -> Option<&str> {
        self.headers.get(MESSAGE_KEY_HEADER)
    }

    /// Decode the JSON payload.
    ///
    /// A payload whose type header names a different message type is
    /// rejected before parsing.
    pub fn decode<T: TypedMessage>(&self) -> Result<T, HandlerError> {
        if let Some(found) = self.message_type() {
            if found != T::MESSAGE_TYPE {
                return Err(HandlerError::deserialization(format!(
                    "expected message type {}, got {}",
                    T::MESSAGE_TYPE,
                    found
                )));
            }
        }
        serde_json::from_slice(&self.payload)
            .map_err(|e| HandlerError::deserialization(e.to_string()))
    }

    /// Next delivery of the same message
    pub(crate) fn redelivery(&self) -> Self {
        let mut next = self.clone();
        next.delivery.attempt += 1;
        next.delivery.redelivered = true;
        next
    }

    /// Short printable prefix of the payload for logs and dead letters
    pub fn payload_preview(&self, max: usize) -> String {
        let text = String::from_utf8_lossy(&self.payload);
        text.chars().take(max).collect()
    }
}
