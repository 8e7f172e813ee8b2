//! Message types carried through the queue.

use lapin::types::{AMQPValue, FieldTable};
use lapin::BasicProperties;

/// AMQP delivery-mode value for transient messages.
const TRANSIENT: u8 = 1;

/// AMQP delivery-mode value for messages written to disk by the broker.
const PERSISTENT: u8 = 2;

/// Header quorum queues use to report how often a message was delivered.
const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

/// Whether the broker should keep the message across a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    #[default]
    Transient,
    Persistent,
}

impl DeliveryMode {
    pub fn from_persistent(persistent: bool) -> Self {
        if persistent {
            DeliveryMode::Persistent
        } else {
            DeliveryMode::Transient
        }
    }

    pub fn as_amqp(self) -> u8 {
        match self {
            DeliveryMode::Transient => TRANSIENT,
            DeliveryMode::Persistent => PERSISTENT,
        }
    }

    pub fn from_amqp(value: Option<u8>) -> Self {
        match value {
            Some(PERSISTENT) => DeliveryMode::Persistent,
            _ => DeliveryMode::Transient,
        }
    }
}

/// A single message, either built for one publish or received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Opaque body bytes
    pub payload: Vec<u8>,
    /// Transient or persistent
    pub delivery_mode: DeliveryMode,
    /// Optional MIME type of the payload
    pub content_type: Option<String>,
    /// Broker-assigned tag, zero for outbound messages
    pub delivery_tag: u64,
    /// Set by the broker when this delivery is a retry
    pub redelivered: bool,
    /// Deliveries so far including this one, when the broker reports it
    /// (`x-delivery-count`, quorum queues only)
    pub delivery_count: Option<u32>,
}

impl Message {
    /// Build an outbound message.
    pub fn new(payload: impl Into<Vec<u8>>, delivery_mode: DeliveryMode) -> Self {
        Self {
            payload: payload.into(),
            delivery_mode,
            content_type: None,
            delivery_tag: 0,
            redelivered: false,
            delivery_count: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Decode the payload as UTF-8 text.
    pub fn text(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.payload)
    }

    /// AMQP properties used when publishing this message.
    pub(crate) fn properties(&self) -> BasicProperties {
        let properties = BasicProperties::default().with_delivery_mode(self.delivery_mode.as_amqp());
        match &self.content_type {
            Some(content_type) => properties.with_content_type(content_type.as_str().into()),
            None => properties,
        }
    }

    /// Convert a lapin delivery into a [`Message`].
    pub(crate) fn from_delivery(delivery: lapin::message::Delivery) -> Self {
        let delivery_count = delivery
            .properties
            .headers()
            .as_ref()
            .and_then(header_delivery_count);

        Self {
            delivery_mode: DeliveryMode::from_amqp(*delivery.properties.delivery_mode()),
            content_type: delivery
                .properties
                .content_type()
                .as_ref()
                .map(|s| s.as_str().to_string()),
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            delivery_count,
            payload: delivery.data,
        }
    }
}

/// Read the broker's delivery counter. Quorum queues count previous
/// deliveries, so the current one is that value plus one.
fn header_delivery_count(headers: &FieldTable) -> Option<u32> {
    let (_, value) = headers
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == DELIVERY_COUNT_HEADER)?;

    let previous: i64 = match value {
        AMQPValue::ShortShortInt(v) => i64::from(*v),
        AMQPValue::ShortShortUInt(v) => i64::from(*v),
        AMQPValue::ShortInt(v) => i64::from(*v),
        AMQPValue::ShortUInt(v) => i64::from(*v),
        AMQPValue::LongInt(v) => i64::from(*v),
        AMQPValue::LongUInt(v) => i64::from(*v),
        AMQPValue::LongLongInt(v) => *v,
        _ => return None,
    };

    u32::try_from(previous.max(0)).ok().map(|n| n.saturating_add(1))
}
