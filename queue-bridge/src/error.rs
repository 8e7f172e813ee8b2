//! Error taxonomy for queue operations.

use thiserror::Error;

/// AMQP reply codes meaning the broker refuses this client's setup. Anything
/// else the broker closes a connection with (e.g. 320 CONNECTION_FORCED during
/// a restart, 541 INTERNAL_ERROR) may go away on its own.
const ACCESS_REFUSED: u16 = 403;
const NOT_FOUND: u16 = 404;
const PRECONDITION_FAILED: u16 = 406;
const NOT_ALLOWED: u16 = 530;

/// Failures surfaced by the queue client and the consumer loop.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    /// The broker could not be reached (DNS, refused, timeout, dropped link).
    #[error("connection error: {0}")]
    Connection(String),

    /// The broker rejected the request at protocol level
    /// (bad credentials, queue declared with incompatible parameters).
    #[error("broker error: {0}")]
    Broker(String),

    /// A publish failed although a channel existed.
    #[error("publish error: {0}")]
    Publish(String),

    /// No live channel; the caller skipped `connect` or the session is gone.
    #[error("not connected to the broker")]
    NotConnected,

    /// A consumer is already registered on this client.
    #[error("a consumer is already registered on this client")]
    AlreadyConsuming,

    /// The message handler failed for one delivery.
    #[error("processing error: {0}")]
    Processing(String),
}

impl QueueError {
    /// Whether retrying the same operation cannot help without operator action.
    pub fn is_fatal(&self) -> bool {
        matches!(self, QueueError::Broker(_))
    }

    /// Classify a lapin error raised while establishing a session.
    pub(crate) fn from_connect(err: lapin::Error) -> Self {
        match err {
            lapin::Error::ProtocolError(amqp) if is_rejection(amqp.get_id()) => {
                QueueError::Broker(amqp.to_string())
            }
            other => QueueError::Connection(other.to_string()),
        }
    }

    /// Classify a lapin error raised while publishing.
    pub(crate) fn from_publish(err: lapin::Error) -> Self {
        match err {
            lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
                QueueError::NotConnected
            }
            other => QueueError::Publish(other.to_string()),
        }
    }

    /// Classify a lapin error raised on an established channel
    /// (consume registration, ack, or the delivery stream).
    pub(crate) fn from_channel(err: lapin::Error) -> Self {
        match err {
            lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
                QueueError::NotConnected
            }
            other => QueueError::Connection(other.to_string()),
        }
    }
}

fn is_rejection(reply_code: u16) -> bool {
    matches!(
        reply_code,
        ACCESS_REFUSED | NOT_FOUND | PRECONDITION_FAILED | NOT_ALLOWED
    )
}
