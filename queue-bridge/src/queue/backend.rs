//! The seam between the queue client and everything that uses it.

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::types::Message;
use crate::error::QueueError;

/// Stream of deliveries for one consumer registration.
///
/// Yields `Err` when the channel or connection fails; the stream ends after
/// the session is closed.
pub type DeliveryStream = BoxStream<'static, Result<Message, QueueError>>;

/// Broker operations the consumer loop and producer adapter rely on.
///
/// Implementations own exactly one connection and one channel and must be
/// safe to share between tasks.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Open a connection and channel and declare the configured queue.
    /// Succeeds immediately when a live session already exists.
    async fn connect(&self) -> Result<(), QueueError>;

    /// Whether a live channel is currently held.
    async fn is_connected(&self) -> bool;

    /// Publish one message to `queue`. Never retried internally.
    async fn publish(&self, queue: &str, message: Message) -> Result<(), QueueError>;

    /// Register the single consumer on `queue` and return its deliveries.
    async fn subscribe(&self, queue: &str) -> Result<DeliveryStream, QueueError>;

    /// Positively acknowledge a manually acknowledged delivery.
    async fn ack(&self, delivery_tag: u64) -> Result<(), QueueError>;

    /// Reject a manually acknowledged delivery.
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), QueueError>;

    /// Close channel then connection. Idempotent.
    async fn close(&self);
}
