//! Queue Bridge - RabbitMQ producer/consumer bridge.
//!
//! This library provides shared modules for the two binaries:
//! - `queue-bridge-producer`: HTTP endpoint that publishes messages
//! - `queue-bridge-consumer`: Supervised consumer that processes them
//!
//! ## Architecture
//!
//! ```text
//! GET /send → ProducerAdapter → QueueClient ─┐
//!                                            ▼
//!                                  durable queue (RabbitMQ)
//!                                            │
//! MessageHandler ← ConsumerLoop ← QueueClient┘
//! ```

pub mod config;
pub mod consumer;
pub mod error;
pub mod producer;
pub mod queue;
pub mod shutdown;
pub mod web;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use config::{AckMode, Config, ReconnectPolicy};
pub use consumer::{ConsumerLoop, ConsumerOptions, ConsumerState, LoggingHandler, MessageHandler};
pub use error::QueueError;
pub use producer::{ProducerAdapter, SendError, SendReceipt};
pub use queue::{ClientOptions, DeliveryMode, Message, QueueBackend, QueueClient};
pub use web::AppState;
