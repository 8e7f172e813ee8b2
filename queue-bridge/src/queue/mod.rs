//! Queue module for RabbitMQ operations.
//!
//! This module provides:
//! - Message types shared by producer and consumer
//! - The [`QueueBackend`] seam used by the consumer loop and producer adapter
//! - [`QueueClient`], the lapin implementation of that seam
//!
//! ## Lifecycle
//!
//! ```text
//! new → connect → publish / subscribe → close
//! ```

pub mod backend;
pub mod client;
pub mod types;

pub use backend::{DeliveryStream, QueueBackend};
pub use client::{ClientOptions, QueueClient};
pub use types::{DeliveryMode, Message};
