//! Producer adapter: turns a "send a message" request into a persistent
//! publish and maps client failures to caller-visible outcomes.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::error::QueueError;
use crate::queue::{DeliveryMode, Message, QueueBackend};

/// Status string returned with every accepted message.
pub const SENT_STATUS: &str = "Message sent";

/// Confirmation returned to the caller after a successful publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendReceipt {
    pub message: String,
    pub status: &'static str,
}

/// Why a send request was not fulfilled.
#[derive(Debug, Error)]
pub enum SendError {
    /// Missing or empty payload; the broker was never contacted.
    #[error("Message cannot be empty")]
    EmptyMessage,

    /// No broker session could be established for this request.
    #[error("RabbitMQ connection error")]
    Unavailable(#[source] QueueError),

    /// The publish itself failed.
    #[error("Message publish failed")]
    PublishFailed(#[source] QueueError),
}

impl SendError {
    /// HTTP status code for this failure.
    pub fn status_code(&self) -> u16 {
        match self {
            SendError::EmptyMessage => 400,
            SendError::Unavailable(_) => 503,
            SendError::PublishFailed(_) => 500,
        }
    }
}

/// Publishes inbound text messages to the configured queue.
#[derive(Clone)]
pub struct ProducerAdapter {
    backend: Arc<dyn QueueBackend>,
    queue: String,
}

impl ProducerAdapter {
    pub fn new(backend: Arc<dyn QueueBackend>, queue: impl Into<String>) -> Self {
        Self {
            backend,
            queue: queue.into(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Whether the underlying client currently holds a live channel.
    pub async fn is_connected(&self) -> bool {
        self.backend.is_connected().await
    }

    /// Open the broker session ahead of the first request.
    pub async fn start(&self) -> Result<(), QueueError> {
        self.backend.connect().await
    }

    /// Publish `msg` persistently. The publish is attempted at most once.
    pub async fn send(&self, msg: Option<&str>) -> Result<SendReceipt, SendError> {
        let msg = match msg {
            Some(m) if !m.is_empty() => m,
            _ => {
                warn!("message_validation_failed");
                return Err(SendError::EmptyMessage);
            }
        };

        // The session may be missing if startup failed or the broker dropped
        // it since; one connect attempt per request, never a publish retry
        if !self.backend.is_connected().await {
            if let Err(e) = self.backend.connect().await {
                error!(error = %e, "producer_broker_unavailable");
                return Err(SendError::Unavailable(e));
            }
        }

        let message =
            Message::new(msg.as_bytes(), DeliveryMode::Persistent).with_content_type("text/plain");

        match self.backend.publish(&self.queue, message).await {
            Ok(()) => {
                info!(queue = %self.queue, body_length = msg.len(), "message_sent");
                Ok(SendReceipt {
                    message: msg.to_string(),
                    status: SENT_STATUS,
                })
            }
            Err(e) => {
                error!(queue = %self.queue, error = %e, "message_publish_failed");
                Err(SendError::PublishFailed(e))
            }
        }
    }

    /// Release the broker session.
    pub async fn close(&self) {
        self.backend.close().await;
    }
}
