//! Async RabbitMQ client owning one connection and one channel.
//!
//! The session sits behind an async mutex, so concurrent publishers are
//! serialised through the single channel instead of sharing it unguarded.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    Channel, Connection, ConnectionProperties,
};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::backend::{DeliveryStream, QueueBackend};
use super::types::{DeliveryMode, Message};
use crate::config::{redact_url, AckMode, Config};
use crate::error::QueueError;

/// Reply code sent with a normal channel/connection close.
const REPLY_SUCCESS: u16 = 200;

/// Settings the client needs from [`Config`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub url: String,
    pub queue: String,
    pub ack_mode: AckMode,
    pub prefetch_count: u16,
    pub publisher_confirms: bool,
    pub consumer_tag: String,
}

impl From<&Config> for ClientOptions {
    fn from(config: &Config) -> Self {
        Self {
            url: config.rabbitmq_url.clone(),
            queue: config.queue_name.clone(),
            ack_mode: config.ack_mode,
            prefetch_count: config.prefetch_count,
            publisher_confirms: config.publisher_confirms,
            consumer_tag: config.consumer_tag.clone(),
        }
    }
}

/// RabbitMQ client with an explicit connect/close lifecycle.
///
/// Cloning is cheap; clones share the same session.
#[derive(Clone)]
pub struct QueueClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    options: ClientOptions,
    session: Mutex<Option<Session>>,
}

/// A live connection, its channel, and what has been set up on it.
struct Session {
    connection: Connection,
    channel: Channel,
    declared: HashSet<String>,
    consumer_tag: Option<String>,
}

impl Session {
    fn is_live(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    /// Declare `queue` durable unless this session already did.
    async fn ensure_declared(&mut self, queue: &str) -> Result<(), lapin::Error> {
        if self.declared.contains(queue) {
            return Ok(());
        }

        declare_durable(&self.channel, queue).await?;
        self.declared.insert(queue.to_string());

        info!(queue = queue, "rabbitmq_queue_declared");
        Ok(())
    }

    /// Close channel then connection, tolerating handles that already died.
    async fn shutdown(self) {
        if self.channel.status().connected() {
            info!("rabbitmq_channel_closing");
            if let Err(e) = self.channel.close(REPLY_SUCCESS, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_channel_close_error");
            }
        }

        if self.connection.status().connected() {
            info!("rabbitmq_connection_closing");
            if let Err(e) = self.connection.close(REPLY_SUCCESS, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_connection_close_error");
            }
        }
    }
}

async fn declare_durable(channel: &Channel, queue: &str) -> Result<(), lapin::Error> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map(|_| ())
}

impl QueueClient {
    /// Create a disconnected client. Nothing touches the network until
    /// [`QueueBackend::connect`] is called.
    pub fn new(options: ClientOptions) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                options,
                session: Mutex::new(None),
            }),
        }
    }

    /// Name of the queue declared on connect.
    pub fn queue(&self) -> &str {
        &self.inner.options.queue
    }

    /// Open connection and channel, enable confirms, declare the queue.
    async fn open_session(&self) -> Result<Session, QueueError> {
        let options = &self.inner.options;

        info!(url = %redact_url(&options.url), "rabbitmq_connecting");

        let connection = Connection::connect(&options.url, ConnectionProperties::default())
            .await
            .map_err(QueueError::from_connect)?;

        info!("rabbitmq_connected");

        let channel = match self.prepare_channel(&connection).await {
            Ok(channel) => channel,
            Err(e) => {
                if let Err(close_err) = connection.close(REPLY_SUCCESS, "Setup failed").await {
                    warn!(error = %close_err, "rabbitmq_connection_close_error");
                }
                return Err(QueueError::from_connect(e));
            }
        };

        info!(
            queue = %options.queue,
            publisher_confirms = options.publisher_confirms,
            "rabbitmq_channel_ready"
        );

        let mut declared = HashSet::new();
        declared.insert(options.queue.clone());

        Ok(Session {
            connection,
            channel,
            declared,
            consumer_tag: None,
        })
    }

    async fn prepare_channel(&self, connection: &Connection) -> Result<Channel, lapin::Error> {
        let options = &self.inner.options;
        let channel = connection.create_channel().await?;

        if options.publisher_confirms {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await?;
        }

        declare_durable(&channel, &options.queue).await?;

        Ok(channel)
    }
}

#[async_trait]
impl QueueBackend for QueueClient {
    async fn connect(&self) -> Result<(), QueueError> {
        let mut session = self.inner.session.lock().await;

        if let Some(current) = session.as_ref() {
            if current.is_live() {
                return Ok(());
            }
        }

        // A dead session is released before a new one replaces it
        if let Some(stale) = session.take() {
            warn!("rabbitmq_stale_session_discarded");
            stale.shutdown().await;
        }

        *session = Some(self.open_session().await?);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.inner
            .session
            .lock()
            .await
            .as_ref()
            .map(Session::is_live)
            .unwrap_or(false)
    }

    async fn publish(&self, queue: &str, message: Message) -> Result<(), QueueError> {
        let mut guard = self.inner.session.lock().await;
        let session = guard
            .as_mut()
            .filter(|s| s.is_live())
            .ok_or(QueueError::NotConnected)?;

        session
            .ensure_declared(queue)
            .await
            .map_err(QueueError::from_publish)?;

        let confirmation = session
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &message.payload,
                message.properties(),
            )
            .await
            .map_err(QueueError::from_publish)?
            .await
            .map_err(QueueError::from_publish)?;

        if confirmation.is_nack() {
            return Err(QueueError::Publish("message was nacked by the broker".into()));
        }

        info!(
            queue = queue,
            body_length = message.payload.len(),
            persistent = message.delivery_mode == DeliveryMode::Persistent,
            "rabbitmq_message_published"
        );

        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<DeliveryStream, QueueError> {
        let options = &self.inner.options;
        let mut guard = self.inner.session.lock().await;
        let session = guard
            .as_mut()
            .filter(|s| s.is_live())
            .ok_or(QueueError::NotConnected)?;

        if session.consumer_tag.is_some() {
            return Err(QueueError::AlreadyConsuming);
        }

        session
            .ensure_declared(queue)
            .await
            .map_err(QueueError::from_connect)?;

        let no_ack = options.ack_mode == AckMode::Auto;
        if !no_ack {
            session
                .channel
                .basic_qos(options.prefetch_count, BasicQosOptions::default())
                .await
                .map_err(QueueError::from_channel)?;

            info!(prefetch_count = options.prefetch_count, "rabbitmq_qos_set");
        }

        let consumer = session
            .channel
            .basic_consume(
                queue,
                &options.consumer_tag,
                BasicConsumeOptions {
                    no_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(QueueError::from_channel)?;

        session.consumer_tag = Some(options.consumer_tag.clone());

        info!(
            queue = queue,
            consumer_tag = %options.consumer_tag,
            no_ack = no_ack,
            "rabbitmq_consumer_started"
        );

        let deliveries = consumer.map(|delivery| {
            delivery
                .map(Message::from_delivery)
                .map_err(QueueError::from_channel)
        });

        Ok(deliveries.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), QueueError> {
        let guard = self.inner.session.lock().await;
        let session = guard.as_ref().ok_or(QueueError::NotConnected)?;

        session
            .channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(QueueError::from_channel)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), QueueError> {
        let guard = self.inner.session.lock().await;
        let session = guard.as_ref().ok_or(QueueError::NotConnected)?;

        session
            .channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await
            .map_err(QueueError::from_channel)
    }

    async fn close(&self) {
        let session = self.inner.session.lock().await.take();

        if let Some(session) = session {
            session.shutdown().await;
            info!("rabbitmq_client_closed");
        }
    }
}
