//! Queue Bridge Consumer - supervised RabbitMQ consumer.
//!
//! Connects to the broker, consumes the configured durable queue and logs each
//! message. Broker outages are survived with backoff reconnects; SIGINT or
//! SIGTERM closes the channel and connection and exits.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use queue_bridge::config::redact_url;
use queue_bridge::shutdown::shutdown_signal;
use queue_bridge::{ClientOptions, Config, ConsumerLoop, ConsumerOptions, LoggingHandler, QueueClient};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    tracing::info!("consumer_starting");

    // Load configuration from environment
    let config = Config::from_env();
    tracing::info!(
        url = %redact_url(&config.rabbitmq_url),
        queue = %config.queue_name,
        ack_mode = ?config.ack_mode,
        max_redeliveries = config.max_redeliveries,
        reconnect_initial_ms = config.reconnect.initial_delay.as_millis() as u64,
        reconnect_max_ms = config.reconnect.max_delay.as_millis() as u64,
        reconnect_max_attempts = ?config.reconnect.max_attempts,
        "config_loaded"
    );

    let client = Arc::new(QueueClient::new(ClientOptions::from(&config)));
    let consumer = ConsumerLoop::new(client, LoggingHandler, ConsumerOptions::from(&config));

    // Stop the loop on SIGINT/SIGTERM
    let shutdown = consumer.shutdown_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("consumer_stopping");
        shutdown.cancel();
    });

    consumer.run().await.context("Consumer stopped with an error")?;

    tracing::info!("consumer_shutdown_complete");
    Ok(())
}
