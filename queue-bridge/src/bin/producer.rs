//! Queue Bridge Producer - HTTP endpoint publishing to RabbitMQ.
//!
//! This binary provides a thin web server that:
//! - Accepts `GET /send?msg=...`
//! - Publishes the message persistently to the durable queue
//! - Returns 503 while no broker session can be opened
//!
//! The broker session is opened at startup; if that fails the server still
//! starts and retries the connection on each request.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use queue_bridge::config::redact_url;
use queue_bridge::shutdown::shutdown_signal;
use queue_bridge::web::{router, AppState};
use queue_bridge::{ClientOptions, Config, ProducerAdapter, QueueClient};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("producer_starting");

    // Load configuration
    let config = Config::from_env();
    info!(
        port = config.port,
        url = %redact_url(&config.rabbitmq_url),
        queue = %config.queue_name,
        publisher_confirms = config.publisher_confirms,
        "config_loaded"
    );

    // Create the queue client and open the session
    let client = Arc::new(QueueClient::new(ClientOptions::from(&config)));
    let producer = ProducerAdapter::new(client, config.queue_name.clone());

    if let Err(e) = producer.start().await {
        error!(error = %e, "rabbitmq_startup_connect_failed");
    }

    let app = router(AppState::new(producer.clone()));

    // Bind to address
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "producer_listening");

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_signal().await;
            info!("producer_shutting_down");
        })
        .await
        .context("Server error")?;

    // Close broker session
    producer.close().await;

    info!("producer_shutdown_complete");

    Ok(())
}
