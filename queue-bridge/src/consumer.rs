//! Supervised RabbitMQ consumer loop.
//!
//! [`ConsumerLoop::run`] owns the reconnect decision. Teardown only tears
//! down; whether and when to connect again is decided by the loop itself,
//! after a bounded exponential backoff.
//!
//! ```text
//! DISCONNECTED → CONNECTING → CONSUMING
//!                    ↑  ↓         ↓
//!                RECONNECTING ←───┘
//! any state → CLOSING → CLOSED (terminal)
//! ```

use std::any::Any;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use futures::{FutureExt, StreamExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{AckMode, Config, ReconnectPolicy};
use crate::error::QueueError;
use crate::queue::{DeliveryStream, Message, QueueBackend};

// Handler panics are caught with `catch_unwind`, which an aborting build skips
#[cfg(panic = "abort")]
compile_error!("queue-bridge must be built with panic = \"unwind\"");

/// Jitter applied to every reconnect delay.
const RANDOMIZATION_FACTOR: f64 = 0.2;

/// Failing messages tracked at once before the redelivery counts are reset.
const MAX_TRACKED_REDELIVERIES: usize = 4096;

/// Lifecycle states of the consumer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Consuming,
    Reconnecting,
    Closing,
    Closed,
}

impl ConsumerState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConsumerState::Disconnected => "disconnected",
            ConsumerState::Connecting => "connecting",
            ConsumerState::Consuming => "consuming",
            ConsumerState::Reconnecting => "reconnecting",
            ConsumerState::Closing => "closing",
            ConsumerState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-message processing callback.
///
/// Errors and panics are contained by the loop and never stop consumption.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> anyhow::Result<()>;
}

#[async_trait]
impl<F> MessageHandler for F
where
    F: Fn(&Message) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, message: &Message) -> anyhow::Result<()> {
        self(message)
    }
}

/// Decodes each payload as UTF-8 and logs it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle(&self, message: &Message) -> anyhow::Result<()> {
        let text = message.text().context("payload is not valid UTF-8")?;
        info!(message = %text, delivery_tag = message.delivery_tag, "message_contents");
        Ok(())
    }
}

/// Settings the loop needs from [`Config`].
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub queue: String,
    pub ack_mode: AckMode,
    /// Manual mode: a failing message is requeued while it has been delivered
    /// fewer times than this, and dropped afterwards.
    pub max_redeliveries: u32,
    pub reconnect: ReconnectPolicy,
}

impl From<&Config> for ConsumerOptions {
    fn from(config: &Config) -> Self {
        Self {
            queue: config.queue_name.clone(),
            ack_mode: config.ack_mode,
            max_redeliveries: config.max_redeliveries,
            reconnect: config.reconnect.clone(),
        }
    }
}

/// Counts deliveries of failing messages when the broker does not.
///
/// Classic queues only flag a retry with `redelivered`, so retries are counted
/// per payload fingerprint until the message is settled for good.
#[derive(Debug, Default)]
struct RedeliveryTracker {
    counts: HashMap<u64, u32>,
}

impl RedeliveryTracker {
    /// Deliveries of a failed `message` so far, including this one.
    fn record_failure(&mut self, message: &Message) -> u32 {
        if let Some(count) = message.delivery_count {
            return count;
        }

        let key = fingerprint(message);
        if !message.redelivered {
            self.counts.remove(&key);
            return 1;
        }

        if self.counts.len() >= MAX_TRACKED_REDELIVERIES && !self.counts.contains_key(&key) {
            warn!(tracked = self.counts.len(), "redelivery_tracker_reset");
            self.counts.clear();
        }

        // A redelivery we never saw fail (e.g. before a restart) is at least the second
        let count = self.counts.entry(key).or_insert(1);
        *count = count.saturating_add(1);
        *count
    }

    fn forget(&mut self, message: &Message) {
        self.counts.remove(&fingerprint(message));
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.counts.len()
    }
}

fn fingerprint(message: &Message) -> u64 {
    let mut hasher = DefaultHasher::new();
    message.payload.hash(&mut hasher);
    message.content_type.hash(&mut hasher);
    hasher.finish()
}

impl ReconnectPolicy {
    fn build_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_delay)
            .with_max_interval(self.max_delay)
            .with_multiplier(self.multiplier)
            .with_randomization_factor(RANDOMIZATION_FACTOR)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Connects, subscribes and feeds deliveries to a [`MessageHandler`],
/// reconnecting after failures until stopped.
pub struct ConsumerLoop<B: ?Sized, H> {
    backend: Arc<B>,
    handler: H,
    options: ConsumerOptions,
    shutdown: CancellationToken,
    state: watch::Sender<ConsumerState>,
    running: AtomicBool,
    redeliveries: Mutex<RedeliveryTracker>,
}

impl<B, H> ConsumerLoop<B, H>
where
    B: QueueBackend + ?Sized,
    H: MessageHandler,
{
    pub fn new(backend: Arc<B>, handler: H, options: ConsumerOptions) -> Self {
        let (state, _) = watch::channel(ConsumerState::Disconnected);
        Self {
            backend,
            handler,
            options,
            shutdown: CancellationToken::new(),
            state,
            running: AtomicBool::new(false),
            redeliveries: Mutex::new(RedeliveryTracker::default()),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Token that stops the loop when cancelled, e.g. from a signal handler.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Request a stop. Safe to call repeatedly and from any task.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    fn transition(&self, next: ConsumerState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = %previous, to = %next, "consumer_state_changed");
        }
    }

    fn redeliveries(&self) -> MutexGuard<'_, RedeliveryTracker> {
        self.redeliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Drive the loop until stopped (`Ok`) or until reconnecting is pointless
    /// (`Err`: a broker rejection, another consumer already registered on the
    /// client, or the attempt limit was reached).
    /// The loop always ends in [`ConsumerState::Closed`].
    ///
    /// Only one `run` may be active per loop; an overlapping call returns
    /// [`QueueError::AlreadyConsuming`] without touching the active one.
    pub async fn run(&self) -> Result<(), QueueError> {
        if self.state() == ConsumerState::Closed {
            return Ok(());
        }

        if self.running.swap(true, Ordering::SeqCst) {
            warn!(queue = %self.options.queue, "consumer_already_running");
            return Err(QueueError::AlreadyConsuming);
        }

        let outcome = self.supervise().await;
        self.running.store(false, Ordering::SeqCst);
        outcome
    }

    async fn supervise(&self) -> Result<(), QueueError> {
        let policy = &self.options.reconnect;
        let mut backoff = policy.build_backoff();
        let mut failures: u32 = 0;

        let outcome = loop {
            if self.shutdown.is_cancelled() {
                break Ok(());
            }

            self.transition(ConsumerState::Connecting);

            let error = match self.establish().await {
                Ok(Some(deliveries)) => {
                    self.transition(ConsumerState::Consuming);
                    backoff.reset();
                    failures = 0;

                    match self.consume(deliveries).await {
                        Ok(()) => break Ok(()),
                        Err(e) => e,
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => e,
            };

            if error.is_fatal() {
                error!(error = %error, queue = %self.options.queue, "consumer_broker_rejected");
                break Err(error);
            }

            if matches!(error, QueueError::AlreadyConsuming) {
                error!(queue = %self.options.queue, "consumer_already_registered");
                break Err(error);
            }

            self.transition(ConsumerState::Reconnecting);
            warn!(error = %error, "consumer_connection_lost");

            // Release whatever is left of the old session; reconnecting is
            // decided below, not by the teardown
            self.backend.close().await;

            failures += 1;
            if let Some(max) = policy.max_attempts {
                if failures >= max {
                    error!(attempts = failures, error = %error, "consumer_reconnect_exhausted");
                    break Err(error);
                }
            }

            let delay = backoff.next_backoff().unwrap_or(policy.max_delay);
            info!(
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                "consumer_reconnect_scheduled"
            );

            if !self.pause(delay).await {
                break Ok(());
            }
        };

        self.transition(ConsumerState::Closing);
        // A session some other consumer is registered on is not ours to close
        if !matches!(outcome, Err(QueueError::AlreadyConsuming)) {
            self.backend.close().await;
        }
        self.transition(ConsumerState::Closed);

        outcome
    }

    /// Sleep for `delay`; returns false if a stop arrived first.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Connect and register the consumer. `Ok(None)` means a stop arrived.
    async fn establish(&self) -> Result<Option<DeliveryStream>, QueueError> {
        let attempt = async {
            self.backend.connect().await?;
            self.backend.subscribe(&self.options.queue).await
        };

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Ok(None),
            result = attempt => result.map(Some),
        }
    }

    /// Process deliveries in broker order. `Ok` means a stop arrived; `Err`
    /// means the channel or connection failed.
    async fn consume(&self, mut deliveries: DeliveryStream) -> Result<(), QueueError> {
        info!(queue = %self.options.queue, "consumer_ready");

        loop {
            let delivery = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(()),
                delivery = deliveries.next() => delivery,
            };

            match delivery {
                Some(Ok(message)) => self.dispatch(message).await,
                Some(Err(e)) => return Err(e),
                None => return Err(QueueError::Connection("delivery stream ended".into())),
            }
        }
    }

    /// Run the handler for one message and settle it per the ack mode.
    async fn dispatch(&self, message: Message) {
        let delivery_tag = message.delivery_tag;

        info!(
            queue = %self.options.queue,
            delivery_tag = delivery_tag,
            body_length = message.payload.len(),
            redelivered = message.redelivered,
            "message_received"
        );

        let result = match AssertUnwindSafe(self.handler.handle(&message))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(QueueError::Processing(format!("{e:#}"))),
            Err(panic) => Err(QueueError::Processing(panic_message(panic.as_ref()))),
        };

        match (self.options.ack_mode, result) {
            (AckMode::Auto, Ok(())) => {
                info!(delivery_tag = delivery_tag, "message_processed");
            }
            (AckMode::Auto, Err(e)) => {
                // Auto-ack already removed the message; it is not retried
                error!(delivery_tag = delivery_tag, error = %e, "message_processing_failed");
            }
            (AckMode::Manual, Ok(())) => {
                self.redeliveries().forget(&message);
                match self.backend.ack(delivery_tag).await {
                    Ok(()) => info!(delivery_tag = delivery_tag, "message_processed"),
                    Err(e) => {
                        error!(delivery_tag = delivery_tag, error = %e, "rabbitmq_ack_failed")
                    }
                }
            }
            (AckMode::Manual, Err(e)) => {
                let delivery_count = {
                    let mut tracker = self.redeliveries();
                    let count = tracker.record_failure(&message);
                    if count >= self.options.max_redeliveries {
                        tracker.forget(&message);
                    }
                    count
                };
                let requeue = delivery_count < self.options.max_redeliveries;
                error!(
                    delivery_tag = delivery_tag,
                    delivery_count = delivery_count,
                    requeue = requeue,
                    error = %e,
                    "message_processing_failed"
                );

                if let Err(nack_err) = self.backend.nack(delivery_tag, requeue).await {
                    error!(
                        delivery_tag = delivery_tag,
                        error = %nack_err,
                        "rabbitmq_nack_failed"
                    );
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}
