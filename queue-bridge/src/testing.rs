//! In-memory broker double with failure injection.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;

use crate::error::QueueError;
use crate::queue::{DeliveryStream, Message, QueueBackend};

/// How the next `connect` call behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BrokerHealth {
    Up,
    Unreachable,
    Rejecting,
}

#[derive(Default)]
struct State {
    connected: bool,
    health: Option<BrokerHealth>,
    fail_publish: bool,
    queue: VecDeque<Message>,
    consumer: Option<UnboundedSender<Result<Message, QueueError>>>,
    next_tag: u64,
    unacked: HashMap<u64, Message>,
    acked: Vec<u64>,
    nacked: Vec<(u64, bool)>,
}

impl State {
    fn health(&self) -> BrokerHealth {
        self.health.unwrap_or(BrokerHealth::Up)
    }

    fn deliver(&mut self, mut message: Message) {
        self.next_tag += 1;
        message.delivery_tag = self.next_tag;
        self.unacked.insert(message.delivery_tag, message.clone());

        match &self.consumer {
            Some(tx) if !tx.is_closed() => {
                let _ = tx.unbounded_send(Ok(message));
            }
            _ => self.queue.push_back(message),
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeBroker {
    state: Mutex<State>,
    connect_calls: AtomicUsize,
    publish_calls: AtomicUsize,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn set_health(&self, health: BrokerHealth) {
        self.state().health = Some(health);
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.state().fail_publish = fail;
    }

    /// Simulate the broker dropping the connection mid-consume.
    pub fn drop_connection(&self) {
        let mut state = self.state();
        state.connected = false;
        if let Some(tx) = state.consumer.take() {
            let _ = tx.unbounded_send(Err(QueueError::Connection("connection reset".into())));
        }
    }

    /// Put a message on the queue as if another producer had published it.
    pub fn enqueue(&self, message: Message) {
        self.state().deliver(message);
    }

    pub fn queue_depth(&self) -> usize {
        self.state().queue.len()
    }

    pub fn acked(&self) -> Vec<u64> {
        self.state().acked.clone()
    }

    pub fn nacked(&self) -> Vec<(u64, bool)> {
        self.state().nacked.clone()
    }

    pub fn connects(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn publishes(&self) -> usize {
        self.publish_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueueBackend for FakeBroker {
    async fn connect(&self) -> Result<(), QueueError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        match state.health() {
            BrokerHealth::Up => {
                state.connected = true;
                Ok(())
            }
            BrokerHealth::Unreachable => {
                Err(QueueError::Connection("connection refused".into()))
            }
            BrokerHealth::Rejecting => Err(QueueError::Broker("ACCESS_REFUSED".into())),
        }
    }

    async fn is_connected(&self) -> bool {
        self.state().connected
    }

    async fn publish(&self, _queue: &str, message: Message) -> Result<(), QueueError> {
        self.publish_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        if !state.connected {
            return Err(QueueError::NotConnected);
        }
        if state.fail_publish {
            return Err(QueueError::Publish("channel write failed".into()));
        }
        state.deliver(message);
        Ok(())
    }

    async fn subscribe(&self, _queue: &str) -> Result<DeliveryStream, QueueError> {
        let mut state = self.state();
        if !state.connected {
            return Err(QueueError::NotConnected);
        }
        if state.consumer.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return Err(QueueError::AlreadyConsuming);
        }

        let (tx, rx) = unbounded();
        while let Some(message) = state.queue.pop_front() {
            let _ = tx.unbounded_send(Ok(message));
        }
        state.consumer = Some(tx);

        Ok(rx.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), QueueError> {
        let mut state = self.state();
        if !state.connected {
            return Err(QueueError::NotConnected);
        }
        state.unacked.remove(&delivery_tag);
        state.acked.push(delivery_tag);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), QueueError> {
        let mut state = self.state();
        if !state.connected {
            return Err(QueueError::NotConnected);
        }
        state.nacked.push((delivery_tag, requeue));

        // Requeued messages come back flagged but without a delivery count,
        // as a classic queue sends them
        if let Some(mut message) = state.unacked.remove(&delivery_tag) {
            if requeue {
                message.redelivered = true;
                state.deliver(message);
            }
        }
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.state();
        state.connected = false;
        state.consumer = None;
    }
}
