//! In-memory broker for standalone mode and tests.
//!
//! Routes published messages to bound queues inside the process using the
//! same exchange semantics as RabbitMQ (topic, direct, fanout). Every queue is
//! ephemeral: it exists from `listen` until its subscription is closed.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

use super::{
    topic_matches, Acknowledge, Binding, Broker, BusError, Delivery, DeliveryStream, ExchangeType,
    OutboundMessage, Result, Subscription,
};

/// A queue bound to an exchange.
struct BoundQueue {
    exchange: String,
    exchange_type: ExchangeType,
    routing_key: String,
    sender: mpsc::UnboundedSender<Result<Delivery>>,
}

impl BoundQueue {
    fn accepts(&self, message: &OutboundMessage) -> bool {
        if self.exchange != message.exchange {
            return false;
        }
        match self.exchange_type {
            ExchangeType::Topic => topic_matches(&self.routing_key, &message.routing_key),
            ExchangeType::Fanout => true,
            _ => self.routing_key == message.routing_key,
        }
    }
}

#[derive(Default)]
struct State {
    queues: HashMap<String, BoundQueue>,
    /// Publish log; only kept by `MemoryBroker::recording`.
    published: Option<Vec<OutboundMessage>>,
    acked: usize,
    fail_on_listen: bool,
    fail_on_send: bool,
    fail_on_close: bool,
}

/// In-process broker.
///
/// Cloning shares the same routing table, so a test can hand one clone to the
/// code under test and keep another to play the remote service.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<RwLock<State>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A broker that also keeps a copy of every published message.
    pub fn recording() -> Self {
        Self {
            state: Arc::new(RwLock::new(State {
                published: Some(Vec::new()),
                ..State::default()
            })),
        }
    }

    pub async fn set_fail_on_listen(&self, fail: bool) {
        self.state.write().await.fail_on_listen = fail;
    }

    pub async fn set_fail_on_send(&self, fail: bool) {
        self.state.write().await.fail_on_send = fail;
    }

    pub async fn set_fail_on_close(&self, fail: bool) {
        self.state.write().await.fail_on_close = fail;
    }

    /// Number of queues currently declared.
    pub async fn queue_count(&self) -> usize {
        self.state.read().await.queues.len()
    }

    pub async fn queue_names(&self) -> Vec<String> {
        self.state.read().await.queues.keys().cloned().collect()
    }

    /// Every message published so far, oldest first. Empty unless the
    /// broker was built with `recording`.
    pub async fn published(&self) -> Vec<OutboundMessage> {
        self.state.read().await.published.clone().unwrap_or_default()
    }

    pub async fn acked_count(&self) -> usize {
        self.state.read().await.acked
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn listen(&self, binding: &Binding) -> Result<(Box<dyn Subscription>, DeliveryStream)> {
        let mut state = self.state.write().await;
        if state.fail_on_listen {
            return Err(BusError::Subscribe("Mock listen failure".to_string()));
        }
        if state.queues.contains_key(&binding.queue) {
            return Err(BusError::Subscribe(format!(
                "Queue '{}' already has a consumer",
                binding.queue
            )));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        state.queues.insert(
            binding.queue.clone(),
            BoundQueue {
                exchange: binding.exchange.clone(),
                exchange_type: binding.exchange_type.clone(),
                routing_key: binding.routing_key.clone(),
                sender,
            },
        );

        debug!(
            queue = %binding.queue,
            exchange = %binding.exchange,
            routing_key = %binding.routing_key,
            "Bound in-memory queue"
        );

        let subscription = MemorySubscription {
            queue: binding.queue.clone(),
            state: Arc::clone(&self.state),
        };
        Ok((
            Box::new(subscription),
            Box::pin(UnboundedReceiverStream::new(receiver)),
        ))
    }

    async fn send(&self, message: OutboundMessage) -> Result<()> {
        let mut state = self.state.write().await;
        if state.fail_on_send {
            return Err(BusError::Publish("Mock publish failure".to_string()));
        }

        let mut delivered = 0usize;
        for queue in state.queues.values().filter(|q| q.accepts(&message)) {
            let delivery = Delivery::new(
                message.exchange.clone(),
                message.routing_key.clone(),
                message.correlation_id.clone(),
                message.reply_to.clone(),
                message.body.clone(),
                Box::new(MemoryAcker {
                    state: Arc::clone(&self.state),
                }),
            );
            // Receiver already dropped means the consumer is gone; same as an unrouted message.
            if queue.sender.send(Ok(delivery)).is_ok() {
                delivered += 1;
            }
        }

        debug!(
            exchange = %message.exchange,
            routing_key = %message.routing_key,
            receivers = delivered,
            "Published in-memory message"
        );
        if let Some(log) = state.published.as_mut() {
            log.push(message);
        }
        Ok(())
    }
}

struct MemorySubscription {
    queue: String,
    state: Arc<RwLock<State>>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn queue(&self) -> &str {
        &self.queue
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let mut state = self.state.write().await;
        // Deletion still happens so a failing close never leaks the queue.
        let removed = state.queues.remove(&self.queue);
        if state.fail_on_close {
            return Err(BusError::Teardown("Mock close failure".to_string()));
        }
        match removed {
            Some(_) => {
                info!(queue = %self.queue, "Deleted in-memory queue");
                Ok(())
            }
            None => Err(BusError::Teardown(format!(
                "Queue '{}' was already deleted",
                self.queue
            ))),
        }
    }
}

struct MemoryAcker {
    state: Arc<RwLock<State>>,
}

#[async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.state.write().await.acked += 1;
        Ok(())
    }
}
