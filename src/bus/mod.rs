//! Message broker access.
//!
//! This module contains:
//! - `Broker` trait: declare/bind/consume ephemeral queues and publish correlated messages
//! - `Subscription` trait: the handle that tears a consumer back down
//! - `Delivery`: an inbound message with its correlation id and ack handle
//! - Implementations: AMQP (RabbitMQ), in-memory

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::Deserialize;
use tracing::info;

use crate::config::{MessagingConfig, MessagingType};

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
pub use memory::MemoryBroker;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Ack failed: {0}")]
    Ack(String),

    #[error("Teardown failed: {0}")]
    Teardown(String),
}

/// Exchange routing strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum ExchangeType {
    Direct,
    Fanout,
    #[default]
    Topic,
    Headers,
    /// Broker plugin exchange types such as `x-delayed-message`.
    Custom(String),
}

impl From<&str> for ExchangeType {
    fn from(kind: &str) -> Self {
        match kind {
            "direct" => ExchangeType::Direct,
            "fanout" => ExchangeType::Fanout,
            "topic" => ExchangeType::Topic,
            "headers" => ExchangeType::Headers,
            other => ExchangeType::Custom(other.to_string()),
        }
    }
}

impl From<String> for ExchangeType {
    fn from(kind: String) -> Self {
        ExchangeType::from(kind.as_str())
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeType::Direct => f.write_str("direct"),
            ExchangeType::Fanout => f.write_str("fanout"),
            ExchangeType::Topic => f.write_str("topic"),
            ExchangeType::Headers => f.write_str("headers"),
            ExchangeType::Custom(kind) => f.write_str(kind),
        }
    }
}

/// Where and how a consumer attaches to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// Exchange the queue is bound to (declared if missing).
    pub exchange: String,
    pub exchange_type: ExchangeType,
    /// Queue to declare and consume from.
    pub queue: String,
    /// Routing pattern the queue is bound with.
    pub routing_key: String,
    /// Consumer tag; empty lets the broker assign one.
    pub consumer_tag: String,
}

/// A message to publish.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub exchange: String,
    pub exchange_type: ExchangeType,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
    /// Routing key the receiver should publish its reply with.
    pub reply_to: Option<String>,
}

/// Acknowledges a single delivery back to the broker.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<()>;
}

/// An inbound message.
pub struct Delivery {
    pub exchange: String,
    pub routing_key: String,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub body: Vec<u8>,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        correlation_id: Option<String>,
        reply_to: Option<String>,
        body: Vec<u8>,
        acker: Box<dyn Acknowledge>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            correlation_id,
            reply_to,
            body,
            acker,
        }
    }

    /// True when this delivery carries exactly the given correlation id.
    pub fn is_correlated_with(&self, correlation_id: &str) -> bool {
        self.correlation_id.as_deref() == Some(correlation_id)
    }

    /// Acknowledge this delivery.
    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("correlation_id", &self.correlation_id)
            .field("reply_to", &self.reply_to)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Unbounded sequence of deliveries for one subscription.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery>> + Send + 'static>>;

/// Handle to a live consumer.
///
/// Closing cancels the consumer, deletes the queue, and closes the channel.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Name of the consumed queue.
    fn queue(&self) -> &str;

    async fn close(self: Box<Self>) -> Result<()>;
}

/// Broker client used by the gateway and the inbox listener.
///
/// Implementations:
/// - `AmqpBroker`: RabbitMQ via AMQP
/// - `MemoryBroker`: In-process topic routing for standalone runs and tests
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare the exchange and queue, bind them, and start consuming.
    async fn listen(&self, binding: &Binding) -> Result<(Box<dyn Subscription>, DeliveryStream)>;

    /// Publish a message.
    async fn send(&self, message: OutboundMessage) -> Result<()>;
}

/// Create the broker selected by `config`.
///
/// A single connection attempt; callers wrap this in their own retry.
pub async fn init_broker(config: &MessagingConfig) -> Result<Arc<dyn Broker>> {
    match config.messaging_type {
        MessagingType::Amqp => {
            #[cfg(feature = "amqp")]
            {
                let broker = AmqpBroker::connect(&config.amqp.url).await?;
                info!(messaging_type = "amqp", "Broker initialized");
                Ok(Arc::new(broker))
            }

            #[cfg(not(feature = "amqp"))]
            {
                Err(BusError::Connection(
                    "AMQP support requires the 'amqp' feature. Rebuild with --features amqp"
                        .to_string(),
                ))
            }
        }
        MessagingType::Memory => {
            info!(messaging_type = "memory", "Broker initialized");
            Ok(Arc::new(MemoryBroker::new()))
        }
    }
}

/// Strip credentials from a broker URL for logging.
pub fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

/// Match a routing key against an AMQP topic binding pattern.
///
/// Words are dot-separated; `*` matches exactly one word and `#` matches zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&word, rest)) => match key.split_first() {
                Some((&head, tail)) => (word == "*" || word == head) && matches(rest, tail),
                None => false,
            },
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}
