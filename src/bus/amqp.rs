//! AMQP (RabbitMQ) broker implementation.
//!
//! Every `listen` gets its own channel from a pooled connection so that
//! concurrent round trips never share a consumer. Queues are declared
//! exclusive and non-durable: they belong to one subscription and are deleted
//! when it closes.

use async_trait::async_trait;
use deadpool_lapin::{Manager, Object, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, Consumer, ExchangeKind,
};
use tracing::{debug, info, warn};

use super::{
    redact_url, Acknowledge, Binding, Broker, BusError, Delivery, DeliveryStream, ExchangeType,
    OutboundMessage, Result, Subscription,
};

/// Maximum pooled connections.
const POOL_SIZE: usize = 10;

/// Reply code for a normal channel close.
const REPLY_SUCCESS: u16 = 200;

/// RabbitMQ broker backed by a deadpool-lapin connection pool.
pub struct AmqpBroker {
    pool: Pool,
    url: String,
}

impl AmqpBroker {
    /// Create the connection pool and verify the broker is reachable.
    pub async fn connect(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        let manager = Manager::new(url.clone(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(POOL_SIZE)
            .build()
            .map_err(|e| BusError::Connection(format!("Failed to create pool: {}", e)))?;

        // Verify connection
        let conn = pool
            .get()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to connect: {}", e)))?;
        drop(conn);

        info!(url = %redact_url(&url), "Connected to AMQP");

        Ok(Self { pool, url })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn connection(&self) -> Result<Object> {
        self.pool.get().await.map_err(|e: PoolError| {
            BusError::Connection(format!("Failed to get connection from pool: {}", e))
        })
    }

    async fn create_channel(conn: &Connection) -> Result<Channel> {
        conn.create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))
    }

    async fn declare_exchange(
        channel: &Channel,
        exchange: &str,
        exchange_type: &ExchangeType,
    ) -> lapin::Result<()> {
        channel
            .exchange_declare(
                exchange,
                exchange_kind(exchange_type),
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
    }

    async fn declare_queue(channel: &Channel, binding: &Binding) -> Result<()> {
        Self::declare_exchange(channel, &binding.exchange, &binding.exchange_type)
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to declare exchange: {}", e)))?;

        channel
            .queue_declare(
                &binding.queue,
                QueueDeclareOptions {
                    durable: false,
                    exclusive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to declare queue: {}", e)))?;
        Ok(())
    }

    async fn bind_and_consume(channel: &Channel, binding: &Binding) -> Result<Consumer> {
        channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to bind queue: {}", e)))?;

        channel
            .basic_consume(
                &binding.queue,
                &binding.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))
    }

    /// Delete a queue declared by a `listen` that then failed.
    ///
    /// A broker-side error closes the channel it happened on, so the delete
    /// falls back to a new channel on the same connection; the queue is
    /// exclusive to that connection.
    async fn discard_queue(conn: &Connection, channel: &Channel, queue: &str) {
        let result = if channel.status().connected() {
            channel
                .queue_delete(queue, QueueDeleteOptions::default())
                .await
                .map(|_| ())
        } else {
            match conn.create_channel().await {
                Ok(cleanup) => {
                    let deleted = cleanup
                        .queue_delete(queue, QueueDeleteOptions::default())
                        .await
                        .map(|_| ());
                    close_channel(&cleanup).await;
                    deleted
                }
                Err(e) => Err(e),
            }
        };

        match result {
            Ok(()) => debug!(queue = %queue, "Deleted queue of failed subscription"),
            Err(e) => warn!(queue = %queue, error = %e, "Queue delete failed"),
        }
    }

    async fn publish(channel: &Channel, message: &OutboundMessage) -> Result<()> {
        Self::declare_exchange(channel, &message.exchange, &message.exchange_type)
            .await
            .map_err(|e| BusError::Publish(format!("Failed to declare exchange: {}", e)))?;

        let mut properties = BasicProperties::default().with_content_type("application/json".into());
        if let Some(correlation_id) = &message.correlation_id {
            properties = properties.with_correlation_id(correlation_id.as_str().into());
        }
        if let Some(reply_to) = &message.reply_to {
            properties = properties.with_reply_to(reply_to.as_str().into());
        }

        let confirm = channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))?;

        confirm
            .await
            .map_err(|e| BusError::Publish(format!("Publish confirmation failed: {}", e)))?;
        Ok(())
    }
}

/// Close a channel the broker may already have closed.
async fn close_channel(channel: &Channel) {
    if !channel.status().connected() {
        return;
    }
    if let Err(e) = channel.close(REPLY_SUCCESS, "OK").await {
        debug!(error = %e, "Failed to close channel");
    }
}

fn exchange_kind(exchange_type: &ExchangeType) -> ExchangeKind {
    match exchange_type {
        ExchangeType::Direct => ExchangeKind::Direct,
        ExchangeType::Fanout => ExchangeKind::Fanout,
        ExchangeType::Topic => ExchangeKind::Topic,
        ExchangeType::Headers => ExchangeKind::Headers,
        ExchangeType::Custom(kind) => ExchangeKind::Custom(kind.clone()),
    }
}

fn into_delivery(mut delivery: lapin::message::Delivery) -> Delivery {
    let properties = &delivery.properties;
    let correlation_id = properties
        .correlation_id()
        .as_ref()
        .map(|id| id.as_str().to_string());
    let reply_to = properties.reply_to().as_ref().map(|r| r.as_str().to_string());
    let exchange = delivery.exchange.as_str().to_string();
    let routing_key = delivery.routing_key.as_str().to_string();
    let body = std::mem::take(&mut delivery.data);

    Delivery::new(
        exchange,
        routing_key,
        correlation_id,
        reply_to,
        body,
        Box::new(AmqpAcker(delivery)),
    )
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn listen(&self, binding: &Binding) -> Result<(Box<dyn Subscription>, DeliveryStream)> {
        let conn = self.connection().await?;
        let channel = Self::create_channel(&conn).await?;

        if let Err(e) = Self::declare_queue(&channel, binding).await {
            close_channel(&channel).await;
            return Err(e);
        }

        let consumer = match Self::bind_and_consume(&channel, binding).await {
            Ok(consumer) => consumer,
            Err(e) => {
                Self::discard_queue(&conn, &channel, &binding.queue).await;
                close_channel(&channel).await;
                return Err(e);
            }
        };

        debug!(
            queue = %binding.queue,
            exchange = %binding.exchange,
            routing_key = %binding.routing_key,
            "Bound queue to exchange"
        );

        let subscription = AmqpSubscription {
            consumer_tag: consumer.tag().as_str().to_string(),
            queue: binding.queue.clone(),
            channel,
        };

        let stream = consumer.map(|item| {
            item.map(into_delivery)
                .map_err(|e| BusError::Subscribe(format!("Consumer delivery error: {}", e)))
        });

        Ok((Box::new(subscription), Box::pin(stream)))
    }

    #[tracing::instrument(
        name = "bus.send",
        skip_all,
        fields(exchange = %message.exchange, routing_key = %message.routing_key)
    )]
    async fn send(&self, message: OutboundMessage) -> Result<()> {
        let conn = self.connection().await?;
        let channel = Self::create_channel(&conn).await?;

        let result = Self::publish(&channel, &message).await;
        close_channel(&channel).await;

        if result.is_ok() {
            debug!(bytes = message.body.len(), "Published message");
        }
        result
    }
}

/// A consumer on its own channel.
struct AmqpSubscription {
    channel: Channel,
    queue: String,
    consumer_tag: String,
}

#[async_trait]
impl Subscription for AmqpSubscription {
    fn queue(&self) -> &str {
        &self.queue
    }

    /// Cancel, delete, close. Each step runs even if an earlier one failed;
    /// the first error is returned.
    async fn close(self: Box<Self>) -> Result<()> {
        let mut first_error = None;

        if let Err(e) = self
            .channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await
        {
            warn!(consumer_tag = %self.consumer_tag, error = %e, "Consumer cancel failed");
            first_error.get_or_insert(BusError::Teardown(format!("Consumer cancel failed: {}", e)));
        }

        if let Err(e) = self
            .channel
            .queue_delete(&self.queue, QueueDeleteOptions::default())
            .await
        {
            warn!(queue = %self.queue, error = %e, "Queue delete failed");
            first_error.get_or_insert(BusError::Teardown(format!("Queue delete failed: {}", e)));
        }

        if let Err(e) = self.channel.close(REPLY_SUCCESS, "OK").await {
            warn!(queue = %self.queue, error = %e, "Closing channel failed");
            first_error.get_or_insert(BusError::Teardown(format!("Closing channel failed: {}", e)));
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                debug!(queue = %self.queue, "Deleted queue");
                Ok(())
            }
        }
    }
}

/// Keeps the lapin delivery (minus its body) for its ack handle.
struct AmqpAcker(lapin::message::Delivery);

#[async_trait]
impl Acknowledge for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| BusError::Ack(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_kind_mapping() {
        assert!(matches!(
            exchange_kind(&ExchangeType::Topic),
            ExchangeKind::Topic
        ));
        assert!(matches!(
            exchange_kind(&ExchangeType::Fanout),
            ExchangeKind::Fanout
        ));
        assert!(matches!(
            exchange_kind(&ExchangeType::Custom("x-delayed-message".to_string())),
            ExchangeKind::Custom(kind) if kind == "x-delayed-message"
        ));
    }
}
