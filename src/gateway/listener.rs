//! Correlation listener: one ephemeral subscription per outstanding request.
//!
//! Every listener is bound to the shared replies address, so it sees every
//! reply published there. Only the delivery whose correlation id matches is
//! taken; the rest are dropped unacknowledged.

use futures::StreamExt;
use tracing::{debug, warn};

use crate::bus::{Binding, Broker, BusError, Delivery, DeliveryStream, Subscription};

/// Owns the subscription behind one round trip.
///
/// `close` tears it down. If the listener is dropped without being closed
/// (the round trip future was cancelled), teardown is handed to a background
/// task so the queue is still deleted.
pub struct ReplyListener {
    queue: String,
    subscription: Option<Box<dyn Subscription>>,
}

impl ReplyListener {
    /// Declare, bind, and start consuming the queue described by `binding`.
    ///
    /// On error nothing was created and there is nothing to close.
    pub async fn open(
        broker: &dyn Broker,
        binding: &Binding,
    ) -> Result<(Self, DeliveryStream), BusError> {
        let (subscription, deliveries) = broker.listen(binding).await?;

        debug!(
            queue = %binding.queue,
            routing_key = %binding.routing_key,
            "Opened reply listener"
        );

        let listener = Self {
            queue: binding.queue.clone(),
            subscription: Some(subscription),
        };
        Ok((listener, deliveries))
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Cancel the consumer, delete the queue, and close the channel.
    ///
    /// Failures are logged and swallowed.
    pub async fn close(mut self) {
        if let Some(subscription) = self.subscription.take() {
            close_subscription(subscription).await;
        }
    }
}

impl Drop for ReplyListener {
    fn drop(&mut self) {
        let Some(subscription) = self.subscription.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!(queue = %self.queue, "Reply listener dropped open, closing in background");
                runtime.spawn(close_subscription(subscription));
            }
            Err(_) => {
                warn!(queue = %self.queue, "Reply listener dropped outside a runtime, queue not deleted");
            }
        }
    }
}

async fn close_subscription(subscription: Box<dyn Subscription>) {
    let queue = subscription.queue().to_string();
    match subscription.close().await {
        Ok(()) => debug!(queue = %queue, "Closed reply listener"),
        Err(e) => warn!(queue = %queue, error = %e, "Reply listener cleanup failed"),
    }
}

/// Consume `deliveries` until one carries `correlation_id`, ack it, and return it.
///
/// Errors when the stream fails or ends before a match arrives.
pub async fn next_correlated(
    deliveries: &mut DeliveryStream,
    correlation_id: &str,
) -> Result<Delivery, BusError> {
    while let Some(delivery) = deliveries.next().await {
        let delivery = delivery?;

        if !delivery.is_correlated_with(correlation_id) {
            debug!(
                expected = %correlation_id,
                received = ?delivery.correlation_id,
                "Ignoring reply for another request"
            );
            continue;
        }

        if let Err(e) = delivery.ack().await {
            warn!(correlation_id = %correlation_id, error = %e, "Failed to ack reply");
        }
        return Ok(delivery);
    }

    Err(BusError::Subscribe(
        "Reply stream ended before a matching reply arrived".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{ExchangeType, MemoryBroker, OutboundMessage};

    fn binding(queue: &str) -> Binding {
        Binding {
            exchange: "ipam".to_string(),
            exchange_type: ExchangeType::Topic,
            queue: queue.to_string(),
            routing_key: "replies".to_string(),
            consumer_tag: String::new(),
        }
    }

    fn reply(correlation_id: &str, body: &str) -> OutboundMessage {
        OutboundMessage {
            exchange: "ipam".to_string(),
            exchange_type: ExchangeType::Topic,
            routing_key: "replies".to_string(),
            body: body.as_bytes().to_vec(),
            correlation_id: Some(correlation_id.to_string()),
            reply_to: None,
        }
    }

    #[tokio::test]
    async fn test_skips_other_correlation_ids() {
        let broker = MemoryBroker::recording();
        let (listener, mut deliveries) = ReplyListener::open(&broker, &binding("q1"))
            .await
            .unwrap();

        broker.send(reply("other", "wrong")).await.unwrap();
        broker.send(reply("mine", "right")).await.unwrap();

        let delivery = next_correlated(&mut deliveries, "mine").await.unwrap();
        assert_eq!(delivery.body, b"right");
        assert_eq!(broker.acked_count().await, 1);

        listener.close().await;
        assert_eq!(broker.queue_count().await, 0);
    }

    #[tokio::test]
    async fn test_stream_end_is_an_error() {
        let broker = MemoryBroker::recording();
        let (listener, mut deliveries) = ReplyListener::open(&broker, &binding("q1"))
            .await
            .unwrap();
        broker.send(reply("other", "wrong")).await.unwrap();
        listener.close().await;

        let result = next_correlated(&mut deliveries, "mine").await;
        assert!(matches!(result, Err(BusError::Subscribe(_))));
        assert_eq!(broker.acked_count().await, 0);
    }

    #[tokio::test]
    async fn test_close_failure_is_swallowed() {
        let broker = MemoryBroker::recording();
        let (listener, _deliveries) = ReplyListener::open(&broker, &binding("q1"))
            .await
            .unwrap();
        broker.set_fail_on_close(true).await;

        listener.close().await;
        assert_eq!(broker.queue_count().await, 0);
    }

    #[tokio::test]
    async fn test_drop_closes_in_background() {
        let broker = MemoryBroker::recording();
        let (listener, _deliveries) = ReplyListener::open(&broker, &binding("q1"))
            .await
            .unwrap();
        assert_eq!(listener.queue(), "q1");

        drop(listener);
        for _ in 0..10 {
            if broker.queue_count().await == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(broker.queue_count().await, 0);
    }
}
