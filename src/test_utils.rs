//! Test utilities.
//!
//! Scripted remote services for exercising the gateway against a
//! `MemoryBroker` without a running RabbitMQ.

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use crate::bus::{Binding, Broker, BusError, Delivery, ExchangeType, MemoryBroker, OutboundMessage};
use crate::gateway::{Route, REPLY_QUEUE_PREFIX};

/// Build the reply a well-behaved service would publish for `request`.
///
/// Published on the request's exchange with its `reply_to` routing key and
/// its correlation id.
pub fn reply_for(request: &Delivery, body: impl Into<Vec<u8>>) -> OutboundMessage {
    OutboundMessage {
        exchange: request.exchange.clone(),
        exchange_type: ExchangeType::Topic,
        routing_key: request.reply_to.clone().unwrap_or_default(),
        body: body.into(),
        correlation_id: request.correlation_id.clone(),
        reply_to: None,
    }
}

/// Play the remote service behind `route`.
///
/// Every request arriving on the route's request key is acked and passed to
/// `respond`; each returned message is published in order. Returning an
/// empty vec leaves the request unanswered.
pub async fn spawn_responder<F>(
    broker: &MemoryBroker,
    route: &Route,
    respond: F,
) -> Result<JoinHandle<()>, BusError>
where
    F: Fn(&Delivery) -> Vec<OutboundMessage> + Send + 'static,
{
    let binding = Binding {
        exchange: route.exchange.clone(),
        exchange_type: route.exchange_type.clone(),
        queue: format!("responder.{}", Uuid::new_v4()),
        routing_key: route.request_key.clone(),
        consumer_tag: String::new(),
    };
    let (subscription, mut requests) = broker.listen(&binding).await?;
    let broker = broker.clone();

    Ok(tokio::spawn(async move {
        let _subscription = subscription;
        while let Some(Ok(request)) = requests.next().await {
            if let Err(e) = request.ack().await {
                warn!(error = %e, "Responder failed to ack request");
            }
            for reply in respond(&request) {
                if let Err(e) = broker.send(reply).await {
                    warn!(error = %e, "Responder failed to publish reply");
                }
            }
        }
    }))
}

/// Number of gateway reply queues still declared on `broker`.
pub async fn reply_queue_count(broker: &MemoryBroker) -> usize {
    broker
        .queue_names()
        .await
        .iter()
        .filter(|name| name.starts_with(REPLY_QUEUE_PREFIX))
        .count()
}
