//! Background listener on the service's own exchange.
//!
//! Every delivery is acknowledged and logged, then dispatched by the exchange
//! it arrived on. No message kinds are handled yet.

use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{Binding, Broker, BusError, Delivery};

/// Where an inbound delivery is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Addressed to this service; no handler exists yet.
    Unhandled,
    UnknownExchange,
}

/// Route a delivery by the exchange it arrived on.
pub fn dispatch(own_exchange: &str, delivery: &Delivery) -> Dispatch {
    if delivery.exchange == own_exchange {
        Dispatch::Unhandled
    } else {
        Dispatch::UnknownExchange
    }
}

/// Start consuming `binding` in the background.
///
/// The task runs until `shutdown` fires or the stream ends, then closes the
/// subscription.
pub async fn spawn_inbox(
    broker: Arc<dyn Broker>,
    binding: Binding,
    shutdown: CancellationToken,
) -> Result<JoinHandle<()>, BusError> {
    let (subscription, mut deliveries) = broker.listen(&binding).await?;
    info!(
        exchange = %binding.exchange,
        queue = %binding.queue,
        binding_key = %binding.routing_key,
        "Listening on inbox"
    );

    Ok(tokio::spawn(async move {
        loop {
            let delivery = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(e)) => {
                        warn!(error = %e, "Inbox delivery failed");
                        continue;
                    }
                    None => break,
                },
            };

            info!(
                exchange = %delivery.exchange,
                bytes = delivery.body.len(),
                body = %String::from_utf8_lossy(&delivery.body),
                "Inbox delivery"
            );
            if let Err(e) = delivery.ack().await {
                warn!(error = %e, "Failed to ack inbox delivery");
            }

            match dispatch(&binding.exchange, &delivery) {
                Dispatch::Unhandled => info!(
                    routing_key = %delivery.routing_key,
                    "Inbox message not yet handled"
                ),
                Dispatch::UnknownExchange => {
                    warn!(exchange = %delivery.exchange, "Unknown exchange")
                }
            }
        }

        let queue = subscription.queue().to_string();
        if let Err(e) = subscription.close().await {
            warn!(queue = %queue, error = %e, "Inbox cleanup failed");
        }
        info!(queue = %queue, "Inbox stopped");
    }))
}
