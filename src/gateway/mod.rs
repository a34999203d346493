//! Correlated request/reply over the message broker.
//!
//! Each round trip:
//! 1. opens a private reply listener bound to the route's replies key
//! 2. publishes the request stamped with a fresh correlation id
//! 3. waits, bounded by the configured timeout, for the reply carrying that id
//! 4. tears the listener down whatever the outcome
//!
//! The caller gets exactly one result: the reply, or a `GatewayError`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::{Binding, Broker, BusError, DeliveryStream, ExchangeType, OutboundMessage};
use crate::storage::StorageError;

pub mod listener;

pub use listener::ReplyListener;

/// Default bound on the wait for a reply.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Prefix of every reply queue the gateway declares.
pub const REPLY_QUEUE_PREFIX: &str = "houston.reply.";

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Why a round trip produced no usable reply.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The reply listener could not be opened, or failed while waiting.
    #[error("transport error: {0}")]
    Transport(#[source] BusError),

    /// The request could not be encoded or published.
    #[error("failed to publish request: {0}")]
    Publish(#[source] BusError),

    /// The matching reply did not decode to the expected shape.
    #[error("malformed reply: {0}")]
    Decode(#[from] serde_json::Error),

    /// The reply decoded but its record could not be written.
    #[error("failed to persist reply: {0}")]
    Persistence(#[from] StorageError),

    #[error("no reply within {}ms", .0.as_millis())]
    Timeout(Duration),
}

impl GatewayError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, GatewayError::Timeout(_))
    }
}

/// Where a remote service takes requests and publishes replies.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Route {
    pub exchange: String,
    #[serde(default)]
    pub exchange_type: ExchangeType,
    /// Routing key requests are published with.
    #[serde(default = "default_request_key")]
    pub request_key: String,
    /// Routing key the service publishes replies with.
    #[serde(default = "default_reply_key")]
    pub reply_key: String,
}

fn default_request_key() -> String {
    "requests".to_string()
}

fn default_reply_key() -> String {
    "replies".to_string()
}

impl Route {
    pub fn new(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            exchange_type: ExchangeType::Topic,
            request_key: default_request_key(),
            reply_key: default_reply_key(),
        }
    }
}

/// Request/reply client shared by every upstream client.
///
/// Cheap to clone; round trips are independent and may run concurrently.
#[derive(Clone)]
pub struct Gateway {
    broker: Arc<dyn Broker>,
    timeout: Duration,
}

impl Gateway {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send `body` and return the matching reply body unchanged.
    pub async fn request_raw(&self, route: &Route, body: Vec<u8>) -> Result<Vec<u8>> {
        self.round_trip(route, body, Ok).await
    }

    /// Send `request` as JSON and decode the matching reply as `Rep`.
    pub async fn request<Req, Rep>(&self, route: &Route, request: &Req) -> Result<Rep>
    where
        Req: Serialize + ?Sized,
        Rep: DeserializeOwned + Send + 'static,
    {
        let body = serde_json::to_vec(request)
            .map_err(|e| GatewayError::Publish(BusError::Publish(e.to_string())))?;

        self.round_trip(route, body, |reply| {
            serde_json::from_slice(&reply).map_err(GatewayError::from)
        })
        .await
    }

    /// Request, decode, then hand the reply to `persist`.
    ///
    /// `persist` runs only after a reply has been decoded, so nothing is
    /// written on timeout or on any earlier failure.
    pub async fn request_and_persist<Req, Rep, T, F, Fut>(
        &self,
        route: &Route,
        request: &Req,
        persist: F,
    ) -> Result<T>
    where
        Req: Serialize + ?Sized,
        Rep: DeserializeOwned + Send + 'static,
        F: FnOnce(Rep) -> Fut,
        Fut: Future<Output = std::result::Result<T, StorageError>>,
    {
        let reply: Rep = self.request(route, request).await?;
        persist(reply).await.map_err(GatewayError::Persistence)
    }

    async fn round_trip<T, D>(&self, route: &Route, body: Vec<u8>, decode: D) -> Result<T>
    where
        T: Send + 'static,
        D: FnOnce(Vec<u8>) -> Result<T> + Send + 'static,
    {
        let correlation_id = Uuid::new_v4().to_string();
        let binding = Binding {
            exchange: route.exchange.clone(),
            exchange_type: route.exchange_type.clone(),
            queue: format!("{}{}", REPLY_QUEUE_PREFIX, Uuid::new_v4()),
            routing_key: route.reply_key.clone(),
            consumer_tag: Uuid::new_v4().to_string(),
        };

        let (listener, deliveries) = ReplyListener::open(self.broker.as_ref(), &binding)
            .await
            .map_err(|e| {
                warn!(exchange = %route.exchange, error = %e, "Failed to open reply listener");
                GatewayError::Transport(e)
            })?;

        let outcome = self
            .publish_and_wait(route, body, &correlation_id, deliveries, decode)
            .await;

        listener.close().await;

        match &outcome {
            Ok(_) => debug!(correlation_id = %correlation_id, "Round trip complete"),
            Err(e) => warn!(
                correlation_id = %correlation_id,
                exchange = %route.exchange,
                error = %e,
                "Round trip failed"
            ),
        }
        outcome
    }

    async fn publish_and_wait<T, D>(
        &self,
        route: &Route,
        body: Vec<u8>,
        correlation_id: &str,
        deliveries: DeliveryStream,
        decode: D,
    ) -> Result<T>
    where
        T: Send + 'static,
        D: FnOnce(Vec<u8>) -> Result<T> + Send + 'static,
    {
        let message = OutboundMessage {
            exchange: route.exchange.clone(),
            exchange_type: route.exchange_type.clone(),
            routing_key: route.request_key.clone(),
            body,
            correlation_id: Some(correlation_id.to_string()),
            reply_to: Some(route.reply_key.clone()),
        };
        self.broker
            .send(message)
            .await
            .map_err(GatewayError::Publish)?;

        debug!(
            correlation_id = %correlation_id,
            exchange = %route.exchange,
            routing_key = %route.request_key,
            "Published request"
        );

        let cancel = CancellationToken::new();
        // Stops the waiter if this future is dropped mid-wait.
        let _stop_waiter = cancel.clone().drop_guard();
        let mut waiter = tokio::spawn(wait_for_reply(
            deliveries,
            correlation_id.to_string(),
            decode,
            cancel.clone(),
        ));

        match tokio::time::timeout(self.timeout, &mut waiter).await {
            Ok(Ok(Some(outcome))) => outcome,
            Ok(Ok(None)) => Err(GatewayError::Transport(BusError::Subscribe(
                "Reply wait cancelled".to_string(),
            ))),
            Ok(Err(e)) => Err(GatewayError::Transport(BusError::Subscribe(format!(
                "Reply wait aborted: {}",
                e
            )))),
            Err(_) => {
                cancel.cancel();
                // Nothing from this round trip may run after it returns.
                let _ = waiter.await;
                Err(GatewayError::Timeout(self.timeout))
            }
        }
    }
}

/// Wait for the correlated reply and decode it. `None` means cancelled.
async fn wait_for_reply<T, D>(
    mut deliveries: DeliveryStream,
    correlation_id: String,
    decode: D,
    cancel: CancellationToken,
) -> Option<Result<T>>
where
    D: FnOnce(Vec<u8>) -> Result<T>,
{
    let matched = tokio::select! {
        biased;
        _ = cancel.cancelled() => return None,
        matched = listener::next_correlated(&mut deliveries, &correlation_id) => matched,
    };

    Some(match matched {
        Ok(delivery) => decode(delivery.body),
        Err(e) => Err(GatewayError::Transport(e)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBroker;
    use crate::storage::{MockRecordStore, PoolRecord, RecordStore};
    use crate::test_utils::{reply_for, reply_queue_count, spawn_responder};
    use serde_json::{json, Value};

    fn route() -> Route {
        Route::new("voyager-ipam-service")
    }

    fn gateway(broker: &MemoryBroker) -> Gateway {
        Gateway::new(Arc::new(broker.clone()))
    }

    #[tokio::test]
    async fn test_request_raw_returns_reply_body() {
        let broker = MemoryBroker::recording();
        spawn_responder(&broker, &route(), |request| {
            vec![reply_for(request, r#"{"ok":true}"#)]
        })
        .await
        .unwrap();

        let reply = gateway(&broker)
            .request_raw(&route(), b"{}".to_vec())
            .await
            .unwrap();

        assert_eq!(reply, br#"{"ok":true}"#);
        assert_eq!(reply_queue_count(&broker).await, 0);
    }

    #[tokio::test]
    async fn test_request_is_stamped_with_correlation_and_reply_to() {
        let broker = MemoryBroker::recording();
        spawn_responder(&broker, &route(), |request| vec![reply_for(request, "{}")])
            .await
            .unwrap();

        let _: Value = gateway(&broker)
            .request(&route(), &json!({"name": "default"}))
            .await
            .unwrap();

        let published = broker.published().await;
        let request = &published[0];
        assert_eq!(request.routing_key, "requests");
        assert_eq!(request.reply_to.as_deref(), Some("replies"));
        let correlation_id = request.correlation_id.clone().unwrap();
        assert!(Uuid::parse_str(&correlation_id).is_ok());
        assert_eq!(published[1].correlation_id, Some(correlation_id));
    }

    #[tokio::test]
    async fn test_foreign_replies_are_ignored() {
        let broker = MemoryBroker::recording();
        spawn_responder(&broker, &route(), |request| {
            let mut decoy = reply_for(request, r#"{"who":"decoy"}"#);
            decoy.correlation_id = Some("someone-else".to_string());
            let mut untagged = reply_for(request, r#"{"who":"untagged"}"#);
            untagged.correlation_id = None;
            vec![decoy, untagged, reply_for(request, r#"{"who":"me"}"#)]
        })
        .await
        .unwrap();

        let reply: Value = gateway(&broker).request(&route(), &json!({})).await.unwrap();

        assert_eq!(reply["who"], "me");
        // Only the matching reply is acknowledged by the gateway; the responder acks its request.
        assert_eq!(broker.acked_count().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_when_no_reply() {
        let broker = MemoryBroker::recording();
        spawn_responder(&broker, &route(), |_| Vec::new())
            .await
            .unwrap();

        let started = tokio::time::Instant::now();
        let result = gateway(&broker).request_raw(&route(), b"{}".to_vec()).await;

        assert!(matches!(result, Err(GatewayError::Timeout(d)) if d == DEFAULT_TIMEOUT));
        assert!(started.elapsed() >= DEFAULT_TIMEOUT);
        assert!(started.elapsed() < DEFAULT_TIMEOUT + Duration::from_millis(100));
        assert_eq!(reply_queue_count(&broker).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configured_timeout_is_used() {
        let broker = MemoryBroker::recording();
        let gateway = gateway(&broker).with_timeout(Duration::from_millis(250));

        let started = tokio::time::Instant::now();
        let result = gateway.request_raw(&route(), b"{}".to_vec()).await;

        assert!(result.unwrap_err().is_timeout());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_decode_failure_cleans_up() {
        let broker = MemoryBroker::recording();
        spawn_responder(&broker, &route(), |request| vec![reply_for(request, "not json")])
            .await
            .unwrap();

        let result: Result<Value> = gateway(&broker).request(&route(), &json!({})).await;

        assert!(matches!(result, Err(GatewayError::Decode(_))));
        assert_eq!(reply_queue_count(&broker).await, 0);
    }

    #[tokio::test]
    async fn test_publish_failure_cleans_up() {
        let broker = MemoryBroker::recording();
        broker.set_fail_on_send(true).await;

        let result = gateway(&broker).request_raw(&route(), b"{}".to_vec()).await;

        assert!(matches!(result, Err(GatewayError::Publish(_))));
        assert_eq!(reply_queue_count(&broker).await, 0);
    }

    #[tokio::test]
    async fn test_listen_failure_publishes_nothing() {
        let broker = MemoryBroker::recording();
        broker.set_fail_on_listen(true).await;

        let result = gateway(&broker).request_raw(&route(), b"{}".to_vec()).await;

        assert!(matches!(result, Err(GatewayError::Transport(_))));
        assert!(broker.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_teardown_failure_does_not_fail_round_trip() {
        let broker = MemoryBroker::recording();
        spawn_responder(&broker, &route(), |request| vec![reply_for(request, "{}")])
            .await
            .unwrap();
        broker.set_fail_on_close(true).await;

        let result = gateway(&broker).request_raw(&route(), b"{}".to_vec()).await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_persist_runs_after_reply() {
        let broker = MemoryBroker::recording();
        spawn_responder(&broker, &route(), |request| {
            vec![reply_for(request, r#"{"id":"P1","name":"default"}"#)]
        })
        .await
        .unwrap();
        let store = MockRecordStore::new();
        store.init_schema().await.unwrap();
        let records = &store;

        let id = gateway(&broker)
            .request_and_persist(&route(), &json!({}), |reply: Value| async move {
                let record = PoolRecord {
                    id: reply["id"].as_str().unwrap_or_default().to_string(),
                    name: reply["name"].as_str().unwrap_or_default().to_string(),
                };
                records.insert_pool(&record).await?;
                Ok::<_, StorageError>(record.id)
            })
            .await
            .unwrap();

        assert_eq!(id, "P1");
        assert_eq!(store.list_pools().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_persist_failure_is_reported() {
        let broker = MemoryBroker::recording();
        spawn_responder(&broker, &route(), |request| vec![reply_for(request, "{}")])
            .await
            .unwrap();
        let store = MockRecordStore::new();
        store.init_schema().await.unwrap();
        store.set_fail_on_insert(true).await;
        let records = &store;

        let result = gateway(&broker)
            .request_and_persist(&route(), &json!({}), |_: Value| async move {
                records
                    .insert_pool(&PoolRecord {
                        id: "P1".to_string(),
                        name: "default".to_string(),
                    })
                    .await
            })
            .await;

        assert!(matches!(result, Err(GatewayError::Persistence(_))));
        assert_eq!(reply_queue_count(&broker).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_round_trip_still_cleans_up() {
        let broker = MemoryBroker::recording();
        let gateway = gateway(&broker);

        let round_trip =
            tokio::spawn(async move { gateway.request_raw(&route(), b"{}".to_vec()).await });
        while broker.published().await.is_empty() {
            tokio::task::yield_now().await;
        }
        round_trip.abort();
        let _ = round_trip.await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(reply_queue_count(&broker).await, 0);
    }
}
