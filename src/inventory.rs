//! Inventory service queries.
//!
//! Replies are passed through to the caller untouched; nothing is persisted.

use serde::Serialize;

use crate::bus::BusError;
use crate::gateway::{Gateway, GatewayError, Route};

/// Exchange the inventory service listens on.
pub const INVENTORY_EXCHANGE: &str = "voyager-inventory-service";

/// Command envelope understood by the inventory service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InventoryCommand {
    pub command: String,
    pub options: String,
}

impl InventoryCommand {
    pub fn get_nodes() -> Self {
        Self {
            command: "get_nodes".to_string(),
            options: String::new(),
        }
    }
}

#[derive(Clone)]
pub struct InventoryClient {
    gateway: Gateway,
    route: Route,
}

impl InventoryClient {
    pub fn new(gateway: Gateway, route: Route) -> Self {
        Self { gateway, route }
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    /// Ask for every known node. Returns the raw reply body.
    pub async fn get_nodes(&self) -> Result<Vec<u8>, GatewayError> {
        let body = serde_json::to_vec(&InventoryCommand::get_nodes())
            .map_err(|e| GatewayError::Publish(BusError::Publish(e.to_string())))?;
        self.gateway.request_raw(&self.route, body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBroker;
    use crate::test_utils::{reply_for, spawn_responder};
    use std::sync::Arc;

    #[test]
    fn test_get_nodes_wire_literal() {
        let body = serde_json::to_string(&InventoryCommand::get_nodes()).unwrap();
        assert_eq!(body, r#"{"command":"get_nodes","options":""}"#);
    }

    #[tokio::test]
    async fn test_get_nodes_returns_reply_verbatim() {
        let broker = MemoryBroker::recording();
        let client = InventoryClient::new(
            Gateway::new(Arc::new(broker.clone())),
            Route::new(INVENTORY_EXCHANGE),
        );
        spawn_responder(&broker, client.route(), |request| {
            vec![reply_for(request, "[ {\"id\": 1} ]")]
        })
        .await
        .unwrap();

        let nodes = client.get_nodes().await.unwrap();

        assert_eq!(nodes, b"[ {\"id\": 1} ]");
        assert_eq!(
            broker.published().await[0].body,
            br#"{"command":"get_nodes","options":""}"#
        );
    }
}
