//! Shared handles passed to every component that talks to the broker or the store.

use std::sync::Arc;

use crate::bus::Broker;
use crate::config::Config;
use crate::gateway::Gateway;
use crate::inventory::InventoryClient;
use crate::ipam::{IpamBootstrap, IpamClient, IpamDefaults};
use crate::storage::RecordStore;

/// Service-wide state.
///
/// Built once at startup and cloned into handlers. Tests build one per case
/// around a `MemoryBroker` and `MockRecordStore`.
#[derive(Clone)]
pub struct ServiceContext {
    pub broker: Arc<dyn Broker>,
    pub store: Arc<dyn RecordStore>,
    pub gateway: Gateway,
    pub ipam: IpamClient,
    pub inventory: InventoryClient,
    ipam_defaults: IpamDefaults,
}

impl ServiceContext {
    pub fn new(broker: Arc<dyn Broker>, store: Arc<dyn RecordStore>, config: &Config) -> Self {
        let gateway = Gateway::new(Arc::clone(&broker)).with_timeout(config.gateway.timeout());
        let ipam = IpamClient::new(
            gateway.clone(),
            Arc::clone(&store),
            config.ipam.route.clone(),
        );
        let inventory = InventoryClient::new(gateway.clone(), config.inventory.route.clone());

        Self {
            broker,
            store,
            gateway,
            ipam,
            inventory,
            ipam_defaults: config.ipam.defaults.clone(),
        }
    }

    pub fn ipam_bootstrap(&self) -> IpamBootstrap {
        IpamBootstrap::new(
            self.ipam.clone(),
            Arc::clone(&self.store),
            self.ipam_defaults.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBroker;
    use crate::ipam::IpamStatus;
    use crate::storage::MockRecordStore;
    use std::time::Duration;

    #[tokio::test]
    async fn test_context_wires_config() {
        let mut config = Config::default();
        config.gateway.timeout_ms = 1500;
        config.inventory.route.exchange = "inventory-test".to_string();

        let ctx = ServiceContext::new(
            Arc::new(MemoryBroker::recording()),
            Arc::new(MockRecordStore::new()),
            &config,
        );

        assert_eq!(ctx.gateway.timeout(), Duration::from_millis(1500));
        assert_eq!(ctx.inventory.route().exchange, "inventory-test");
        assert_eq!(ctx.ipam.route().exchange, "voyager-ipam-service");
        assert_eq!(
            ctx.ipam_bootstrap().status().await.unwrap(),
            IpamStatus::Uninitialized
        );
    }
}
