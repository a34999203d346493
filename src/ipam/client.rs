//! IPAM client: create resources upstream and record them locally.

use std::sync::Arc;

use tracing::info;

use super::messages::{IpamReply, IpamRequest};
use crate::gateway::{Gateway, GatewayError, Route};
use crate::storage::{PoolRecord, RecordStore, StorageError, SubnetRecord};

/// Creates pools and subnets in the IPAM service.
///
/// Each call is one gateway round trip followed by a single insert of the
/// record the reply describes.
#[derive(Clone)]
pub struct IpamClient {
    gateway: Gateway,
    store: Arc<dyn RecordStore>,
    route: Route,
}

impl IpamClient {
    pub fn new(gateway: Gateway, store: Arc<dyn RecordStore>, route: Route) -> Self {
        Self {
            gateway,
            store,
            route,
        }
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    /// Create a pool named `name`.
    ///
    /// The record keeps the requested name whatever the reply echoes, since
    /// the bootstrap looks the pool up by that name.
    pub async fn create_pool(&self, name: &str, metadata: &str) -> Result<PoolRecord, GatewayError> {
        let request = IpamRequest::create_pool(name, metadata);
        let store = Arc::clone(&self.store);
        let requested_name = name.to_string();

        let pool = self
            .gateway
            .request_and_persist(&self.route, &request, |reply: IpamReply| async move {
                let record = PoolRecord {
                    id: reply.id,
                    name: requested_name,
                };
                store.insert_pool(&record).await?;
                Ok::<_, StorageError>(record)
            })
            .await?;

        info!(pool_id = %pool.id, name = %pool.name, "Created pool");
        Ok(pool)
    }

    /// Create a subnet inside `pool_id`.
    ///
    /// The stored pool reference is the one echoed in the reply, falling back
    /// to the requested pool when the reply omits it. The name is always the
    /// requested one.
    pub async fn create_subnet(
        &self,
        name: &str,
        pool_id: &str,
        start: &str,
        end: &str,
    ) -> Result<SubnetRecord, GatewayError> {
        let request = IpamRequest::create_subnet(name, pool_id, start, end);
        let store = Arc::clone(&self.store);
        let requested_name = name.to_string();
        let requested_pool = pool_id.to_string();

        let subnet = self
            .gateway
            .request_and_persist(&self.route, &request, |reply: IpamReply| async move {
                let record = SubnetRecord {
                    id: reply.id,
                    name: requested_name,
                    pool_id: reply.pool.unwrap_or(requested_pool),
                };
                store.insert_subnet(&record).await?;
                Ok::<_, StorageError>(record)
            })
            .await?;

        info!(
            subnet_id = %subnet.id,
            pool_id = %subnet.pool_id,
            "Created subnet"
        );
        Ok(subnet)
    }
}
