//! Idempotent IPAM bootstrap.
//!
//! Ensures one default pool holding one default subnet exists. Safe to run on
//! every start: once the default pool is recorded, the run is a no-op.

use std::sync::Arc;

use tracing::info;

use super::client::IpamClient;
use super::IpamDefaults;
use crate::gateway::GatewayError;
use crate::storage::{PoolRecord, RecordStore, StorageError, SubnetRecord};

/// Whether the default hierarchy has been created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpamStatus {
    Uninitialized,
    Initialized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapOutcome {
    Created {
        pool: PoolRecord,
        subnet: SubnetRecord,
    },
    AlreadyInitialized,
}

/// Bootstrap failures. All of them are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("could not determine IPAM status: {0}")]
    Status(#[from] StorageError),

    #[error("failed to create default pool: {0}")]
    Pool(#[source] GatewayError),

    #[error("failed to create default subnet: {0}")]
    Subnet(#[source] GatewayError),
}

pub struct IpamBootstrap {
    client: IpamClient,
    store: Arc<dyn RecordStore>,
    defaults: IpamDefaults,
}

impl IpamBootstrap {
    pub fn new(client: IpamClient, store: Arc<dyn RecordStore>, defaults: IpamDefaults) -> Self {
        Self {
            client,
            store,
            defaults,
        }
    }

    /// A missing table and a table without the default pool both mean
    /// uninitialized.
    pub async fn status(&self) -> Result<IpamStatus, BootstrapError> {
        if !self.store.has_pool_table().await? {
            return Ok(IpamStatus::Uninitialized);
        }

        let pools = self
            .store
            .find_pools_by_name(&self.defaults.pool_name)
            .await?;
        if pools.is_empty() {
            Ok(IpamStatus::Uninitialized)
        } else {
            Ok(IpamStatus::Initialized)
        }
    }

    /// Create the default pool, then the default subnet inside it.
    pub async fn run(&self) -> Result<BootstrapOutcome, BootstrapError> {
        if self.status().await? == IpamStatus::Initialized {
            info!(pool = %self.defaults.pool_name, "IPAM is already initialized");
            return Ok(BootstrapOutcome::AlreadyInitialized);
        }

        let defaults = &self.defaults;
        let pool = self
            .client
            .create_pool(&defaults.pool_name, &defaults.pool_metadata)
            .await
            .map_err(BootstrapError::Pool)?;
        info!(pool_id = %pool.id, "Initialized IPAM with pool");

        let subnet = self
            .client
            .create_subnet(
                &defaults.pool_name,
                &pool.id,
                &defaults.subnet_start,
                &defaults.subnet_end,
            )
            .await
            .map_err(BootstrapError::Subnet)?;
        info!(subnet_id = %subnet.id, "Initialized IPAM with subnet");

        Ok(BootstrapOutcome::Created { pool, subnet })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBroker;
    use crate::gateway::{Gateway, Route};
    use crate::ipam::messages::{IpamRequest, ObjectType};
    use crate::storage::MockRecordStore;
    use crate::test_utils::{reply_for, spawn_responder};
    use std::time::Duration;

    fn bootstrap(broker: &MemoryBroker, store: Arc<MockRecordStore>) -> IpamBootstrap {
        let client = IpamClient::new(
            Gateway::new(Arc::new(broker.clone())).with_timeout(Duration::from_millis(200)),
            store.clone(),
            Route::new("voyager-ipam-service"),
        );
        IpamBootstrap::new(client, store, IpamDefaults::default())
    }

    async fn spawn_ipam(broker: &MemoryBroker) {
        spawn_responder(broker, &Route::new("voyager-ipam-service"), |request| {
            let sent: IpamRequest = serde_json::from_slice(&request.body).unwrap();
            let reply = match sent.object_type {
                ObjectType::Pool => format!(r#"{{"id":"P1","name":"{}"}}"#, sent.name),
                _ => format!(
                    r#"{{"id":"S1","name":"{}","pool":"{}"}}"#,
                    sent.name,
                    sent.pool.unwrap_or_default()
                ),
            };
            vec![reply_for(request, reply)]
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_missing_table_is_uninitialized() {
        let broker = MemoryBroker::recording();
        let store = Arc::new(MockRecordStore::new());

        let status = bootstrap(&broker, store).status().await.unwrap();
        assert_eq!(status, IpamStatus::Uninitialized);
    }

    #[tokio::test]
    async fn test_empty_table_is_uninitialized() {
        let broker = MemoryBroker::recording();
        let store = Arc::new(MockRecordStore::new());
        store.init_schema().await.unwrap();

        let status = bootstrap(&broker, store).status().await.unwrap();
        assert_eq!(status, IpamStatus::Uninitialized);
    }

    #[tokio::test]
    async fn test_status_read_failure_is_reported() {
        let broker = MemoryBroker::recording();
        let store = Arc::new(MockRecordStore::new());
        store.set_fail_on_read(true).await;

        let result = bootstrap(&broker, store).status().await;
        assert!(matches!(result, Err(BootstrapError::Status(_))));
    }

    #[tokio::test]
    async fn test_run_creates_pool_then_subnet() {
        let broker = MemoryBroker::recording();
        let store = Arc::new(MockRecordStore::new());
        store.init_schema().await.unwrap();
        spawn_ipam(&broker).await;

        let outcome = bootstrap(&broker, store.clone()).run().await.unwrap();

        let (pool, subnet) = match outcome {
            BootstrapOutcome::Created { pool, subnet } => (pool, subnet),
            other => panic!("expected Created, got {:?}", other),
        };
        assert_eq!(pool.id, "P1");
        assert_eq!(subnet.pool_id, "P1");
        assert_eq!(store.list_subnets().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_second_run_is_a_no_op() {
        let broker = MemoryBroker::recording();
        let store = Arc::new(MockRecordStore::new());
        store.init_schema().await.unwrap();
        spawn_ipam(&broker).await;
        let bootstrap = bootstrap(&broker, store.clone());

        bootstrap.run().await.unwrap();
        let published = broker.published().await.len();
        let second = bootstrap.run().await.unwrap();

        assert_eq!(second, BootstrapOutcome::AlreadyInitialized);
        assert_eq!(broker.published().await.len(), published);
        assert_eq!(store.list_pools().await.unwrap().len(), 1);
        assert_eq!(store.list_subnets().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pool_failure_aborts_before_subnet() {
        let broker = MemoryBroker::recording();
        let store = Arc::new(MockRecordStore::new());
        store.init_schema().await.unwrap();

        let result = bootstrap(&broker, store.clone()).run().await;

        assert!(matches!(result, Err(BootstrapError::Pool(ref e)) if e.is_timeout()));
        assert_eq!(broker.published().await.len(), 1);
        assert!(store.list_subnets().await.unwrap().is_empty());
    }
}
