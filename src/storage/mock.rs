//! In-memory record store for tests and the `memory` storage type.

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{PoolRecord, RecordStore, Result, StorageError, SubnetRecord};

#[derive(Default)]
struct Tables {
    /// False until `init_schema`, mirroring a database without our tables.
    created: bool,
    pools: Vec<PoolRecord>,
    subnets: Vec<SubnetRecord>,
}

/// Mock record store that keeps records in memory.
///
/// Enforces the same constraints as the SQL schema: unique ids, unique pool
/// names, and subnets must reference an existing pool.
#[derive(Default)]
pub struct MockRecordStore {
    tables: RwLock<Tables>,
    fail_on_insert: RwLock<bool>,
    fail_on_read: RwLock<bool>,
}

impl MockRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_insert(&self, fail: bool) {
        *self.fail_on_insert.write().await = fail;
    }

    pub async fn set_fail_on_read(&self, fail: bool) {
        *self.fail_on_read.write().await = fail;
    }

    async fn check_read(&self) -> Result<()> {
        if *self.fail_on_read.read().await {
            return Err(StorageError::Database("Mock read failure".to_string()));
        }
        Ok(())
    }

    async fn check_insert(&self) -> Result<()> {
        if *self.fail_on_insert.read().await {
            return Err(StorageError::Database("Mock insert failure".to_string()));
        }
        Ok(())
    }
}

fn missing_table(table: &str) -> StorageError {
    StorageError::Database(format!("no such table: {}", table))
}

#[async_trait]
impl RecordStore for MockRecordStore {
    async fn init_schema(&self) -> Result<()> {
        self.tables.write().await.created = true;
        Ok(())
    }

    async fn has_pool_table(&self) -> Result<bool> {
        self.check_read().await?;
        Ok(self.tables.read().await.created)
    }

    async fn find_pools_by_name(&self, name: &str) -> Result<Vec<PoolRecord>> {
        self.check_read().await?;
        let tables = self.tables.read().await;
        if !tables.created {
            return Err(missing_table("pool_entities"));
        }
        Ok(tables
            .pools
            .iter()
            .filter(|p| p.name == name)
            .cloned()
            .collect())
    }

    async fn insert_pool(&self, pool: &PoolRecord) -> Result<()> {
        self.check_insert().await?;
        let mut tables = self.tables.write().await;
        if !tables.created {
            return Err(missing_table("pool_entities"));
        }
        if tables
            .pools
            .iter()
            .any(|p| p.id == pool.id || p.name == pool.name)
        {
            return Err(StorageError::Database(format!(
                "UNIQUE constraint failed for pool '{}'",
                pool.id
            )));
        }
        tables.pools.push(pool.clone());
        Ok(())
    }

    async fn insert_subnet(&self, subnet: &SubnetRecord) -> Result<()> {
        self.check_insert().await?;
        let mut tables = self.tables.write().await;
        if !tables.created {
            return Err(missing_table("subnet_entities"));
        }
        if tables.subnets.iter().any(|s| s.id == subnet.id) {
            return Err(StorageError::Database(format!(
                "UNIQUE constraint failed for subnet '{}'",
                subnet.id
            )));
        }
        if !tables.pools.iter().any(|p| p.id == subnet.pool_id) {
            return Err(StorageError::Database(format!(
                "FOREIGN KEY constraint failed: pool '{}'",
                subnet.pool_id
            )));
        }
        tables.subnets.push(subnet.clone());
        Ok(())
    }

    async fn list_pools(&self) -> Result<Vec<PoolRecord>> {
        self.check_read().await?;
        Ok(self.tables.read().await.pools.clone())
    }

    async fn list_subnets(&self) -> Result<Vec<SubnetRecord>> {
        self.check_read().await?;
        Ok(self.tables.read().await.subnets.clone())
    }

    async fn find_subnets_by_pool(&self, pool_id: &str) -> Result<Vec<SubnetRecord>> {
        self.check_read().await?;
        Ok(self
            .tables
            .read()
            .await
            .subnets
            .iter()
            .filter(|s| s.pool_id == pool_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(id: &str, name: &str) -> PoolRecord {
        PoolRecord {
            id: id.to_string(),
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn test_tables_missing_until_init() {
        let store = MockRecordStore::new();
        assert!(!store.has_pool_table().await.unwrap());
        assert!(store.find_pools_by_name("default").await.is_err());

        store.init_schema().await.unwrap();
        assert!(store.has_pool_table().await.unwrap());
        assert!(store.find_pools_by_name("default").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pool_name_is_unique() {
        let store = MockRecordStore::new();
        store.init_schema().await.unwrap();
        store.insert_pool(&pool("P1", "default")).await.unwrap();

        assert!(store.insert_pool(&pool("P2", "default")).await.is_err());
    }

    #[tokio::test]
    async fn test_subnet_requires_pool() {
        let store = MockRecordStore::new();
        store.init_schema().await.unwrap();
        let subnet = SubnetRecord {
            id: "S1".to_string(),
            name: "default".to_string(),
            pool_id: "P1".to_string(),
        };

        assert!(store.insert_subnet(&subnet).await.is_err());
        store.insert_pool(&pool("P1", "default")).await.unwrap();
        store.insert_subnet(&subnet).await.unwrap();
        assert_eq!(store.find_subnets_by_pool("P1").await.unwrap(), vec![subnet]);
    }

    #[tokio::test]
    async fn test_fail_on_insert() {
        let store = MockRecordStore::new();
        store.init_schema().await.unwrap();
        store.set_fail_on_insert(true).await;

        assert!(store.insert_pool(&pool("P1", "default")).await.is_err());
        assert!(store.list_pools().await.unwrap().is_empty());
    }
}
