//! Persistence of IPAM records created through the gateway.
//!
//! This module contains:
//! - `RecordStore` trait: pool/subnet persistence and the lookups the
//!   bootstrap idempotency check needs
//! - Record types and `StorageError`
//! - Implementations: SQLite, PostgreSQL, Mock

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{error, info};

pub mod mock;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(any(feature = "sqlite", feature = "postgres"))]
pub mod schema;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use mock::MockRecordStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresRecordStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteRecordStore;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors from storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("unsupported storage type '{0}'")]
    Unsupported(String),
}

#[cfg(any(feature = "sqlite", feature = "postgres"))]
impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::Database(err.to_string())
    }
}

/// A pool created in IPAM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolRecord {
    /// Identifier assigned by the IPAM service.
    pub id: String,
    pub name: String,
}

/// A subnet created in IPAM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetRecord {
    /// Identifier assigned by the IPAM service.
    pub id: String,
    pub name: String,
    /// Identifier of the owning pool.
    pub pool_id: String,
}

/// Durable store for records of resources created upstream.
///
/// Records are written once, after a successful reply, and never updated.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Create tables and indexes if they don't exist.
    async fn init_schema(&self) -> Result<()>;

    /// Whether the pools table exists.
    async fn has_pool_table(&self) -> Result<bool>;

    async fn find_pools_by_name(&self, name: &str) -> Result<Vec<PoolRecord>>;

    async fn insert_pool(&self, pool: &PoolRecord) -> Result<()>;

    async fn insert_subnet(&self, subnet: &SubnetRecord) -> Result<()>;

    async fn list_pools(&self) -> Result<Vec<PoolRecord>>;

    async fn list_subnets(&self) -> Result<Vec<SubnetRecord>>;

    async fn find_subnets_by_pool(&self, pool_id: &str) -> Result<Vec<SubnetRecord>>;
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage type (sqlite, postgres, memory).
    #[serde(rename = "type")]
    pub storage_type: String,
    /// Database file path (sqlite) or connection URL (postgres).
    pub address: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: "sqlite".to_string(),
            address: "./data/houston.db".to_string(),
        }
    }
}

/// Open the configured store and create its schema.
pub async fn init_storage(config: &StorageConfig) -> Result<Arc<dyn RecordStore>> {
    info!(
        storage_type = %config.storage_type,
        address = %config.address,
        "Opening record store"
    );

    match config.storage_type.as_str() {
        #[cfg(feature = "sqlite")]
        "sqlite" => {
            if let Some(parent) = std::path::Path::new(&config.address).parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::Connection(e.to_string()))?;
            }

            let options = sqlx::sqlite::SqliteConnectOptions::new()
                .filename(&config.address)
                .create_if_missing(true)
                .foreign_keys(true);
            let pool = sqlx::SqlitePool::connect_with(options)
                .await
                .map_err(|e| StorageError::Connection(e.to_string()))?;

            let store = SqliteRecordStore::new(pool);
            store.init_schema().await?;
            Ok(Arc::new(store))
        }
        #[cfg(feature = "postgres")]
        "postgres" => {
            let pool = sqlx::PgPool::connect(&config.address)
                .await
                .map_err(|e| StorageError::Connection(e.to_string()))?;

            let store = PostgresRecordStore::new(pool);
            store.init_schema().await?;
            Ok(Arc::new(store))
        }
        "memory" => {
            let store = MockRecordStore::new();
            store.init_schema().await?;
            Ok(Arc::new(store))
        }
        other => {
            error!(storage_type = %other, "Unknown or disabled storage type");
            Err(StorageError::Unsupported(other.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_memory_storage() {
        let config = StorageConfig {
            storage_type: "memory".to_string(),
            address: String::new(),
        };
        let store = init_storage(&config).await.unwrap();
        assert!(store.has_pool_table().await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_storage_type() {
        let config = StorageConfig {
            storage_type: "mysql".to_string(),
            address: String::new(),
        };
        let result = init_storage(&config).await;
        assert!(matches!(result, Err(StorageError::Unsupported(t)) if t == "mysql"));
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn test_init_sqlite_storage_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("houston.db");
        let config = StorageConfig {
            storage_type: "sqlite".to_string(),
            address: path.to_string_lossy().to_string(),
        };

        let store = init_storage(&config).await.unwrap();

        assert!(path.exists());
        assert!(store.has_pool_table().await.unwrap());
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn test_sqlite_store_enforces_pool_reference() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            storage_type: "sqlite".to_string(),
            address: dir.path().join("houston.db").to_string_lossy().to_string(),
        };
        let store = init_storage(&config).await.unwrap();

        let orphan = SubnetRecord {
            id: "S1".to_string(),
            name: "default".to_string(),
            pool_id: "missing".to_string(),
        };

        assert!(store.insert_subnet(&orphan).await.is_err());
        assert!(store.list_subnets().await.unwrap().is_empty());
    }
}
