//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building.

use sea_query::Iden;

/// Pools table schema.
///
/// Table name follows the upstream IPAM service's entity naming so both sides
/// can share a database during migration.
#[derive(Iden)]
pub enum PoolEntities {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "name"]
    Name,
}

/// Subnets table schema.
#[derive(Iden)]
pub enum SubnetEntities {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "name"]
    Name,
    #[iden = "pool_id"]
    PoolId,
}

/// Name of the pools table, used by the table-existence check.
pub const POOLS_TABLE: &str = "pool_entities";

/// SQL to create the pools table. Pool names are unique.
pub const CREATE_POOLS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS pool_entities (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE
)
"#;

/// SQL to create the subnets table.
pub const CREATE_SUBNETS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS subnet_entities (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    pool_id TEXT NOT NULL REFERENCES pool_entities(id)
)
"#;

/// SQL to create the subnet lookup index.
pub const CREATE_SUBNETS_POOL_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_subnet_entities_pool_id ON subnet_entities(pool_id)
"#;
