//! PostgreSQL implementation of RecordStore.

use async_trait::async_trait;
use sea_query::{Alias, Expr, Order, PostgresQueryBuilder, Query};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use super::schema::{
    PoolEntities, SubnetEntities, CREATE_POOLS_TABLE, CREATE_SUBNETS_POOL_INDEX,
    CREATE_SUBNETS_TABLE, POOLS_TABLE,
};
use super::{PoolRecord, RecordStore, Result, SubnetRecord};

/// PostgreSQL-backed record store.
pub struct PostgresRecordStore {
    pool: PgPool,
}

impl PostgresRecordStore {
    /// Create a new PostgreSQL record store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_pools(&self, query: String) -> Result<Vec<PoolRecord>> {
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(pool_from_row).collect())
    }

    async fn fetch_subnets(&self, query: String) -> Result<Vec<SubnetRecord>> {
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(subnet_from_row).collect())
    }
}

fn pool_from_row(row: &PgRow) -> PoolRecord {
    PoolRecord {
        id: row.get("id"),
        name: row.get("name"),
    }
}

fn subnet_from_row(row: &PgRow) -> SubnetRecord {
    SubnetRecord {
        id: row.get("id"),
        name: row.get("name"),
        pool_id: row.get("pool_id"),
    }
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    async fn init_schema(&self) -> Result<()> {
        sqlx::query(CREATE_POOLS_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_SUBNETS_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_SUBNETS_POOL_INDEX)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn has_pool_table(&self) -> Result<bool> {
        let query = Query::select()
            .column(Alias::new("table_name"))
            .from((Alias::new("information_schema"), Alias::new("tables")))
            .and_where(Expr::col(Alias::new("table_schema")).eq("public"))
            .and_where(Expr::col(Alias::new("table_name")).eq(POOLS_TABLE))
            .to_string(PostgresQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        Ok(row.is_some())
    }

    async fn find_pools_by_name(&self, name: &str) -> Result<Vec<PoolRecord>> {
        let query = Query::select()
            .columns([PoolEntities::Id, PoolEntities::Name])
            .from(PoolEntities::Table)
            .and_where(Expr::col(PoolEntities::Name).eq(name))
            .to_string(PostgresQueryBuilder);

        self.fetch_pools(query).await
    }

    async fn insert_pool(&self, pool: &PoolRecord) -> Result<()> {
        let query = Query::insert()
            .into_table(PoolEntities::Table)
            .columns([PoolEntities::Id, PoolEntities::Name])
            .values_panic([pool.id.as_str().into(), pool.name.as_str().into()])
            .to_string(PostgresQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_subnet(&self, subnet: &SubnetRecord) -> Result<()> {
        let query = Query::insert()
            .into_table(SubnetEntities::Table)
            .columns([
                SubnetEntities::Id,
                SubnetEntities::Name,
                SubnetEntities::PoolId,
            ])
            .values_panic([
                subnet.id.as_str().into(),
                subnet.name.as_str().into(),
                subnet.pool_id.as_str().into(),
            ])
            .to_string(PostgresQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    async fn list_pools(&self) -> Result<Vec<PoolRecord>> {
        let query = Query::select()
            .columns([PoolEntities::Id, PoolEntities::Name])
            .from(PoolEntities::Table)
            .order_by(PoolEntities::Id, Order::Asc)
            .to_string(PostgresQueryBuilder);

        self.fetch_pools(query).await
    }

    async fn list_subnets(&self) -> Result<Vec<SubnetRecord>> {
        let query = Query::select()
            .columns([
                SubnetEntities::Id,
                SubnetEntities::Name,
                SubnetEntities::PoolId,
            ])
            .from(SubnetEntities::Table)
            .order_by(SubnetEntities::Id, Order::Asc)
            .to_string(PostgresQueryBuilder);

        self.fetch_subnets(query).await
    }

    async fn find_subnets_by_pool(&self, pool_id: &str) -> Result<Vec<SubnetRecord>> {
        let query = Query::select()
            .columns([
                SubnetEntities::Id,
                SubnetEntities::Name,
                SubnetEntities::PoolId,
            ])
            .from(SubnetEntities::Table)
            .and_where(Expr::col(SubnetEntities::PoolId).eq(pool_id))
            .order_by(SubnetEntities::Id, Order::Asc)
            .to_string(PostgresQueryBuilder);

        self.fetch_subnets(query).await
    }
}
