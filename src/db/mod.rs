//! Database layer for praxisdb
//!
//! Provides:
//! - Connection pool management over sqlx/SQLite
//! - Schema initialization from the registry's DDL
//! - A `DbHandle` abstraction that executes query plans either on the
//!   pool or inside a shared transaction

use crate::config::DatabaseConfig;
use crate::errors::{DalError, Result};
use crate::query::{SqlQuery, Value};
use crate::schema::SchemaRegistry;
use sqlx::sqlite::{
    Sqlite, SqliteArguments, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Transaction;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// Bind one parameter onto a query
fn bind_value<'q>(query: SqliteQuery<'q>, value: &Value) -> SqliteQuery<'q> {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(*b),
        Value::Int(i) => query.bind(*i),
        Value::Float(f) => query.bind(*f),
        Value::Text(s) => query.bind(s.clone()),
        // UUIDs are stored as hyphenated text
        Value::Uuid(u) => query.bind(u.to_string()),
        Value::DateTime(dt) => query.bind(*dt),
    }
}

fn prepare<'q>(plan: &'q SqlQuery) -> SqliteQuery<'q> {
    let mut query = sqlx::query(&plan.sql);
    for param in &plan.params {
        query = bind_value(query, param);
    }
    query
}

/// A shared in-flight transaction
pub(crate) type SharedTx = Arc<Mutex<Transaction<'static, Sqlite>>>;

/// Executes query plans on a pool connection or inside a transaction.
/// Every repository call goes through one of these; the transactional
/// variant serializes its callers on the transaction's connection.
#[derive(Clone)]
pub enum DbHandle {
    Pool(SqlitePool),
    Tx(SharedTx),
}

impl DbHandle {
    pub async fn fetch_all(&self, plan: &SqlQuery) -> Result<Vec<SqliteRow>> {
        debug!(sql = %plan.sql, params = plan.params.len(), "fetch_all");
        match self {
            DbHandle::Pool(pool) => prepare(plan).fetch_all(pool).await.map_err(DalError::from),
            DbHandle::Tx(tx) => {
                let mut guard = tx.lock().await;
                prepare(plan)
                    .fetch_all(&mut **guard)
                    .await
                    .map_err(DalError::from)
            }
        }
    }

    pub async fn fetch_optional(&self, plan: &SqlQuery) -> Result<Option<SqliteRow>> {
        debug!(sql = %plan.sql, params = plan.params.len(), "fetch_optional");
        match self {
            DbHandle::Pool(pool) => prepare(plan)
                .fetch_optional(pool)
                .await
                .map_err(DalError::from),
            DbHandle::Tx(tx) => {
                let mut guard = tx.lock().await;
                prepare(plan)
                    .fetch_optional(&mut **guard)
                    .await
                    .map_err(DalError::from)
            }
        }
    }

    /// Execute a statement, returning the number of affected rows
    pub async fn execute(&self, plan: &SqlQuery) -> Result<u64> {
        debug!(sql = %plan.sql, params = plan.params.len(), "execute");
        let result = match self {
            DbHandle::Pool(pool) => prepare(plan).execute(pool).await?,
            DbHandle::Tx(tx) => {
                let mut guard = tx.lock().await;
                prepare(plan).execute(&mut **guard).await?
            }
        };
        Ok(result.rows_affected())
    }

    /// Execute a list of statements atomically, returning the total
    /// affected-row count. On a pool handle the batch runs in its own
    /// transaction; inside an existing transaction it joins it.
    pub async fn execute_batch(&self, plans: &[SqlQuery]) -> Result<u64> {
        debug!(statements = plans.len(), "execute_batch");
        match self {
            DbHandle::Pool(pool) => {
                let mut tx = pool.begin().await?;
                let mut affected = 0;
                for plan in plans {
                    let result = prepare(plan).execute(&mut *tx).await?;
                    affected += result.rows_affected();
                }
                tx.commit().await?;
                Ok(affected)
            }
            DbHandle::Tx(tx) => {
                let mut guard = tx.lock().await;
                let mut affected = 0;
                for plan in plans {
                    let result = prepare(plan).execute(&mut **guard).await?;
                    affected += result.rows_affected();
                }
                Ok(affected)
            }
        }
    }
}

/// Database connection pool wrapper
#[derive(Clone)]
pub struct Db {
    pool: SqlitePool,
}

impl Db {
    /// Create a pool from configuration and verify connectivity
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| DalError::Connection {
                message: format!("invalid database url: {}", e),
            })?
            .create_if_missing(config.create_if_missing)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(config.idle_timeout())
            .connect_with(options)
            .await
            .map_err(|e| DalError::Connection {
                message: format!("failed to connect: {}", e),
            })?;

        info!(
            url = %config.url,
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Database connection pool initialized"
        );

        Ok(Self { pool })
    }

    /// In-memory database for tests and scratch work. The pool is pinned
    /// to a single connection: an in-memory database is per-connection.
    pub async fn connect_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| DalError::Connection {
                message: e.to_string(),
            })?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| DalError::Connection {
                message: format!("failed to open in-memory database: {}", e),
            })?;

        Ok(Self { pool })
    }

    /// Create every registered table that does not exist yet
    pub async fn init_schema(&self, registry: &SchemaRegistry) -> Result<()> {
        for entity in registry.entities() {
            let ddl = entity.create_table_sql(registry)?;
            sqlx::query(&ddl).execute(&self.pool).await?;
        }
        info!(entities = registry.entities().len(), "Schema initialized");
        Ok(())
    }

    /// Ping the database, used by health checks
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Handle executing on the pool
    pub fn handle(&self) -> DbHandle {
        DbHandle::Pool(self.pool.clone())
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::registry;

    async fn init_db() -> Db {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("praxisdb=debug")),
            )
            .with_test_writer()
            .try_init();

        let db = Db::connect_in_memory().await.unwrap();
        db.init_schema(registry()).await.unwrap();
        db
    }

    #[tokio::test]
    async fn test_ping() {
        let db = init_db().await;
        db.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_handle_round_trip() {
        let db = init_db().await;
        let handle = db.handle();

        let mut insert = SqlQuery::new("INSERT INTO \"roles\" (\"id\", \"name\", \"created_at\", \"updated_at\") VALUES (?, ?, ?, ?)");
        insert.params = vec![
            Value::Uuid(uuid::Uuid::new_v4()),
            Value::Text("admin".to_string()),
            Value::DateTime(chrono::Utc::now()),
            Value::DateTime(chrono::Utc::now()),
        ];
        assert_eq!(handle.execute(&insert).await.unwrap(), 1);

        let rows = handle
            .fetch_all(&SqlQuery::new("SELECT \"name\" FROM \"roles\""))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_execute_batch_rolls_back_on_failure() {
        let db = init_db().await;
        let handle = db.handle();

        let id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now();
        let mk = |id: &str, name: &str| {
            let mut q = SqlQuery::new(
                "INSERT INTO \"roles\" (\"id\", \"name\", \"created_at\", \"updated_at\") VALUES (?, ?, ?, ?)",
            );
            q.params = vec![
                Value::Text(id.to_string()),
                Value::Text(name.to_string()),
                Value::DateTime(now),
                Value::DateTime(now),
            ];
            q
        };

        // second statement violates the unique role name
        let plans = vec![mk(&id, "admin"), mk(&uuid::Uuid::new_v4().to_string(), "admin")];
        assert!(handle.execute_batch(&plans).await.is_err());

        let rows = handle
            .fetch_all(&SqlQuery::new("SELECT \"id\" FROM \"roles\""))
            .await
            .unwrap();
        assert!(rows.is_empty());
    }
}
