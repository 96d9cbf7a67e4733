//! SQLite driver on a `sqlx` pool.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite};

use super::{Connection, Driver, Transaction, Value};
use crate::config::MigratorConfig;
use crate::dialect::{MigrationDialect, SqliteDialect};
use crate::error::Result;
use crate::history::ExecutionRecord;

enum PoolSource {
    /// A pool owned by the caller; never closed by the driver.
    Shared(SqlitePool),
    /// Options for pools the driver creates and owns.
    Options {
        options: SqliteConnectOptions,
        timeout: Duration,
    },
}

/// SQLite driver.
pub struct SqliteDriver {
    source: PoolSource,
}

impl SqliteDriver {
    /// Wraps an existing pool.
    #[must_use]
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            source: PoolSource::Shared(pool),
        }
    }

    /// Creates a driver that opens the configured database file.
    pub fn from_config(config: &MigratorConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", config.database()))?
            .create_if_missing(true);
        Ok(Self {
            source: PoolSource::Options {
                options,
                timeout: config.connect_timeout(),
            },
        })
    }
}

#[async_trait]
impl Driver for SqliteDriver {
    fn dialect(&self) -> Arc<dyn MigrationDialect> {
        Arc::new(SqliteDialect::new())
    }

    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let (pool, owned) = match &self.source {
            PoolSource::Shared(pool) => (pool.clone(), false),
            PoolSource::Options { options, timeout } => {
                // One logical worker drives a run.
                let pool = SqlitePoolOptions::new()
                    .max_connections(1)
                    .acquire_timeout(*timeout)
                    .connect_with(options.clone())
                    .await?;
                (pool, true)
            }
        };
        Ok(Box::new(SqlitePoolConnection { pool, owned }))
    }
}

struct SqlitePoolConnection {
    pool: SqlitePool,
    owned: bool,
}

#[async_trait]
impl Connection for SqlitePoolConnection {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        // Take the write lock up front so a second runner waits on the busy
        // timeout instead of failing when it upgrades from a read lock.
        let tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        Ok(Box::new(SqliteTransaction { tx }))
    }

    async fn is_alive(&self) -> bool {
        !self.pool.is_closed() && sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    async fn close(&self) {
        if self.owned {
            self.pool.close().await;
        }
    }
}

struct SqliteTransaction {
    tx: sqlx::Transaction<'static, Sqlite>,
}

fn bind<'q>(sql: &'q str, params: &[Value]) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    let mut query = sqlx::query(sql);
    for param in params {
        query = match param {
            Value::Text(text) => query.bind(text.clone()),
            Value::Timestamp(ts) => query.bind(*ts),
            Value::Null => query.bind(None::<String>),
        };
    }
    query
}

fn record_from_row(row: &SqliteRow) -> std::result::Result<ExecutionRecord, sqlx::Error> {
    Ok(ExecutionRecord {
        migration_id: row.try_get("migration_id")?,
        migration_name: row.try_get("migration_name")?,
        content_hash: row.try_get("text_content")?,
        executed_at: row.try_get("executed_at")?,
    })
}

#[async_trait]
impl Transaction for SqliteTransaction {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        let result = bind(sql, params).execute(&mut *self.tx).await?;
        Ok(result.rows_affected())
    }

    async fn execute_script(&mut self, sql: &str) -> Result<()> {
        sqlx::Executor::execute(&mut *self.tx, sqlx::raw_sql(sql)).await?;
        Ok(())
    }

    async fn fetch_records(&mut self, sql: &str, params: &[Value]) -> Result<Vec<ExecutionRecord>> {
        let rows = bind(sql, params).fetch_all(&mut *self.tx).await?;
        let records = rows
            .iter()
            .map(record_from_row)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    async fn fetch_names(&mut self, sql: &str) -> Result<Vec<String>> {
        let names = sqlx::query_scalar::<_, String>(sql)
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(names)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
