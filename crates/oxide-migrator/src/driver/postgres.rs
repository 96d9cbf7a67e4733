//! PostgreSQL driver on a `sqlx` pool.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{
    PgArguments, PgConnectOptions, PgPool, PgPoolOptions, PgRow, PgSslMode,
};
use sqlx::query::Query;
use sqlx::{Postgres, Row};

use super::{Connection, Driver, Transaction, Value};
use crate::config::{MigratorConfig, SslMode};
use crate::dialect::{MigrationDialect, PostgresDialect};
use crate::error::Result;
use crate::history::ExecutionRecord;

/// PostgreSQL driver.
pub struct PostgresDriver {
    options: PgConnectOptions,
    timeout: Duration,
}

impl PostgresDriver {
    /// Creates a driver for the configured server.
    #[must_use]
    pub fn from_config(config: &MigratorConfig) -> Self {
        let mut options = PgConnectOptions::new()
            .host(config.host())
            .port(config.port())
            .username(config.user())
            .database(config.database())
            .ssl_mode(ssl_mode(config.ssl_mode()));
        if !config.password().is_empty() {
            options = options.password(config.password());
        }
        Self {
            options,
            timeout: config.connect_timeout(),
        }
    }
}

fn ssl_mode(mode: SslMode) -> PgSslMode {
    match mode {
        SslMode::Disable => PgSslMode::Disable,
        SslMode::Require => PgSslMode::Require,
        SslMode::VerifyCa => PgSslMode::VerifyCa,
        SslMode::VerifyFull => PgSslMode::VerifyFull,
    }
}

#[async_trait]
impl Driver for PostgresDriver {
    fn dialect(&self) -> Arc<dyn MigrationDialect> {
        Arc::new(PostgresDialect::new())
    }

    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(self.timeout)
            .connect_with(self.options.clone())
            .await?;
        Ok(Box::new(PgPoolConnection { pool }))
    }
}

struct PgPoolConnection {
    pool: PgPool,
}

#[async_trait]
impl Connection for PgPoolConnection {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction { tx }))
    }

    async fn is_alive(&self) -> bool {
        !self.pool.is_closed() && sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

fn bind<'q>(sql: &'q str, params: &[Value]) -> Query<'q, Postgres, PgArguments> {
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

fn record_from_row(row: &PgRow) -> std::result::Result<ExecutionRecord, sqlx::Error> {
    Ok(ExecutionRecord {
        migration_id: row.try_get("migration_id")?,
        migration_name: row.try_get("migration_name")?,
        content_hash: row.try_get("text_content")?,
        executed_at: row.try_get("executed_at")?,
    })
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        let result = bind(sql, params).execute(&mut *self.tx).await?;
        Ok(result.rows_affected())
    }

    async fn execute_script(&mut self, sql: &str) -> Result<()> {
        // Simple query protocol; allows several statements.
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
