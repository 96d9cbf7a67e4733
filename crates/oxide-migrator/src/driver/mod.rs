//! Driver adapter.
//!
//! The engine talks to the database only through these traits: a
//! [`Driver`] opens a [`Connection`], a connection begins a [`Transaction`],
//! and every statement runs inside a transaction. [`ConnectionManager`]
//! caches the connection and checks it before reuse.

mod postgres;
mod sqlite;

pub use postgres::PostgresDriver;
pub use sqlite::SqliteDriver;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::dialect::MigrationDialect;
use crate::error::{MigrateError, Result};
use crate::history::ExecutionRecord;

/// A bind parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Text value.
    Text(String),
    /// Timestamp value.
    Timestamp(DateTime<Utc>),
    /// SQL `NULL`.
    Null,
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

/// Opens connections to one database.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Returns the SQL dialect of the database.
    fn dialect(&self) -> Arc<dyn MigrationDialect>;

    /// Opens a connection.
    async fn connect(&self) -> Result<Box<dyn Connection>>;
}

/// An open connection (or pool handle).
#[async_trait]
pub trait Connection: Send + Sync {
    /// Begins a transaction.
    async fn begin(&self) -> Result<Box<dyn Transaction>>;

    /// Returns whether the connection can still serve queries.
    async fn is_alive(&self) -> bool;

    /// Closes the connection.
    async fn close(&self);
}

/// A database transaction.
///
/// Dropping a transaction without committing rolls it back.
#[async_trait]
pub trait Transaction: Send {
    /// Executes one statement, returning the number of affected rows.
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Executes a script of one or more statements without parameters.
    async fn execute_script(&mut self, sql: &str) -> Result<()>;

    /// Runs a query selecting the tracking-table columns.
    async fn fetch_records(&mut self, sql: &str, params: &[Value]) -> Result<Vec<ExecutionRecord>>;

    /// Runs a query selecting a single text column.
    async fn fetch_names(&mut self, sql: &str) -> Result<Vec<String>>;

    /// Commits the transaction.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Rolls the transaction back.
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Observable state of a [`ConnectionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection is held.
    Disconnected,
    /// A connection attempt is in progress, or was abandoned midway.
    Connecting,
    /// A connection is held.
    Connected,
}

enum Slot {
    Disconnected,
    Connecting,
    Connected(Box<dyn Connection>),
}

/// Caches one connection from a driver.
///
/// `acquire` reuses the cached connection if it passes a liveness check and
/// replaces it otherwise.
pub struct ConnectionManager {
    driver: Box<dyn Driver>,
    slot: Slot,
}

impl ConnectionManager {
    /// Creates a manager in the `Disconnected` state.
    #[must_use]
    pub fn new(driver: Box<dyn Driver>) -> Self {
        Self {
            driver,
            slot: Slot::Disconnected,
        }
    }

    /// Returns the driver's dialect.
    #[must_use]
    pub fn dialect(&self) -> Arc<dyn MigrationDialect> {
        self.driver.dialect()
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        match self.slot {
            Slot::Disconnected => ConnectionState::Disconnected,
            Slot::Connecting => ConnectionState::Connecting,
            Slot::Connected(_) => ConnectionState::Connected,
        }
    }

    /// Returns a live connection, connecting or reconnecting as needed.
    pub async fn acquire(&mut self) -> Result<&dyn Connection> {
        let alive = match &self.slot {
            Slot::Connected(conn) => conn.is_alive().await,
            Slot::Disconnected | Slot::Connecting => false,
        };

        if !alive {
            if let Slot::Connected(stale) = std::mem::replace(&mut self.slot, Slot::Connecting) {
                warn!("Connection failed liveness check, reconnecting");
                stale.close().await;
            }

            debug!(dialect = self.driver.dialect().name(), "Connecting");
            match self.driver.connect().await {
                Ok(conn) => self.slot = Slot::Connected(conn),
                Err(e) => {
                    self.slot = Slot::Disconnected;
                    return Err(e);
                }
            }
        }

        match &self.slot {
            Slot::Connected(conn) => Ok(conn.as_ref()),
            Slot::Disconnected | Slot::Connecting => Err(MigrateError::InvalidState(
                "connection slot empty after connect".to_string(),
            )),
        }
    }

    /// Begins a transaction on a live connection.
    pub async fn begin(&mut self) -> Result<Box<dyn Transaction>> {
        self.acquire().await?.begin().await
    }

    /// Closes the cached connection, if any.
    pub async fn close(&mut self) {
        if let Slot::Connected(conn) = std::mem::replace(&mut self.slot, Slot::Disconnected) {
            conn.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::dialect::SqliteDialect;

    struct FlakyDriver {
        connects: Arc<AtomicUsize>,
        alive: Arc<AtomicBool>,
        fail: bool,
    }

    struct FlakyConnection {
        alive: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Driver for FlakyDriver {
        fn dialect(&self) -> Arc<dyn MigrationDialect> {
            Arc::new(SqliteDialect::new())
        }

        async fn connect(&self) -> Result<Box<dyn Connection>> {
            if self.fail {
                return Err(MigrateError::Database(sqlx::Error::PoolTimedOut));
            }
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.alive.store(true, Ordering::SeqCst);
            Ok(Box::new(FlakyConnection {
                alive: self.alive.clone(),
            }))
        }
    }

    #[async_trait]
    impl Connection for FlakyConnection {
        async fn begin(&self) -> Result<Box<dyn Transaction>> {
            Err(MigrateError::InvalidState("not supported".to_string()))
        }

        async fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn close(&self) {}
    }

    fn manager(fail: bool) -> (ConnectionManager, Arc<AtomicUsize>, Arc<AtomicBool>) {
        let connects = Arc::new(AtomicUsize::new(0));
        let alive = Arc::new(AtomicBool::new(false));
        let driver = FlakyDriver {
            connects: connects.clone(),
            alive: alive.clone(),
            fail,
        };
        (ConnectionManager::new(Box::new(driver)), connects, alive)
    }

    #[tokio::test]
    async fn test_reuses_live_connection() {
        let (mut manager, connects, _) = manager(false);
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        manager.acquire().await.unwrap();
        manager.acquire().await.unwrap();

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_replaces_dead_connection() {
        let (mut manager, connects, alive) = manager(false);
        manager.acquire().await.unwrap();

        alive.store(false, Ordering::SeqCst);
        manager.acquire().await.unwrap();

        assert_eq!(connects.load(Ordering::SeqCst), 2);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_failed_connect_returns_to_disconnected() {
        let (mut manager, _, _) = manager(true);
        assert!(manager.acquire().await.is_err());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_close() {
        let (mut manager, _, _) = manager(false);
        manager.acquire().await.unwrap();
        manager.close().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }
}
