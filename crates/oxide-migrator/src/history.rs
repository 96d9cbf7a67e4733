//! Migration history tracking.
//!
//! This module manages the tracking table that records which migrations have
//! been applied to the database. [`StateStore`] is the only component that
//! reads or writes it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::TableName;
use crate::dialect::MigrationDialect;
use crate::driver::{Connection, Transaction, Value};
use crate::error::{MigrateError, Result};
use crate::migration::migration_id;

/// A row of the tracking table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRecord {
    /// Primary key derived from the name.
    pub migration_id: String,
    /// Migration name.
    pub migration_name: String,
    /// Content hash at the time the migration was applied.
    pub content_hash: String,
    /// When the migration was applied; `None` means known but not applied.
    pub executed_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    /// Returns whether this record counts as applied.
    #[must_use]
    pub fn is_applied(&self) -> bool {
        self.executed_at.is_some()
    }
}

/// Result of claiming a migration in the tracking table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// A new record was inserted.
    Inserted,
    /// A known-but-unapplied record was marked applied.
    Updated,
    /// The migration was already applied with the same content, possibly by
    /// another process that won the race.
    AlreadyApplied,
}

/// Persisted record of what has run.
///
/// `list_applied` is served from memory until a write goes through this
/// instance or [`StateStore::refresh`] is called. Writes made by other
/// processes are not seen until then.
pub struct StateStore {
    table: TableName,
    dialect: Arc<dyn MigrationDialect>,
    applied: Vec<String>,
    dirty: bool,
}

impl StateStore {
    /// Creates a store for the given tracking table.
    #[must_use]
    pub fn new(table: TableName, dialect: Arc<dyn MigrationDialect>) -> Self {
        Self {
            table,
            dialect,
            applied: Vec::new(),
            dirty: true,
        }
    }

    /// Returns the tracking table name.
    #[must_use]
    pub fn table(&self) -> &TableName {
        &self.table
    }

    /// Takes the cross-process lock for the rest of `tx`, if the database has one.
    pub async fn lock(&self, tx: &mut dyn Transaction) -> Result<()> {
        if let Some(sql) = self.dialect.lock_sql(self.table.as_str()) {
            tx.execute(&sql, &[]).await?;
        }
        Ok(())
    }

    /// Creates the tracking table if it doesn't exist.
    ///
    /// Runs in its own transaction, under the cross-process lock.
    pub async fn ensure_schema(&self, conn: &dyn Connection) -> Result<()> {
        let mut tx = conn.begin().await?;
        self.lock(tx.as_mut()).await?;
        let sql = self.dialect.create_tracking_table_sql(self.table.as_str());
        tx.execute(&sql, &[]).await?;
        tx.commit().await?;
        debug!(table = %self.table, "Tracking table ready");
        Ok(())
    }

    /// Returns the names of applied migrations, oldest first.
    ///
    /// Served from the cache unless a write went through this store since the
    /// last load.
    pub async fn list_applied(&mut self, conn: &dyn Connection) -> Result<Vec<String>> {
        if self.dirty {
            self.refresh(conn).await?;
        }
        Ok(self.applied.clone())
    }

    /// Reloads the applied set from the database.
    pub async fn refresh(&mut self, conn: &dyn Connection) -> Result<()> {
        let records = self.records(conn).await?;
        self.applied = records
            .into_iter()
            .filter(ExecutionRecord::is_applied)
            .map(|r| r.migration_name)
            .collect();
        self.dirty = false;
        Ok(())
    }

    /// Returns whether the cache will be reloaded on the next `list_applied`.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Reads every record, applied ones ordered by `executed_at`.
    ///
    /// Records that are known but not applied come last.
    pub async fn records(&self, conn: &dyn Connection) -> Result<Vec<ExecutionRecord>> {
        let mut tx = conn.begin().await?;
        let sql = self.dialect.select_records_sql(self.table.as_str());
        let mut records = tx.fetch_records(&sql, &[]).await?;
        tx.commit().await?;

        // NULL ordering differs between databases.
        records.sort_by(|a, b| {
            (a.executed_at.is_none(), a.executed_at, &a.migration_name).cmp(&(
                b.executed_at.is_none(),
                b.executed_at,
                &b.migration_name,
            ))
        });
        Ok(records)
    }

    /// Reads the record for one migration inside `tx`.
    pub async fn find(&self, tx: &mut dyn Transaction, name: &str) -> Result<Option<ExecutionRecord>> {
        let sql = self.dialect.select_record_sql(self.table.as_str());
        let mut records = tx.fetch_records(&sql, &[Value::from(name)]).await?;
        Ok(records.pop())
    }

    /// Records `name` as applied inside `tx`.
    ///
    /// Fails with [`MigrateError::DuplicateApplication`] if it was applied with
    /// a different content hash.
    pub async fn record_applied(
        &mut self,
        tx: &mut dyn Transaction,
        name: &str,
        content_hash: &str,
        executed_at: DateTime<Utc>,
    ) -> Result<RecordOutcome> {
        let table = self.table.as_str();

        let outcome = match self.find(tx, name).await? {
            Some(record) if record.is_applied() => {
                if record.content_hash != content_hash {
                    return Err(MigrateError::DuplicateApplication {
                        name: name.to_string(),
                        recorded: record.content_hash,
                        current: content_hash.to_string(),
                    });
                }
                RecordOutcome::AlreadyApplied
            }
            Some(_) => {
                let sql = self.dialect.update_record_sql(table);
                let updated = tx
                    .execute(
                        &sql,
                        &[
                            Value::from(content_hash),
                            Value::from(executed_at),
                            Value::from(name),
                        ],
                    )
                    .await?;
                if updated == 0 {
                    RecordOutcome::AlreadyApplied
                } else {
                    RecordOutcome::Updated
                }
            }
            None => {
                let sql = self.dialect.insert_record_sql(table);
                let inserted = tx
                    .execute(
                        &sql,
                        &[
                            Value::from(migration_id(name)),
                            Value::from(name),
                            Value::from(content_hash),
                            Value::from(executed_at),
                        ],
                    )
                    .await?;
                if inserted == 0 {
                    RecordOutcome::AlreadyApplied
                } else {
                    RecordOutcome::Inserted
                }
            }
        };

        self.dirty = true;
        Ok(outcome)
    }

    /// Removes the record for `name` inside `tx`.
    ///
    /// Returns whether a record was removed.
    pub async fn record_rolled_back(&mut self, tx: &mut dyn Transaction, name: &str) -> Result<bool> {
        let sql = self.dialect.delete_record_sql(self.table.as_str());
        let deleted = tx.execute(&sql, &[Value::from(name)]).await?;
        self.dirty = true;
        Ok(deleted > 0)
    }

    /// Marks the cache stale without touching the database.
    pub fn invalidate(&mut self) {
        self.dirty = true;
    }
}
