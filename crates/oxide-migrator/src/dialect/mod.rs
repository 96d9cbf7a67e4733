//! Database dialect implementations.
//!
//! Each dialect knows how to render the SQL the state store and the reset
//! path need for that database system: the tracking table, its queries,
//! and the cross-process lock.

mod postgres;
mod sqlite;

pub use postgres::PostgresDialect;
pub use sqlite::SqliteDialect;

/// Columns of the tracking table, in `SELECT` order.
pub const RECORD_COLUMNS: &str = "migration_id, migration_name, text_content, executed_at";

/// Trait for database-specific SQL generation.
pub trait MigrationDialect: Send + Sync {
    /// Returns the dialect name.
    fn name(&self) -> &'static str;

    /// Returns the bind placeholder for the 1-based parameter `index`.
    fn placeholder(&self, index: usize) -> String;

    /// Returns the column type used for `executed_at`.
    fn timestamp_type(&self) -> &'static str;

    /// Returns SQL that serializes tracking-table writers across processes
    /// for the rest of the current transaction, if the database has such a
    /// primitive.
    fn lock_sql(&self, table: &str) -> Option<String>;

    /// Returns SQL listing the user tables of the database, one name per row.
    fn list_tables_sql(&self) -> &'static str;

    /// Returns SQL dropping one table.
    fn drop_table_sql(&self, table: &str) -> String;

    /// Returns SQL to run before dropping tables in bulk.
    fn reset_prelude_sql(&self) -> Option<&'static str> {
        None
    }

    /// Quote an identifier (table name, column name, etc.).
    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    /// Generates the tracking table definition.
    fn create_tracking_table_sql(&self, table: &str) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n  \
             migration_id VARCHAR(128) NOT NULL PRIMARY KEY,\n  \
             migration_name VARCHAR(128) NOT NULL UNIQUE,\n  \
             text_content TEXT NOT NULL,\n  \
             executed_at {} NULL\n)",
            self.quote_identifier(table),
            self.timestamp_type()
        )
    }

    /// Selects every record, oldest execution first.
    fn select_records_sql(&self, table: &str) -> String {
        format!(
            "SELECT {RECORD_COLUMNS} FROM {} ORDER BY executed_at ASC, migration_name ASC",
            self.quote_identifier(table)
        )
    }

    /// Selects the record for one migration name.
    fn select_record_sql(&self, table: &str) -> String {
        format!(
            "SELECT {RECORD_COLUMNS} FROM {} WHERE migration_name = {}",
            self.quote_identifier(table),
            self.placeholder(1)
        )
    }

    /// Inserts a record unless one with the same id or name exists.
    fn insert_record_sql(&self, table: &str) -> String {
        format!(
            "INSERT INTO {} ({RECORD_COLUMNS}) VALUES ({}, {}, {}, {}) ON CONFLICT DO NOTHING",
            self.quote_identifier(table),
            self.placeholder(1),
            self.placeholder(2),
            self.placeholder(3),
            self.placeholder(4)
        )
    }

    /// Marks a known-but-unapplied record as applied.
    fn update_record_sql(&self, table: &str) -> String {
        format!(
            "UPDATE {} SET text_content = {}, executed_at = {} \
             WHERE migration_name = {} AND executed_at IS NULL",
            self.quote_identifier(table),
            self.placeholder(1),
            self.placeholder(2),
            self.placeholder(3)
        )
    }

    /// Deletes the record for one migration name.
    fn delete_record_sql(&self, table: &str) -> String {
        format!(
            "DELETE FROM {} WHERE migration_name = {}",
            self.quote_identifier(table),
            self.placeholder(1)
        )
    }
}
