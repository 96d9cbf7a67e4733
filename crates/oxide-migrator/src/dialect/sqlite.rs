//! SQLite dialect for migrations.
//!
//! SQLite has no advisory locks; the database-wide write lock taken by the
//! claiming `INSERT` serializes writers, and the unique constraints decide
//! which of two racing processes wins.

use super::MigrationDialect;

/// SQLite migration dialect.
#[derive(Debug, Clone, Default)]
pub struct SqliteDialect;

impl SqliteDialect {
    /// Creates a new SQLite dialect.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl MigrationDialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn timestamp_type(&self) -> &'static str {
        // sqlx stores chrono timestamps as RFC 3339 text.
        "TEXT"
    }

    fn lock_sql(&self, _table: &str) -> Option<String> {
        None
    }

    fn list_tables_sql(&self) -> &'static str {
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name"
    }

    fn drop_table_sql(&self, table: &str) -> String {
        format!("DROP TABLE IF EXISTS {}", self.quote_identifier(table))
    }

    fn reset_prelude_sql(&self) -> Option<&'static str> {
        // Foreign keys are checked at commit, after every table is gone.
        Some("PRAGMA defer_foreign_keys = ON")
    }
}
