//! PostgreSQL dialect for migrations.

use super::MigrationDialect;

/// PostgreSQL migration dialect.
#[derive(Debug, Clone, Default)]
pub struct PostgresDialect;

impl PostgresDialect {
    /// Creates a new PostgreSQL dialect.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl MigrationDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${index}")
    }

    fn timestamp_type(&self) -> &'static str {
        "TIMESTAMP WITH TIME ZONE"
    }

    fn lock_sql(&self, table: &str) -> Option<String> {
        // Released automatically at commit or rollback.
        Some(format!(
            "SELECT pg_advisory_xact_lock(hashtext('{}'))",
            table.replace('\'', "''")
        ))
    }

    fn list_tables_sql(&self) -> &'static str {
        "SELECT tablename FROM pg_catalog.pg_tables WHERE schemaname = 'public' ORDER BY tablename"
    }

    fn drop_table_sql(&self, table: &str) -> String {
        format!("DROP TABLE IF EXISTS {} CASCADE", self.quote_identifier(table))
    }
}
