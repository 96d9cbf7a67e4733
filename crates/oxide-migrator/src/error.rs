//! Error types for the migration system.

use std::path::PathBuf;

/// Errors that can occur during migration operations.
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    /// Invalid configuration (table prefix, connection parameters).
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// A migration with the same name is already registered.
    #[error("Migration '{0}' is already registered")]
    DuplicateName(String),

    /// A migration depends on another that isn't registered.
    #[error("Migration '{migration}' depends on '{dependency}' which doesn't exist")]
    UnknownDependency {
        /// The migration with the unknown dependency.
        migration: String,
        /// The dependency that's missing.
        dependency: String,
    },

    /// The dependency graph contains a cycle.
    ///
    /// Each name must run before the next one, and the last before the first.
    #[error("Circular dependency detected in migrations: {}", format_cycle(.cycle))]
    CyclicDependency {
        /// The names forming the cycle.
        cycle: Vec<String>,
    },

    /// A migration was applied with different content than it has now.
    #[error(
        "Migration '{name}' was applied with content hash {recorded} but now hashes to {current}"
    )]
    DuplicateApplication {
        /// Migration name.
        name: String,
        /// Hash stored in the tracking table.
        recorded: String,
        /// Hash of the registered migration.
        current: String,
    },

    /// A migration's `up` or `down` handler failed.
    #[error("Migration '{name}' failed")]
    MigrationExecution {
        /// Migration name.
        name: String,
        /// The handler's error.
        #[source]
        source: anyhow::Error,
    },

    /// Rollback requested for a migration without a `down` handler.
    #[error("Migration '{0}' has no down handler and cannot be rolled back")]
    MissingDownHandler(String),

    /// Migration not found in the registry.
    #[error("Migration not found: {0}")]
    MigrationNotFound(String),

    /// Invalid migration state.
    #[error("Invalid migration state: {0}")]
    InvalidState(String),

    /// The destructive reset was called without the confirmation token.
    #[error(
        "Refusing to reset the database: pass '{}' to drop every table and its data",
        crate::executor::RESET_CONFIRMATION
    )]
    ResetNotConfirmed,

    /// The run was cancelled.
    #[error("Migration run cancelled")]
    Cancelled,

    /// Database error during migration execution.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// IO error (reading/writing migration files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse migration file.
    #[error("Failed to parse migration file '{path}': {message}")]
    ParseError {
        /// Path to the migration file.
        path: PathBuf,
        /// Error message.
        message: String,
    },

    /// Migration file already exists.
    #[error("Migration file already exists: {0}")]
    MigrationExists(PathBuf),

    /// No migrations directory found.
    #[error("Migrations directory not found: {0}")]
    MigrationsDirNotFound(PathBuf),
}

impl MigrateError {
    /// Returns the name of the migration this error is about, if any.
    #[must_use]
    pub fn migration_name(&self) -> Option<&str> {
        match self {
            Self::DuplicateName(name)
            | Self::MissingDownHandler(name)
            | Self::MigrationNotFound(name)
            | Self::DuplicateApplication { name, .. }
            | Self::MigrationExecution { name, .. } => Some(name),
            Self::UnknownDependency { migration, .. } => Some(migration),
            Self::CyclicDependency { cycle } => cycle.first().map(String::as_str),
            _ => None,
        }
    }

    /// Returns the failing handler's error with its causes, one line.
    #[must_use]
    pub fn handler_cause(&self) -> Option<String> {
        match self {
            Self::MigrationExecution { source, .. } => Some(format!("{source:#}")),
            _ => None,
        }
    }
}

fn format_cycle(cycle: &[String]) -> String {
    let mut path = cycle.join(" -> ");
    if let Some(first) = cycle.first() {
        path.push_str(" -> ");
        path.push_str(first);
    }
    path
}

/// Result type for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_display_closes_path() {
        let err = MigrateError::CyclicDependency {
            cycle: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Circular dependency detected in migrations: a -> b -> a"
        );
    }

    #[test]
    fn test_migration_name() {
        let err = MigrateError::UnknownDependency {
            migration: "0002_posts".to_string(),
            dependency: "0001_users".to_string(),
        };
        assert_eq!(err.migration_name(), Some("0002_posts"));
        assert_eq!(MigrateError::Cancelled.migration_name(), None);
    }

    #[test]
    fn test_execution_error_keeps_source() {
        use std::error::Error as _;

        let err = MigrateError::MigrationExecution {
            name: "0001_initial".to_string(),
            source: anyhow::anyhow!("syntax error").context("running CREATE TABLE"),
        };
        // The cause is only reachable through `source()`.
        assert_eq!(err.to_string(), "Migration '0001_initial' failed");
        assert_eq!(
            err.source().map(ToString::to_string).as_deref(),
            Some("running CREATE TABLE")
        );

        let report = format!("{:#}", anyhow::Error::new(err));
        assert_eq!(report.matches("syntax error").count(), 1);
        assert_eq!(
            report,
            "Migration '0001_initial' failed: running CREATE TABLE: syntax error"
        );
    }

    #[test]
    fn test_handler_cause() {
        let err = MigrateError::MigrationExecution {
            name: "0001_initial".to_string(),
            source: anyhow::anyhow!("syntax error").context("running CREATE TABLE"),
        };
        assert_eq!(
            err.handler_cause().as_deref(),
            Some("running CREATE TABLE: syntax error")
        );
        assert_eq!(MigrateError::Cancelled.handler_cause(), None);
    }
}
