//! Migration definitions.
//!
//! A [`Migration`] is a named unit of schema change with an `up` handler, an
//! optional `down` handler, and the names of the migrations it depends on.
//! Handlers receive a [`MigrationContext`] giving access to the transaction
//! the migration runs in.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::driver::Transaction;

/// Context handed to `up`/`down` handlers.
///
/// Holds the transaction the migration runs in and the timestamp that will
/// be recorded as its `executed_at`. The fields are fixed at creation.
pub struct MigrationContext<'a> {
    client: &'a mut dyn Transaction,
    timestamp: DateTime<Utc>,
}

impl<'a> MigrationContext<'a> {
    pub(crate) fn new(client: &'a mut dyn Transaction, timestamp: DateTime<Utc>) -> Self {
        Self { client, timestamp }
    }

    /// Returns the transactional client.
    pub fn client(&mut self) -> &mut dyn Transaction {
        &mut *self.client
    }

    /// Returns the execution timestamp of this run of the migration.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// The forward or reverse body of a migration.
#[async_trait]
pub trait MigrationHandler: Send + Sync {
    /// Runs the handler inside the migration's transaction.
    async fn run(&self, ctx: &mut MigrationContext<'_>) -> anyhow::Result<()>;
}

/// A handler that executes a SQL script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlScript(String);

impl SqlScript {
    /// Creates a new SQL script handler.
    #[must_use]
    pub fn new(sql: impl Into<String>) -> Self {
        Self(sql.into())
    }

    /// Returns the script text.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.0
    }

    /// Returns whether the script contains nothing but blank lines and comments.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.0
            .lines()
            .map(str::trim)
            .all(|line| line.is_empty() || line.starts_with("--"))
    }
}

#[async_trait]
impl MigrationHandler for SqlScript {
    async fn run(&self, ctx: &mut MigrationContext<'_>) -> anyhow::Result<()> {
        if self.is_blank() {
            return Ok(());
        }
        ctx.client().execute_script(&self.0).await?;
        Ok(())
    }
}

/// A registered database migration.
#[derive(Clone)]
pub struct Migration {
    name: String,
    dependencies: Vec<String>,
    up: Arc<dyn MigrationHandler>,
    down: Option<Arc<dyn MigrationHandler>>,
    content: String,
}

impl Migration {
    /// Creates a migration with the given `up` handler.
    ///
    /// The content used for drift detection defaults to the name; set it with
    /// [`Migration::content`] when the handler's behavior changes.
    #[must_use]
    pub fn new(name: impl Into<String>, up: impl MigrationHandler + 'static) -> Self {
        let name = name.into();
        Self {
            content: name.clone(),
            name,
            dependencies: Vec::new(),
            up: Arc::new(up),
            down: None,
        }
    }

    /// Creates a migration whose `up` body is a SQL script.
    ///
    /// The script text is the migration's content.
    #[must_use]
    pub fn sql(name: impl Into<String>, up: impl Into<String>) -> Self {
        let script = SqlScript::new(up);
        let content = script.sql().to_string();
        Self::new(name, script).content(content)
    }

    /// Adds a dependency on another migration.
    #[must_use]
    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.dependencies.contains(&name) {
            self.dependencies.push(name);
        }
        self
    }

    /// Sets the `down` handler.
    #[must_use]
    pub fn down(mut self, handler: impl MigrationHandler + 'static) -> Self {
        self.down = Some(Arc::new(handler));
        self
    }

    /// Sets a SQL script as the `down` handler.
    #[must_use]
    pub fn down_sql(self, sql: impl Into<String>) -> Self {
        self.down(SqlScript::new(sql))
    }

    /// Sets the content hashed for drift detection.
    #[must_use]
    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    /// Returns the migration name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the names this migration depends on.
    #[must_use]
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    /// Returns whether a `down` handler is defined.
    #[must_use]
    pub fn is_reversible(&self) -> bool {
        self.down.is_some()
    }

    /// Returns the SHA-256 hex digest of the migration content.
    #[must_use]
    pub fn content_hash(&self) -> String {
        content_hash(&self.content)
    }

    /// Returns the tracking-table id for this migration.
    #[must_use]
    pub fn id(&self) -> String {
        migration_id(&self.name)
    }

    pub(crate) fn up_handler(&self) -> &dyn MigrationHandler {
        self.up.as_ref()
    }

    pub(crate) fn down_handler(&self) -> Option<&dyn MigrationHandler> {
        self.down.as_deref()
    }
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("reversible", &self.is_reversible())
            .finish_non_exhaustive()
    }
}

/// Computes the SHA-256 hex digest of migration content.
#[must_use]
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Derives the primary key stored for a migration name.
///
/// Every process computes the same id for the same name, so concurrent
/// claims of one migration collide on the primary key.
#[must_use]
pub fn migration_id(name: &str) -> String {
    let mut id = content_hash(name);
    id.truncate(32);
    id
}
