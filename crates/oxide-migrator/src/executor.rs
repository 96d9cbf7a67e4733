//! Migration executor.
//!
//! This module applies pending migrations against a database and rolls them
//! back, keeping the tracking table in step. Each migration runs in its own
//! transaction, together with the tracking-table write that records it.

use std::collections::HashSet;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{MigratorConfig, TableName};
use crate::dialect::MigrationDialect;
use crate::driver::{ConnectionManager, Driver, Transaction};
use crate::error::{MigrateError, Result};
use crate::history::{ExecutionRecord, RecordOutcome, StateStore};
use crate::migration::{Migration, MigrationContext};
use crate::registry::MigrationRegistry;
use crate::resolver::resolve;

/// Token [`Migrator::reset_database`] requires before dropping anything.
pub const RESET_CONFIRMATION: &str = "delete-all";

/// Lifecycle of one migration within a single invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    /// Not yet looked at.
    Unknown,
    /// Selected to run.
    Pending,
    /// `up` is running.
    Applying,
    /// Recorded as applied.
    Applied,
    /// `down` is running.
    RollingBack,
    /// Record removed after `down` succeeded.
    RolledBack,
    /// Terminal for this invocation.
    Failed,
}

impl MigrationState {
    /// Returns whether `self -> next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Unknown, Self::Pending)
                | (Self::Pending, Self::Applying)
                | (Self::Applying, Self::Applied | Self::Failed)
                | (Self::Applied, Self::RollingBack)
                | (Self::RollingBack, Self::RolledBack | Self::Failed)
        )
    }

    /// Moves to `next`, failing with [`MigrateError::InvalidState`] on an
    /// illegal transition.
    pub fn advance(&mut self, next: Self) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(MigrateError::InvalidState(format!(
                "cannot move from {self:?} to {next:?}"
            )));
        }
        *self = next;
        Ok(())
    }
}

/// What happened to one migration during a run.
#[derive(Debug)]
pub struct MigrationOutcome {
    name: String,
    state: MigrationState,
    skipped: bool,
    error: Option<MigrateError>,
}

impl MigrationOutcome {
    /// Returns the migration name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the state the migration ended in.
    #[must_use]
    pub fn state(&self) -> MigrationState {
        self.state
    }

    /// Returns whether nothing was done because another process already had.
    #[must_use]
    pub fn is_skipped(&self) -> bool {
        self.skipped
    }

    /// Returns the failure, if any.
    #[must_use]
    pub fn error(&self) -> Option<&MigrateError> {
        self.error.as_ref()
    }
}

/// Per-migration results of an `up` or `down` run.
#[derive(Debug, Default)]
pub struct RunReport {
    outcomes: Vec<MigrationOutcome>,
    cancelled: bool,
}

impl RunReport {
    /// Returns every outcome, in execution order.
    #[must_use]
    pub fn outcomes(&self) -> &[MigrationOutcome] {
        &self.outcomes
    }

    /// Returns the names this run applied.
    #[must_use]
    pub fn applied(&self) -> Vec<&str> {
        self.names_where(|o| o.state == MigrationState::Applied && !o.skipped)
    }

    /// Returns the names this run rolled back.
    #[must_use]
    pub fn rolled_back(&self) -> Vec<&str> {
        self.names_where(|o| o.state == MigrationState::RolledBack && !o.skipped)
    }

    /// Returns the names another process had already handled.
    #[must_use]
    pub fn skipped(&self) -> Vec<&str> {
        self.names_where(|o| o.skipped)
    }

    /// Returns the outcome that halted the run, if any.
    #[must_use]
    pub fn failure(&self) -> Option<&MigrationOutcome> {
        self.outcomes.iter().find(|o| o.error.is_some())
    }

    /// Returns whether the run stopped on cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Returns whether the run neither failed nor was cancelled.
    #[must_use]
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.failure().is_none()
    }

    /// Turns the first failure, or a cancellation, into an error.
    pub fn into_result(mut self) -> Result<Self> {
        if let Some(index) = self.outcomes.iter().position(|o| o.error.is_some()) {
            if let Some(error) = self.outcomes.remove(index).error {
                return Err(error);
            }
        }
        if self.cancelled {
            return Err(MigrateError::Cancelled);
        }
        Ok(self)
    }

    fn names_where(&self, predicate: impl Fn(&MigrationOutcome) -> bool) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| predicate(o))
            .map(|o| o.name.as_str())
            .collect()
    }

    fn push(&mut self, outcome: MigrationOutcome) -> bool {
        let failed = outcome.error.is_some();
        self.outcomes.push(outcome);
        failed
    }
}

/// Where a migration stands relative to the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationStatus {
    /// Applied with the content it has now.
    Applied {
        /// When it was applied.
        executed_at: DateTime<Utc>,
    },
    /// Not applied.
    Pending,
    /// Applied, but its content has changed since.
    Drifted {
        /// When it was applied.
        executed_at: DateTime<Utc>,
    },
    /// Recorded as applied but no longer registered.
    Orphaned {
        /// When it was applied.
        executed_at: DateTime<Utc>,
    },
}

/// One line of [`Migrator::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// Migration name.
    pub name: String,
    /// Its status.
    pub status: MigrationStatus,
}

/// Applies and rolls back registered migrations.
pub struct Migrator {
    connections: ConnectionManager,
    store: StateStore,
    registry: MigrationRegistry,
    plan_cache: Option<Vec<String>>,
    cancel: CancellationToken,
    last_timestamp: Option<DateTime<Utc>>,
    initialized: bool,
}

impl Migrator {
    /// Creates a migrator over `driver` using the default tracking table.
    #[must_use]
    pub fn new(driver: Box<dyn Driver>, registry: MigrationRegistry) -> Self {
        let connections = ConnectionManager::new(driver);
        let store = StateStore::new(TableName::default(), connections.dialect());
        Self {
            connections,
            store,
            registry,
            plan_cache: None,
            cancel: CancellationToken::new(),
            last_timestamp: None,
            initialized: false,
        }
    }

    /// Creates a migrator from a validated configuration.
    pub fn from_config(config: &MigratorConfig, registry: MigrationRegistry) -> Result<Self> {
        Ok(Self::new(config.driver()?, registry).table(config.table_name().clone()))
    }

    /// Uses `table` as the tracking table.
    #[must_use]
    pub fn table(mut self, table: TableName) -> Self {
        self.store = StateStore::new(table, self.connections.dialect());
        self.initialized = false;
        self
    }

    /// Stops runs when `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Registers another migration.
    pub fn register(&mut self, migration: Migration) -> Result<()> {
        self.registry.register(migration)?;
        self.plan_cache = None;
        Ok(())
    }

    /// Returns the registry.
    #[must_use]
    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    /// Returns the tracking table name.
    #[must_use]
    pub fn table_name(&self) -> &TableName {
        self.store.table()
    }

    /// Returns every registered name in execution order.
    ///
    /// Resolved once and reused until the registry changes.
    pub fn plan_order(&mut self) -> Result<Vec<String>> {
        if let Some(order) = &self.plan_cache {
            return Ok(order.clone());
        }
        let order = resolve(&self.registry)?;
        self.plan_cache = Some(order.clone());
        Ok(order)
    }

    /// Creates the tracking table if needed.
    pub async fn init(&mut self) -> Result<()> {
        let conn = self.connections.acquire().await?;
        self.store.ensure_schema(conn).await?;
        self.initialized = true;
        Ok(())
    }

    async fn ensure_initialized(&mut self) -> Result<()> {
        if !self.initialized {
            self.init().await?;
        }
        Ok(())
    }

    /// Reloads the applied set, picking up changes made by other processes.
    pub async fn refresh(&mut self) -> Result<()> {
        self.ensure_initialized().await?;
        let conn = self.connections.acquire().await?;
        self.store.refresh(conn).await
    }

    /// Returns the names of applied migrations, oldest first.
    pub async fn applied(&mut self) -> Result<Vec<String>> {
        self.ensure_initialized().await?;
        let conn = self.connections.acquire().await?;
        self.store.list_applied(conn).await
    }

    /// Returns every pending migration in execution order.
    pub async fn pending(&mut self) -> Result<Vec<String>> {
        self.plan(None).await
    }

    /// Returns the migrations `up(target)` would apply, without applying them.
    ///
    /// With a target, that is the pending part of the execution order up to
    /// and including the target.
    pub async fn plan(&mut self, target: Option<&str>) -> Result<Vec<String>> {
        let order = self.order_until(target)?;
        let applied: HashSet<String> = self.applied().await?.into_iter().collect();
        Ok(order
            .into_iter()
            .filter(|name| !applied.contains(name))
            .collect())
    }

    fn order_until(&mut self, target: Option<&str>) -> Result<Vec<String>> {
        let mut order = self.plan_order()?;
        if let Some(target) = target {
            let position = order
                .iter()
                .position(|name| name == target)
                .ok_or_else(|| MigrateError::MigrationNotFound(target.to_string()))?;
            order.truncate(position + 1);
        }
        Ok(order)
    }

    /// Applies pending migrations in dependency order.
    ///
    /// Stops at the first failure; migrations committed before it stay
    /// applied. The failure is reported in the returned [`RunReport`].
    ///
    /// Refuses to start if a migration up to `target` was applied with
    /// content different from what is registered now.
    pub async fn up(&mut self, target: Option<&str>) -> Result<RunReport> {
        let pending = self.plan(target).await?;
        self.check_drift(target, &pending).await?;
        let mut report = RunReport::default();

        if pending.is_empty() {
            info!("No migrations to apply");
            return Ok(report);
        }

        for name in pending {
            if self.cancel.is_cancelled() {
                warn!("Run cancelled, not starting further migrations");
                report.cancelled = true;
                break;
            }

            let migration = self
                .registry
                .get(&name)
                .cloned()
                .ok_or_else(|| MigrateError::MigrationNotFound(name.clone()))?;

            let outcome = self.apply(&migration).await;
            if matches!(outcome.error, Some(MigrateError::Cancelled)) {
                report.cancelled = true;
            }
            if report.push(outcome) {
                break;
            }
        }

        info!(
            applied = report.applied().len(),
            skipped = report.skipped().len(),
            "Finished applying migrations"
        );
        Ok(report)
    }

    /// Fails with [`MigrateError::DuplicateApplication`] on the first applied
    /// migration in the order up to `target` whose recorded hash differs.
    async fn check_drift(&mut self, target: Option<&str>, pending: &[String]) -> Result<()> {
        let order = self.order_until(target)?;
        if order.len() == pending.len() {
            return Ok(());
        }

        let conn = self.connections.acquire().await?;
        let records = self.store.records(conn).await?;
        for name in order.iter().filter(|name| !pending.contains(name)) {
            let (Some(migration), Some(record)) = (
                self.registry.get(name),
                records
                    .iter()
                    .find(|r| r.is_applied() && &r.migration_name == name),
            ) else {
                continue;
            };
            let current = migration.content_hash();
            if record.content_hash != current {
                warn!(
                    name = %name,
                    recorded = %record.content_hash,
                    current = %current,
                    "Applied migration has changed, refusing to run"
                );
                return Err(MigrateError::DuplicateApplication {
                    name: name.clone(),
                    recorded: record.content_hash.clone(),
                    current,
                });
            }
        }
        Ok(())
    }

    async fn apply(&mut self, migration: &Migration) -> MigrationOutcome {
        let mut state = MigrationState::Unknown;
        let result = self.apply_in_transaction(migration, &mut state).await;

        let (skipped, error) = match result {
            Ok(skipped) => (skipped, None),
            Err(error) => {
                warn!(
                    name = %migration.name(),
                    error = %error,
                    cause = ?error.handler_cause(),
                    "Migration failed"
                );
                (false, Some(error))
            }
        };
        if error.is_some() {
            state = MigrationState::Failed;
        }

        MigrationOutcome {
            name: migration.name().to_string(),
            state,
            skipped,
            error,
        }
    }

    async fn apply_in_transaction(
        &mut self,
        migration: &Migration,
        state: &mut MigrationState,
    ) -> Result<bool> {
        state.advance(MigrationState::Pending)?;
        info!(name = %migration.name(), "Applying migration");

        let timestamp = self.next_timestamp();
        let mut tx = self.connections.begin().await?;
        state.advance(MigrationState::Applying)?;

        match self.claim_and_run_up(tx.as_mut(), migration, timestamp).await {
            Ok(RecordOutcome::AlreadyApplied) => {
                tx.rollback().await?;
                state.advance(MigrationState::Applied)?;
                warn!(name = %migration.name(), "Migration already applied, skipping");
                Ok(true)
            }
            Ok(_) => {
                tx.commit().await?;
                state.advance(MigrationState::Applied)?;
                info!(name = %migration.name(), "Migration applied successfully");
                Ok(false)
            }
            Err(e) => {
                rollback_quietly(tx, migration.name()).await;
                Err(e)
            }
        }
    }

    async fn claim_and_run_up(
        &mut self,
        tx: &mut dyn Transaction,
        migration: &Migration,
        timestamp: DateTime<Utc>,
    ) -> Result<RecordOutcome> {
        self.store.lock(tx).await?;
        let claim = self
            .store
            .record_applied(tx, migration.name(), &migration.content_hash(), timestamp)
            .await?;
        if claim == RecordOutcome::AlreadyApplied {
            return Ok(claim);
        }

        let mut ctx = MigrationContext::new(tx, timestamp);
        let handler = migration.up_handler();
        let result = tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(MigrateError::Cancelled),
            result = handler.run(&mut ctx) => result.map_err(|source| {
                MigrateError::MigrationExecution {
                    name: migration.name().to_string(),
                    source,
                }
            }),
        };
        result?;

        Ok(claim)
    }

    /// Rolls back the `count` most recently applied migrations, newest first.
    ///
    /// Every target must be registered and have a `down` handler; this is
    /// checked before anything is changed.
    pub async fn down(&mut self, count: usize) -> Result<RunReport> {
        self.ensure_initialized().await?;
        let conn = self.connections.acquire().await?;
        let records = self.store.records(conn).await?;

        let targets: Vec<Migration> = records
            .iter()
            .rev()
            .filter(|record| record.is_applied())
            .take(count)
            .map(|record| {
                let migration = self
                    .registry
                    .get(&record.migration_name)
                    .ok_or_else(|| MigrateError::MigrationNotFound(record.migration_name.clone()))?;
                if !migration.is_reversible() {
                    return Err(MigrateError::MissingDownHandler(record.migration_name.clone()));
                }
                Ok(migration.clone())
            })
            .collect::<Result<_>>()?;

        let mut report = RunReport::default();
        if targets.is_empty() {
            info!("No migrations to roll back");
            return Ok(report);
        }

        for migration in &targets {
            if self.cancel.is_cancelled() {
                warn!("Run cancelled, not rolling back further migrations");
                report.cancelled = true;
                break;
            }

            let outcome = self.revert(migration).await;
            if matches!(outcome.error, Some(MigrateError::Cancelled)) {
                report.cancelled = true;
            }
            if report.push(outcome) {
                break;
            }
        }

        info!(
            rolled_back = report.rolled_back().len(),
            "Finished rolling back migrations"
        );
        Ok(report)
    }

    async fn revert(&mut self, migration: &Migration) -> MigrationOutcome {
        let mut state = MigrationState::Applied;
        let result = self.revert_in_transaction(migration, &mut state).await;

        let (skipped, error) = match result {
            Ok(skipped) => (skipped, None),
            Err(error) => {
                warn!(
                    name = %migration.name(),
                    error = %error,
                    cause = ?error.handler_cause(),
                    "Rollback failed"
                );
                (false, Some(error))
            }
        };
        if error.is_some() {
            state = MigrationState::Failed;
        }

        MigrationOutcome {
            name: migration.name().to_string(),
            state,
            skipped,
            error,
        }
    }

    async fn revert_in_transaction(
        &mut self,
        migration: &Migration,
        state: &mut MigrationState,
    ) -> Result<bool> {
        info!(name = %migration.name(), "Rolling back migration");

        let timestamp = self.next_timestamp();
        let mut tx = self.connections.begin().await?;
        state.advance(MigrationState::RollingBack)?;

        match self.release_and_run_down(tx.as_mut(), migration, timestamp).await {
            Ok(false) => {
                tx.rollback().await?;
                state.advance(MigrationState::RolledBack)?;
                warn!(name = %migration.name(), "Migration not applied, skipping rollback");
                Ok(true)
            }
            Ok(true) => {
                tx.commit().await?;
                state.advance(MigrationState::RolledBack)?;
                info!(name = %migration.name(), "Migration rolled back successfully");
                Ok(false)
            }
            Err(e) => {
                rollback_quietly(tx, migration.name()).await;
                Err(e)
            }
        }
    }

    async fn release_and_run_down(
        &mut self,
        tx: &mut dyn Transaction,
        migration: &Migration,
        timestamp: DateTime<Utc>,
    ) -> Result<bool> {
        let handler = migration
            .down_handler()
            .ok_or_else(|| MigrateError::MissingDownHandler(migration.name().to_string()))?;

        self.store.lock(tx).await?;
        if !self.store.record_rolled_back(tx, migration.name()).await? {
            return Ok(false);
        }

        let mut ctx = MigrationContext::new(tx, timestamp);
        let result = tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(MigrateError::Cancelled),
            result = handler.run(&mut ctx) => result.map_err(|source| {
                MigrateError::MigrationExecution {
                    name: migration.name().to_string(),
                    source,
                }
            }),
        };
        result?;

        Ok(true)
    }

    /// Reports every registered migration in execution order, then any
    /// applied record that is no longer registered.
    pub async fn status(&mut self) -> Result<Vec<StatusEntry>> {
        let order = self.plan_order()?;
        self.ensure_initialized().await?;
        let conn = self.connections.acquire().await?;
        let records: Vec<ExecutionRecord> = self
            .store
            .records(conn)
            .await?
            .into_iter()
            .filter(ExecutionRecord::is_applied)
            .collect();

        let mut entries = Vec::with_capacity(order.len());
        for name in order {
            let record = records.iter().find(|r| r.migration_name == name);
            let status = match (record, record.and_then(|r| r.executed_at)) {
                (Some(record), Some(executed_at)) => {
                    let current = self
                        .registry
                        .get(&name)
                        .map(Migration::content_hash)
                        .unwrap_or_default();
                    if record.content_hash == current {
                        MigrationStatus::Applied { executed_at }
                    } else {
                        MigrationStatus::Drifted { executed_at }
                    }
                }
                _ => MigrationStatus::Pending,
            };
            entries.push(StatusEntry { name, status });
        }

        for record in records {
            if self.registry.contains(&record.migration_name) {
                continue;
            }
            if let Some(executed_at) = record.executed_at {
                entries.push(StatusEntry {
                    name: record.migration_name,
                    status: MigrationStatus::Orphaned { executed_at },
                });
            }
        }

        Ok(entries)
    }

    /// Drops every table in the database, the tracking table included.
    ///
    /// Does nothing unless `confirm` is [`RESET_CONFIRMATION`]. Returns the
    /// dropped table names.
    pub async fn reset_database(&mut self, confirm: &str) -> Result<Vec<String>> {
        if confirm != RESET_CONFIRMATION {
            return Err(MigrateError::ResetNotConfirmed);
        }

        let dialect = self.connections.dialect();
        let mut tx = self.connections.begin().await?;
        let dropped = match self.drop_all(tx.as_mut(), dialect.as_ref()).await {
            Ok(dropped) => {
                tx.commit().await?;
                dropped
            }
            Err(e) => {
                rollback_quietly(tx, "reset").await;
                return Err(e);
            }
        };

        self.store.invalidate();
        self.initialized = false;
        warn!(tables = dropped.len(), "Database reset");
        Ok(dropped)
    }

    async fn drop_all(
        &self,
        tx: &mut dyn Transaction,
        dialect: &dyn MigrationDialect,
    ) -> Result<Vec<String>> {
        self.store.lock(tx).await?;
        if let Some(prelude) = dialect.reset_prelude_sql() {
            tx.execute(prelude, &[]).await?;
        }

        let tables = tx.fetch_names(dialect.list_tables_sql()).await?;
        for table in &tables {
            debug!(table = %table, "Dropping table");
            tx.execute(&dialect.drop_table_sql(table), &[]).await?;
        }
        Ok(tables)
    }

    /// Closes the database connection.
    pub async fn close(&mut self) {
        self.connections.close().await;
    }

    /// Hands out strictly increasing timestamps so that `executed_at` order
    /// matches application order.
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now().trunc_subsecs(6);
        let timestamp = match self.last_timestamp {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_timestamp = Some(timestamp);
        timestamp
    }
}

async fn rollback_quietly(tx: Box<dyn Transaction>, name: &str) {
    if let Err(e) = tx.rollback().await {
        warn!(name = %name, error = %e, "Failed to roll back transaction");
    }
}
