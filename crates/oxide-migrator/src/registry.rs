//! Migration registry.
//!
//! Holds the set of named migrations. Registration order is kept for
//! listing only; execution order comes from the [`resolver`](crate::resolver).

use std::collections::{HashMap, HashSet};

use crate::error::{MigrateError, Result};
use crate::migration::Migration;

/// The set of known migrations.
#[derive(Debug, Default, Clone)]
pub struct MigrationRegistry {
    migrations: Vec<Migration>,
    index: HashMap<String, usize>,
}

impl MigrationRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a migration.
    ///
    /// Fails with [`MigrateError::DuplicateName`] if a migration with the same
    /// name exists; the registry is unchanged in that case.
    pub fn register(&mut self, migration: Migration) -> Result<()> {
        if self.index.contains_key(migration.name()) {
            return Err(MigrateError::DuplicateName(migration.name().to_string()));
        }
        self.index
            .insert(migration.name().to_string(), self.migrations.len());
        self.migrations.push(migration);
        Ok(())
    }

    /// Registers several migrations at once.
    ///
    /// Either all of them are added or, on the first duplicate name (against
    /// the registry or within the batch), none are.
    pub fn register_all(&mut self, migrations: impl IntoIterator<Item = Migration>) -> Result<()> {
        let batch: Vec<Migration> = migrations.into_iter().collect();
        let mut seen = HashSet::new();
        for migration in &batch {
            if self.contains(migration.name()) || !seen.insert(migration.name()) {
                return Err(MigrateError::DuplicateName(migration.name().to_string()));
            }
        }
        for migration in batch {
            self.register(migration)?;
        }
        Ok(())
    }

    /// Returns all migrations in registration order.
    #[must_use]
    pub fn all(&self) -> &[Migration] {
        &self.migrations
    }

    /// Looks up a migration by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Migration> {
        self.index.get(name).map(|&idx| &self.migrations[idx])
    }

    /// Returns whether a migration with this name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Returns the number of registered migrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    /// Returns whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_list_in_order() {
        let mut registry = MigrationRegistry::new();
        registry
            .register(Migration::sql("0002_posts", "SELECT 1"))
            .unwrap();
        registry
            .register(Migration::sql("0001_initial", "SELECT 1"))
            .unwrap();

        let names: Vec<_> = registry.all().iter().map(Migration::name).collect();
        assert_eq!(names, ["0002_posts", "0001_initial"]);
        assert!(registry.contains("0001_initial"));
        assert_eq!(registry.get("0002_posts").unwrap().name(), "0002_posts");
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut registry = MigrationRegistry::new();
        registry
            .register(Migration::sql("init", "CREATE TABLE a (id INTEGER)"))
            .unwrap();

        let result = registry.register(Migration::sql("init", "CREATE TABLE b (id INTEGER)"));
        assert!(matches!(result, Err(MigrateError::DuplicateName(name)) if name == "init"));

        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get("init").unwrap().content_hash(),
            Migration::sql("init", "CREATE TABLE a (id INTEGER)").content_hash()
        );
    }

    #[test]
    fn test_duplicate_batch_adds_neither() {
        let mut registry = MigrationRegistry::new();
        let result = registry.register_all([
            Migration::sql("init", "SELECT 1"),
            Migration::sql("init", "SELECT 2"),
        ]);
        assert!(matches!(result, Err(MigrateError::DuplicateName(name)) if name == "init"));
        assert!(registry.is_empty());
    }
}
