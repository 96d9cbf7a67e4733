//! Dependency resolution.
//!
//! Builds a [`DependencyGraph`] from the registry and orders it with Kahn's
//! algorithm. Ties are broken by name so the same registry always yields the
//! same plan.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{MigrateError, Result};
use crate::registry::MigrationRegistry;

/// Dependency graph over migration names.
///
/// An edge `a -> b` means `b` depends on `a`, so `a` runs first.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph<'a> {
    /// For each migration, the migrations it depends on.
    dependencies: BTreeMap<&'a str, BTreeSet<&'a str>>,
    /// For each migration, the migrations that depend on it.
    dependents: BTreeMap<&'a str, BTreeSet<&'a str>>,
}

impl<'a> DependencyGraph<'a> {
    /// Builds the graph, failing on the first dependency that isn't registered.
    pub fn build(registry: &'a MigrationRegistry) -> Result<Self> {
        let mut graph = Self::default();

        for migration in registry.all() {
            graph.dependencies.entry(migration.name()).or_default();
            graph.dependents.entry(migration.name()).or_default();
        }

        for migration in registry.all() {
            for dep in migration.dependencies() {
                if !registry.contains(dep) {
                    return Err(MigrateError::UnknownDependency {
                        migration: migration.name().to_string(),
                        dependency: dep.clone(),
                    });
                }
                graph
                    .dependencies
                    .entry(migration.name())
                    .or_default()
                    .insert(dep.as_str());
                graph
                    .dependents
                    .entry(dep.as_str())
                    .or_default()
                    .insert(migration.name());
            }
        }

        Ok(graph)
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    /// Returns whether the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    /// Returns the direct dependencies of `name`.
    pub fn dependencies_of(&self, name: &str) -> impl Iterator<Item = &'a str> + '_ {
        self.dependencies
            .get(name)
            .into_iter()
            .flat_map(|deps| deps.iter().copied())
    }

    /// Returns a linear order in which every migration comes after its
    /// dependencies.
    ///
    /// When several migrations are ready, the smallest name goes first.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let mut in_degree: BTreeMap<&str, usize> = self
            .dependencies
            .iter()
            .map(|(name, deps)| (*name, deps.len()))
            .collect();

        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(name, _)| *name)
            .collect();
        let mut order = Vec::with_capacity(in_degree.len());

        while let Some(name) = ready.pop_first() {
            order.push(name.to_string());

            if let Some(dependents) = self.dependents.get(name) {
                for dependent in dependents {
                    if let Some(deg) = in_degree.get_mut(dependent) {
                        *deg -= 1;
                        if *deg == 0 {
                            ready.insert(*dependent);
                        }
                    }
                }
            }
        }

        if order.len() != self.dependencies.len() {
            let remaining: BTreeSet<&str> = in_degree
                .into_iter()
                .filter(|(_, deg)| *deg > 0)
                .map(|(name, _)| name)
                .collect();
            return Err(MigrateError::CyclicDependency {
                cycle: self.find_cycle(&remaining),
            });
        }

        Ok(order)
    }

    /// Extracts one cycle from the nodes Kahn's algorithm could not place.
    ///
    /// Every remaining node still has a remaining dependency, so walking
    /// dependencies from any of them must revisit a node.
    fn find_cycle(&self, remaining: &BTreeSet<&'a str>) -> Vec<String> {
        let Some(&start) = remaining.first() else {
            return Vec::new();
        };

        let mut path: Vec<&str> = Vec::new();
        let mut position: BTreeMap<&str, usize> = BTreeMap::new();
        let mut current = start;

        loop {
            if let Some(&idx) = position.get(current) {
                // path[idx..] walks dependencies; reverse it to execution order.
                let mut cycle: Vec<String> = path[idx..].iter().map(ToString::to_string).collect();
                cycle.reverse();
                return cycle;
            }
            position.insert(current, path.len());
            path.push(current);

            match self
                .dependencies_of(current)
                .find(|dep| remaining.contains(dep))
            {
                Some(next) => current = next,
                None => return path.iter().map(ToString::to_string).collect(),
            }
        }
    }
}

/// Resolves the registry into an execution order.
///
/// Pure function of the registry's content.
pub fn resolve(registry: &MigrationRegistry) -> Result<Vec<String>> {
    DependencyGraph::build(registry)?.topological_order()
}
