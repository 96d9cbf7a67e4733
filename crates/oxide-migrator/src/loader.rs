//! Loading SQL migrations from a directory.
//!
//! A migration named `NAME` is stored as `NAME.up.sql` and, if it can be
//! rolled back, `NAME.down.sql`. Dependencies are declared by comment lines
//! at the top of the up script:
//!
//! ```sql
//! -- depends_on: 0001_users, 0002_posts
//! CREATE TABLE comments (id INTEGER PRIMARY KEY);
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use crate::error::{MigrateError, Result};
use crate::migration::Migration;
use crate::registry::MigrationRegistry;

const UP_SUFFIX: &str = ".up.sql";
const DOWN_SUFFIX: &str = ".down.sql";
const DEPENDS_ON: &str = "depends_on:";

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new("^[A-Za-z0-9_]+$").expect("static regex is valid"))
}

#[derive(Default)]
struct ScriptPair {
    up: Option<PathBuf>,
    down: Option<PathBuf>,
}

impl MigrationRegistry {
    /// Builds a registry from the `.up.sql`/`.down.sql` files in `dir`.
    ///
    /// Migrations are registered in file-name order. Other files are ignored.
    pub fn load_directory(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(MigrateError::MigrationsDirNotFound(dir.to_path_buf()));
        }

        let mut pairs: BTreeMap<String, ScriptPair> = BTreeMap::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if let Some(name) = file_name.strip_suffix(UP_SUFFIX) {
                let name = checked_name(name, &path)?;
                pairs.entry(name).or_default().up = Some(path);
            } else if let Some(name) = file_name.strip_suffix(DOWN_SUFFIX) {
                let name = checked_name(name, &path)?;
                pairs.entry(name).or_default().down = Some(path);
            }
        }

        let mut registry = Self::new();
        for (name, pair) in pairs {
            let Some(up_path) = pair.up else {
                let path = pair.down.unwrap_or_else(|| dir.join(format!("{name}{DOWN_SUFFIX}")));
                return Err(MigrateError::ParseError {
                    path,
                    message: format!("no matching {name}{UP_SUFFIX}"),
                });
            };

            let up = fs::read_to_string(&up_path)?;
            let mut migration = Migration::sql(name.as_str(), up.as_str());
            for dependency in parse_dependencies(&up) {
                migration = migration.depends_on(dependency);
            }
            if let Some(down_path) = pair.down {
                migration = migration.down_sql(fs::read_to_string(down_path)?);
            }

            debug!(name = %name, reversible = migration.is_reversible(), "Loaded migration");
            registry.register(migration)?;
        }

        Ok(registry)
    }

    /// Writes an empty up/down pair for a new migration in `dir`.
    ///
    /// The name is prefixed with the next free four-digit number, e.g.
    /// `0003_add_email`. Returns the paths of both files.
    pub fn create_migration_files(dir: impl AsRef<Path>, name: &str) -> Result<(PathBuf, PathBuf)> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let full_name = format!("{:04}_{name}", next_number(dir)?);
        let up = dir.join(format!("{full_name}{UP_SUFFIX}"));
        checked_name(&full_name, &up)?;
        let down = dir.join(format!("{full_name}{DOWN_SUFFIX}"));

        for path in [&up, &down] {
            if path.exists() {
                return Err(MigrateError::MigrationExists(path.clone()));
            }
        }

        fs::write(&up, format!("-- Migration: {full_name}\n"))?;
        fs::write(&down, format!("-- Reverts: {full_name}\n"))?;
        Ok((up, down))
    }
}

fn checked_name(name: &str, path: &Path) -> Result<String> {
    if name_pattern().is_match(name) {
        Ok(name.to_string())
    } else {
        Err(MigrateError::ParseError {
            path: path.to_path_buf(),
            message: format!("invalid migration name '{name}'"),
        })
    }
}

/// Reads `-- depends_on:` lines from the leading comment block.
fn parse_dependencies(script: &str) -> Vec<String> {
    script
        .lines()
        .map(str::trim)
        .take_while(|line| line.is_empty() || line.starts_with("--"))
        .filter_map(|line| line.trim_start_matches('-').trim().strip_prefix(DEPENDS_ON))
        .flat_map(|list| list.split(','))
        .map(str::trim)
        .filter(|dep| !dep.is_empty())
        .map(str::to_string)
        .collect()
}

fn next_number(dir: &Path) -> Result<u32> {
    let mut highest = 0;
    for entry in fs::read_dir(dir)? {
        let file_name = entry?.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        let digits: String = file_name.chars().take_while(char::is_ascii_digit).collect();
        if let Ok(number) = digits.parse::<u32>() {
            highest = highest.max(number);
        }
    }
    Ok(highest + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::resolve;

    fn write(dir: &Path, file: &str, content: &str) {
        fs::write(dir.join(file), content).unwrap();
    }

    #[test]
    fn test_load_directory() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "0001_users.up.sql", "CREATE TABLE users (id INTEGER);");
        write(dir.path(), "0001_users.down.sql", "DROP TABLE users;");
        write(
            dir.path(),
            "0002_posts.up.sql",
            "-- depends_on: 0001_users\nCREATE TABLE posts (id INTEGER);",
        );
        write(dir.path(), "README.md", "not a migration");

        let registry = MigrationRegistry::load_directory(dir.path()).unwrap();
        assert_eq!(registry.len(), 2);

        let users = registry.get("0001_users").unwrap();
        assert!(users.is_reversible());
        assert!(users.dependencies().is_empty());

        let posts = registry.get("0002_posts").unwrap();
        assert!(!posts.is_reversible());
        assert_eq!(posts.dependencies(), ["0001_users"]);

        assert_eq!(resolve(&registry).unwrap(), ["0001_users", "0002_posts"]);
    }

    #[test]
    fn test_content_hash_covers_up_script() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "0001_users.up.sql", "CREATE TABLE users (id INTEGER);");
        let before = MigrationRegistry::load_directory(dir.path())
            .unwrap()
            .get("0001_users")
            .unwrap()
            .content_hash();

        write(dir.path(), "0001_users.up.sql", "CREATE TABLE users (id BIGINT);");
        let after = MigrationRegistry::load_directory(dir.path())
            .unwrap()
            .get("0001_users")
            .unwrap()
            .content_hash();

        assert_ne!(before, after);
    }

    #[test]
    fn test_parse_dependencies() {
        let script = "-- Adds comments\n--depends_on: a, b\n-- depends_on: c\n\nCREATE TABLE x (id INTEGER);\n-- depends_on: ignored";
        assert_eq!(parse_dependencies(script), ["a", "b", "c"]);
        assert!(parse_dependencies("CREATE TABLE x (id INTEGER);").is_empty());
    }

    #[test]
    fn test_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            MigrationRegistry::load_directory(&missing),
            Err(MigrateError::MigrationsDirNotFound(path)) if path == missing
        ));
    }

    #[test]
    fn test_down_without_up() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "0001_users.down.sql", "DROP TABLE users;");
        assert!(matches!(
            MigrationRegistry::load_directory(dir.path()),
            Err(MigrateError::ParseError { .. })
        ));
    }

    #[test]
    fn test_invalid_name() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "add users.up.sql", "CREATE TABLE users (id INTEGER);");
        assert!(matches!(
            MigrationRegistry::load_directory(dir.path()),
            Err(MigrateError::ParseError { message, .. }) if message.contains("add users")
        ));
    }

    #[test]
    fn test_create_migration_files() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("migrations");

        let (up, down) = MigrationRegistry::create_migration_files(&target, "users").unwrap();
        assert_eq!(up.file_name().unwrap(), "0001_users.up.sql");
        assert_eq!(down.file_name().unwrap(), "0001_users.down.sql");

        let (up, _) = MigrationRegistry::create_migration_files(&target, "posts").unwrap();
        assert_eq!(up.file_name().unwrap(), "0002_posts.up.sql");

        // Blank scripts load and run as no-ops.
        let registry = MigrationRegistry::load_directory(&target).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.get("0002_posts").unwrap().is_reversible());
    }

    #[test]
    fn test_create_rejects_bad_name() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            MigrationRegistry::create_migration_files(dir.path(), "add users"),
            Err(MigrateError::ParseError { .. })
        ));
    }
}
