//! End-to-end runs against a SQLite file, with migrations loaded from disk.

use std::fs;
use std::path::Path;

use oxide_migrator::prelude::*;

fn write(dir: &Path, file: &str, content: &str) {
    fs::write(dir.join(file), content).expect("Failed to write migration file");
}

fn blog_migrations(dir: &Path) {
    write(
        dir,
        "0001_users.up.sql",
        "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT NOT NULL UNIQUE);",
    );
    write(dir, "0001_users.down.sql", "DROP TABLE users;");
    write(
        dir,
        "0002_posts.up.sql",
        "-- depends_on: 0001_users\n\
         CREATE TABLE posts (\n\
             id INTEGER PRIMARY KEY,\n\
             author_id INTEGER NOT NULL REFERENCES users (id),\n\
             title TEXT NOT NULL\n\
         );",
    );
    write(dir, "0002_posts.down.sql", "DROP TABLE posts;");
    write(
        dir,
        "0003_tags.up.sql",
        "-- depends_on: 0001_users\nCREATE TABLE tags (id INTEGER PRIMARY KEY, label TEXT NOT NULL);",
    );
    write(dir, "0003_tags.down.sql", "DROP TABLE tags;");
}

fn open_migrator(db: &Path, migrations: &Path, prefix: Option<&str>) -> Migrator {
    let url = format!("sqlite:{}", db.display());
    let config = MigratorConfig::from_url(&url, prefix).expect("valid config");
    let registry = MigrationRegistry::load_directory(migrations).expect("loadable migrations");
    Migrator::from_config(&config, registry).expect("valid driver")
}

#[tokio::test]
async fn test_apply_status_and_roll_back_from_directory() {
    let dir = tempfile::tempdir().unwrap();
    let migrations = dir.path().join("migrations");
    fs::create_dir(&migrations).unwrap();
    blog_migrations(&migrations);
    let db = dir.path().join("blog.sqlite3");

    let mut migrator = open_migrator(&db, &migrations, Some("blog"));
    assert_eq!(
        migrator.plan(None).await.unwrap(),
        ["0001_users", "0002_posts", "0003_tags"]
    );

    let report = migrator.up(None).await.unwrap().into_result().unwrap();
    assert_eq!(report.applied(), ["0001_users", "0002_posts", "0003_tags"]);
    migrator.close().await;

    // A fresh process sees the same state.
    let mut migrator = open_migrator(&db, &migrations, Some("blog"));
    assert!(migrator.pending().await.unwrap().is_empty());
    assert!(migrator.up(None).await.unwrap().outcomes().is_empty());

    let status = migrator.status().await.unwrap();
    assert_eq!(status.len(), 3);
    assert!(status
        .iter()
        .all(|entry| matches!(entry.status, MigrationStatus::Applied { .. })));

    let report = migrator.down(2).await.unwrap().into_result().unwrap();
    assert_eq!(report.rolled_back(), ["0003_tags", "0002_posts"]);
    assert_eq!(migrator.applied().await.unwrap(), ["0001_users"]);
    migrator.close().await;
}

#[tokio::test]
async fn test_edited_migration_shows_as_drifted() {
    let dir = tempfile::tempdir().unwrap();
    let migrations = dir.path().join("migrations");
    fs::create_dir(&migrations).unwrap();
    blog_migrations(&migrations);
    let db = dir.path().join("blog.sqlite3");

    let mut migrator = open_migrator(&db, &migrations, None);
    migrator.up(Some("0001_users")).await.unwrap();
    migrator.close().await;

    write(
        &migrations,
        "0001_users.up.sql",
        "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT);",
    );
    let mut migrator = open_migrator(&db, &migrations, None);
    let status = migrator.status().await.unwrap();

    assert_eq!(status[0].name, "0001_users");
    assert!(matches!(status[0].status, MigrationStatus::Drifted { .. }));
    assert_eq!(status[1].status, MigrationStatus::Pending);
    migrator.close().await;
}

#[tokio::test]
async fn test_cycle_in_directory_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.up.sql", "-- depends_on: b\nSELECT 1;");
    write(dir.path(), "b.up.sql", "-- depends_on: a\nSELECT 1;");
    let db = dir.path().join("cycle.sqlite3");

    let mut migrator = open_migrator(&db, dir.path(), None);
    match migrator.up(None).await {
        Err(MigrateError::CyclicDependency { cycle }) => {
            assert_eq!(cycle.len(), 2);
            assert!(cycle.contains(&"a".to_string()));
            assert!(cycle.contains(&"b".to_string()));
        }
        other => panic!("expected a cycle, got {other:?}"),
    }
}

#[tokio::test]
async fn test_reset_drops_everything() {
    let dir = tempfile::tempdir().unwrap();
    let migrations = dir.path().join("migrations");
    fs::create_dir(&migrations).unwrap();
    blog_migrations(&migrations);
    let db = dir.path().join("blog.sqlite3");

    let mut migrator = open_migrator(&db, &migrations, None);
    migrator.up(None).await.unwrap();

    assert!(matches!(
        migrator.reset_database("delete").await,
        Err(MigrateError::ResetNotConfirmed)
    ));

    let mut dropped = migrator.reset_database(RESET_CONFIRMATION).await.unwrap();
    dropped.sort();
    assert_eq!(dropped, ["migrations", "posts", "tags", "users"]);
    assert_eq!(migrator.pending().await.unwrap().len(), 3);
    migrator.close().await;
}
