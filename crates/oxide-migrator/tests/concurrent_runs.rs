//! Two runners racing on the same SQLite file.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use oxide_migrator::prelude::*;

struct SlowCreate;

#[async_trait]
impl MigrationHandler for SlowCreate {
    async fn run(&self, ctx: &mut MigrationContext<'_>) -> anyhow::Result<()> {
        ctx.client()
            .execute_script("CREATE TABLE accounts (id INTEGER PRIMARY KEY)")
            .await?;
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(())
    }
}

fn open_migrator(db: &Path) -> Migrator {
    let url = format!("sqlite:{}", db.display());
    let config = MigratorConfig::from_url(&url, None).expect("valid config");
    let mut registry = MigrationRegistry::new();
    registry
        .register(Migration::new("a", SlowCreate))
        .expect("unique name");
    Migrator::from_config(&config, registry).expect("valid driver")
}

#[tokio::test]
async fn test_losing_runner_skips_instead_of_failing() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("race.sqlite3");

    let mut first = open_migrator(&db);
    let mut second = open_migrator(&db);
    first.init().await.unwrap();
    // Both runners see the migration as pending before either applies it.
    assert_eq!(first.pending().await.unwrap(), ["a"]);
    assert_eq!(second.pending().await.unwrap(), ["a"]);

    let (winner, loser) = tokio::join!(first.up(None), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        second.up(None).await
    });

    let winner = winner.unwrap();
    assert_eq!(winner.applied(), ["a"]);
    assert!(winner.is_success());

    let loser = loser.unwrap();
    assert!(loser.is_success(), "unexpected failure: {:?}", loser.failure());
    assert_eq!(loser.skipped(), ["a"]);
    assert!(loser.applied().is_empty());

    second.refresh().await.unwrap();
    assert_eq!(second.applied().await.unwrap(), ["a"]);
    first.close().await;
    second.close().await;
}
