//! oxide-migrator CLI
//!
//! Command-line tool for applying SQL migrations from a directory.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use oxide_migrator::prelude::*;

/// Versioned schema migrations for SQLite and PostgreSQL.
#[derive(Parser)]
#[command(name = "oxide-migrator")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Database URL (`postgres://...` or `sqlite:path`).
    #[arg(short, long, env = "DATABASE_URL", default_value = "sqlite:db.sqlite3")]
    database: String,

    /// Prefix of the tracking table (`<prefix>_migrations`).
    #[arg(short, long, env = "MIGRATIONS_TABLE_PREFIX")]
    table_prefix: Option<String>,

    /// Migrations directory.
    #[arg(short, long, default_value = "migrations")]
    migrations_dir: PathBuf,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the tracking table.
    Init,

    /// Apply pending migrations.
    Up {
        /// Stop after this migration (all if not specified).
        #[arg(short, long)]
        target: Option<String>,
    },

    /// Roll back the most recently applied migrations.
    Down {
        /// Number of migrations to roll back.
        #[arg(short, long, default_value_t = 1)]
        count: usize,
    },

    /// Show migration status.
    Status,

    /// Show the migrations `up` would apply, without applying them.
    Plan {
        /// Stop after this migration (all if not specified).
        #[arg(short, long)]
        target: Option<String>,
    },

    /// Create an empty migration file pair.
    New {
        /// Migration name/description.
        name: String,
    },

    /// Drop every table in the database.
    Reset {
        /// Must be `delete-all`.
        #[arg(long)]
        confirm: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Commands::New { name } = &cli.command {
        let (up, down) = MigrationRegistry::create_migration_files(&cli.migrations_dir, name)?;
        info!("Created migration: {}", up.display());
        info!("Created migration: {}", down.display());
        return Ok(());
    }

    let config = MigratorConfig::from_url(&cli.database, cli.table_prefix.as_deref())?;
    let registry = if cli.migrations_dir.is_dir() {
        MigrationRegistry::load_directory(&cli.migrations_dir)?
    } else {
        warn!(
            "Migrations directory {} not found, no migrations registered",
            cli.migrations_dir.display()
        );
        MigrationRegistry::new()
    };

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after rollback of the current migration");
            ctrl_c.cancel();
        }
    });

    let mut migrator = Migrator::from_config(&config, registry)?.with_cancellation(cancel);
    let result = run(&mut migrator, cli.command).await;
    migrator.close().await;
    result
}

async fn run(migrator: &mut Migrator, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Init => {
            info!("Initializing migrations system...");
            migrator.init().await?;
            info!("Table {} ready.", migrator.table_name());
        }

        Commands::Up { target } => {
            let report = migrator.up(target.as_deref()).await?;
            for name in report.skipped() {
                info!("Skipped {name}: already applied by another process");
            }
            let report = report.into_result()?;
            info!("Applied {} migration(s).", report.applied().len());
        }

        Commands::Down { count } => {
            let report = migrator.down(count).await?.into_result()?;
            info!("Rolled back {} migration(s).", report.rolled_back().len());
        }

        Commands::Status => {
            let entries = migrator.status().await?;

            if entries.is_empty() {
                info!("No migrations found.");
            } else {
                println!("\nMigrations:");
                println!("{:-<60}", "");

                for entry in &entries {
                    match &entry.status {
                        MigrationStatus::Applied { executed_at } => println!(
                            " [X] {} ({})",
                            entry.name,
                            executed_at.format("%Y-%m-%d %H:%M:%S")
                        ),
                        MigrationStatus::Pending => println!(" [ ] {}", entry.name),
                        MigrationStatus::Drifted { executed_at } => println!(
                            " [!] {} ({}, changed since applied)",
                            entry.name,
                            executed_at.format("%Y-%m-%d %H:%M:%S")
                        ),
                        MigrationStatus::Orphaned { executed_at } => println!(
                            " [?] {} ({}, no longer registered)",
                            entry.name,
                            executed_at.format("%Y-%m-%d %H:%M:%S")
                        ),
                    }
                }
                println!();
            }
        }

        Commands::Plan { target } => {
            let pending = migrator.plan(target.as_deref()).await?;
            if pending.is_empty() {
                info!("Nothing to apply.");
            } else {
                for name in pending {
                    println!("{name}");
                }
            }
        }

        Commands::Reset { confirm } => {
            let dropped = migrator.reset_database(&confirm).await?;
            info!("Dropped {} table(s).", dropped.len());
        }

        Commands::New { .. } => {}
    }

    Ok(())
}
