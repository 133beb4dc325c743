mod report;

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use strata_common::{Error, Target};
use strata_config::{ConfigLoader, MigrateConfig};
use strata_db::{MigrationRunner, open_database};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "strata", version, about = "Versioned schema migrations for SQLite")]
struct Cli {
    /// Config file (YAML or TOML). Defaults to ~/.strata/config.yml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database to migrate.
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Directory holding the migration scripts.
    #[arg(long, global = true)]
    migrations: Option<PathBuf>,

    /// Log at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Move the schema to TARGET (a version number or `latest`).
    Migrate { target: Option<Target> },
    /// Show the migrations `migrate` would run, without running them.
    Plan { target: Option<Target> },
    /// Show the current and latest versions.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// List every recorded upgrade and downgrade.
    History {
        #[arg(long)]
        json: bool,
    },
    /// Check applied scripts against the checksums recorded when they ran.
    Verify,
    /// Record VERSION as current without running anything. Clears a dirty schema.
    ForceVersion { version: u32 },
    /// Remove a lock left behind by a crashed run.
    Unlock,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Ok(path) = dotenvy::dotenv() {
        debug!("loaded environment from {}", path.display());
    }

    let config = load_config(&cli)?;
    run(cli.command, &config)
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// File and environment first, then command-line flags on top.
fn load_config(cli: &Cli) -> Result<MigrateConfig> {
    let mut config = ConfigLoader::load(cli.config.as_deref()).context("failed to load config")?;
    if let Some(database) = &cli.database {
        config.database_path = Some(database.clone());
    }
    if let Some(migrations) = &cli.migrations {
        config.repository_path = migrations.clone();
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn run(command: Command, config: &MigrateConfig) -> Result<()> {
    let Some(db_path) = config.database_path.as_deref() else {
        bail!("no database configured; pass --database or set STRATA_DATABASE");
    };

    let runner = MigrationRunner::from_config(config).with_context(|| {
        format!(
            "failed to load migrations from {}",
            config.repository_path.display()
        )
    })?;
    let conn = open_database(db_path, config.lock_timeout())
        .with_context(|| format!("failed to open {}", db_path.display()))?;

    match command {
        Command::Migrate { target } => {
            let target = target.unwrap_or(config.target_version);
            info!("migrating {} to {target}", db_path.display());
            let applied = runner
                .migrate(&conn, target)
                .map_err(|e| explain(&runner, e))?;
            let version = runner.version_store().current_version(&conn)?;
            report::print_applied(&applied, version);
        }
        Command::Plan { target } => {
            let plan = runner
                .plan(&conn, target.unwrap_or(config.target_version))
                .map_err(|e| explain(&runner, e))?;
            report::print_plan(&plan);
        }
        Command::Status { json } => {
            report::print_status(&runner.status(&conn)?, json)?;
        }
        Command::History { json } => {
            report::print_history(&runner.history(&conn)?, json)?;
        }
        Command::Verify => {
            let mismatches = runner.verify(&conn)?;
            report::print_mismatches(&mismatches);
            if !mismatches.is_empty() {
                bail!("{} migration(s) changed after being applied", mismatches.len());
            }
        }
        Command::ForceVersion { version } => {
            runner.force_version(&conn, version)?;
            println!("Schema version set to {version}.");
        }
        Command::Unlock => {
            let holder = runner.lock_manager().holder(&conn)?;
            if runner.force_unlock(&conn)? {
                match holder {
                    Some(h) => println!(
                        "Released migration lock held by pid {} since {} (owner {}).",
                        h.pid,
                        h.acquired_at.format("%Y-%m-%d %H:%M:%S UTC"),
                        h.owner
                    ),
                    None => println!("Migration lock released."),
                }
            } else {
                println!("No migration lock was held.");
            }
        }
    }
    Ok(())
}

/// Attach the unit's own reason to a refused downgrade.
fn explain(runner: &MigrationRunner, err: Error) -> anyhow::Error {
    let blocker = match &err {
        Error::DowngradeUnsupported(version) => runner
            .repository()
            .unit_at(*version)
            .ok()
            .and_then(|unit| Some((unit.name(), unit.downgrade_blocker()?.to_string()))),
        _ => None,
    };
    match blocker {
        Some((name, reason)) => {
            anyhow::Error::new(err).context(format!("{name} cannot be reverted: {reason}"))
        }
        None => err.into(),
    }
}
