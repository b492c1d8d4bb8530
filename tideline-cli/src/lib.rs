//! Tideline Migration CLI
//!
//! Command-line interface for applying, rolling back and inspecting
//! versioned schema migrations. Applications with code migrations embed it
//! by passing their own [`Registry`] to [`run`]:
//!
//! ```rust,no_run
//! use tideline::migration::Registry;
//!
//! fn main() -> std::process::ExitCode {
//!     let registry = Registry::new();
//!     // registry.register(Box::new(CreateUsersTable))?;
//!     tideline_cli::run(registry)
//! }
//! ```

pub mod commands;
pub mod scaffold;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use tideline::config::{Overrides, Settings, SourceKind};
use tideline::migration::{
    Backend, MigrationSet, MigrationSource, Migrator, PgBackend, Registry, Resolution,
    SqlDirectory,
};

#[derive(Debug, Parser)]
#[command(name = "tideline")]
#[command(about = "Versioned schema migrations for PostgreSQL")]
#[command(version)]
pub struct Cli {
    /// Configuration file (default: ./tideline.toml if present)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Database connection URL
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Migrations directory
    #[arg(long, global = true)]
    pub path: Option<PathBuf>,

    /// Migration source: sql files or registered code
    #[arg(long, global = true)]
    pub kind: Option<SourceKind>,

    /// Advisory lock key shared by every runner of this database
    #[arg(long, global = true)]
    pub lock_key: Option<i64>,

    /// Status ledger table, optionally schema-qualified
    #[arg(long, global = true)]
    pub status_table: Option<String>,

    /// Give up waiting for the migration lock after this many seconds
    #[arg(long = "lock-timeout", global = true, value_name = "SECONDS")]
    pub lock_timeout: Option<u64>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Quiet output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Print Prometheus metrics after the command
    #[arg(long, global = true)]
    pub metrics: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Commands {
    /// Apply every pending migration
    Up,

    /// Roll back the latest applied migration
    Down,

    /// Roll back the latest applied migration and apply it again
    Redo,

    /// Show applied, pending, failed and orphaned migrations
    Status {
        /// Emit the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the current schema version
    #[command(alias = "dbversion")]
    Version,

    /// Check stored checksums of applied migrations against the source
    Validate,

    /// Reconcile a migration left in the failed state
    Resolve {
        version: i64,

        /// Mark the failed migration applied, or reset it to pending
        #[arg(long = "as", value_enum, value_name = "STATE")]
        resolution: ResolveAs,
    },

    /// Generate a new empty migration
    Create {
        /// Migration name (e.g., "create_users_table")
        name: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ResolveAs {
    Applied,
    Pending,
}

impl From<ResolveAs> for Resolution {
    fn from(value: ResolveAs) -> Self {
        match value {
            ResolveAs::Applied => Resolution::Applied,
            ResolveAs::Pending => Resolution::Pending,
        }
    }
}

impl Cli {
    /// Flag values that win over the config file and environment
    pub fn overrides(&self) -> Overrides {
        Overrides {
            database_url: self.database_url.clone(),
            path: self.path.clone(),
            kind: self.kind,
            lock_key: self.lock_key,
            status_table: self.status_table.clone(),
            lock_timeout_seconds: self.lock_timeout,
        }
    }

    fn log_filter(&self) -> &'static str {
        if self.quiet {
            "error"
        } else if self.verbose {
            "debug"
        } else {
            "info"
        }
    }
}

/// Parse the command line, run it and report the outcome
pub fn run(registry: Registry) -> ExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(cli.log_filter()))
        .init();

    let stdout = io::stdout();
    let mut out = stdout.lock();
    match execute(&cli, &registry, &mut out) {
        Ok(()) => {
            if !cli.quiet {
                let _ = writeln!(out, "{}", "✅ Success".green());
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{} {e:#}", "❌ Error:".red().bold());
            ExitCode::FAILURE
        }
    }
}

/// Run `cli.command` against the configured database
pub fn execute(cli: &Cli, registry: &Registry, out: &mut dyn Write) -> Result<()> {
    let settings = Settings::load(cli.config.as_deref())
        .context("failed to load configuration")?
        .apply(cli.overrides());

    if let Commands::Create { name } = &cli.command {
        commands::create(out, &settings, name)?;
        return Ok(());
    }

    let settings = settings.validate().context("invalid configuration")?;
    let set = load_source(&settings, registry)?;
    log::debug!(
        "loaded {} migration(s) from {:?} source",
        set.len(),
        settings.kind
    );

    let backend = PgBackend::connect(&settings).context("failed to open the migration backend")?;
    let migrator = Migrator::new(backend).with_checksum_verification(settings.verify_checksums);
    dispatch(&cli.command, &migrator, &set, out)?;

    if cli.metrics {
        print_metrics(out)?;
    }
    Ok(())
}

/// Run a database command against any backend
pub fn dispatch<B: Backend>(
    command: &Commands,
    migrator: &Migrator<B>,
    set: &MigrationSet,
    out: &mut dyn Write,
) -> Result<()> {
    match command {
        Commands::Up => commands::up(out, migrator, set).map(|_| ()),
        Commands::Down => commands::down(out, migrator, set).map(|_| ()),
        Commands::Redo => commands::redo(out, migrator, set).map(|_| ()),
        Commands::Status { json } => commands::status(out, migrator, set, *json).map(|_| ()),
        Commands::Version => commands::version(out, migrator).map(|_| ()),
        Commands::Validate => commands::validate(out, migrator, set).map(|_| ()),
        Commands::Resolve {
            version,
            resolution,
        } => commands::resolve(out, migrator, *version, (*resolution).into()),
        Commands::Create { .. } => bail!("create does not run against the database"),
    }
}

/// The step source selected by `settings.kind`
pub fn load_source(settings: &Settings, registry: &Registry) -> Result<MigrationSet> {
    let set = match settings.kind {
        SourceKind::Sql => SqlDirectory::new(&settings.path)
            .load()
            .with_context(|| format!("failed to load migrations from {}", settings.path.display()))?,
        SourceKind::Code => registry.load()?,
    };
    Ok(set)
}

fn print_metrics(out: &mut dyn Write) -> Result<()> {
    let text = tideline::metrics::METRICS
        .encode_text()
        .context("failed to encode metrics")?;
    writeln!(out, "\n{text}")?;
    Ok(())
}
