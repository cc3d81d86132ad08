//! `rebase-migrations`: fixes migration chains left conflicted by a rebase.
//!
//! Scans a project tree (or one app) for migration directories whose
//! `max_migration.txt` carries merge-conflict markers, then renumbers the
//! incoming migration after the existing one and rewrites the pointer.
//! `--dry-run` prints the plan without touching any file.
//!
//! Exit status: 0 when every unit is clean or resolved, 1 when any unit
//! failed (or the run was interrupted), 2 when the run could not start.

mod signals;
mod style;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use migration_rebase_core::config::{EngineConfig, OutputFormat, ScanMode};
use migration_rebase_core::engine::{RebaseEngine, Target};
use migration_rebase_core::models::RunMode;
use migration_rebase_core::report::Report;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// Resolve migration-number conflicts left behind by a rebase.
#[derive(Parser, Debug)]
#[command(
    name = "rebase-migrations",
    version,
    about = "Renumber conflicting migrations after a rebase and fix max_migration.txt"
)]
struct Cli {
    /// Project root to scan for migration directories.
    #[arg(short, long, default_value = ".")]
    path: PathBuf,

    /// Process a single app (its directory or its migrations directory)
    /// instead of scanning.
    #[arg(long, conflicts_with = "all_dirs")]
    app_path: Option<PathBuf>,

    /// Show what would change without writing anything.
    #[arg(long)]
    dry_run: bool,

    /// Walk every directory, including build/vendor directories and chain
    /// directories not named `migrations`.
    #[arg(long)]
    all_dirs: bool,

    /// Output format.
    #[arg(long, value_enum)]
    format: Option<FormatArg>,

    /// Shorthand for `--format json`.
    #[arg(long, conflicts_with = "format")]
    json: bool,

    /// Units processed in parallel (0 = number of CPUs).
    #[arg(short, long)]
    workers: Option<usize>,

    /// Optional TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter for stderr (e.g. `info`, `migration_rebase_core=debug`).
    /// Overrides RUST_LOG.
    #[arg(long)]
    log_level: Option<String>,

    /// Disable coloured output.
    #[arg(long)]
    no_color: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Table,
    Json,
}

impl From<FormatArg> for OutputFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Table => OutputFormat::Table,
            FormatArg::Json => OutputFormat::Json,
        }
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match &cli.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    if cli.no_color {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    match run(cli).await {
        Ok(report) if report.has_failures() => ExitCode::from(1),
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<Report> {
    let config = build_config(&cli)?;
    let format = config.output.format;
    let color = config.output.color && console::colors_enabled();

    let target = match &cli.app_path {
        Some(app) => Target::unit(app, &config.layout),
        None => Target::tree(&cli.path),
    }
    .context("invalid target")?;
    let mode = if cli.dry_run {
        RunMode::Preview
    } else {
        RunMode::Apply
    };

    let engine = RebaseEngine::new(config)
        .context("invalid configuration")?
        .with_shutdown(signals::setup_signal_handlers());
    let report = engine.run(&target, mode).await.context("run failed")?;

    println!("{}", report.render(format, color)?);
    if format == OutputFormat::Table {
        print_status(&report);
    }
    Ok(report)
}

/// Layer configuration: defaults, then the file, then the environment, then
/// command-line flags.
fn build_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load_from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => EngineConfig::default(),
    };
    config
        .apply_env_overrides()
        .context("invalid environment override")?;

    if cli.all_dirs {
        config.scan.mode = ScanMode::Exhaustive;
    }
    if let Some(workers) = cli.workers {
        config.run.workers = workers;
    }
    if cli.json {
        config.output.format = OutputFormat::Json;
    } else if let Some(format) = cli.format {
        config.output.format = format.into();
    }
    if cli.no_color {
        config.output.color = false;
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn print_status(report: &Report) {
    let s = &report.summary;
    if report.cancelled {
        eprintln!(
            "{}",
            style::warn("interrupted: remaining units were not processed")
        );
    }
    if report.has_failures() {
        eprintln!(
            "{}",
            style::error(&format!(
                "{} unit(s) need manual attention",
                s.malformed + s.unsupported + s.errors
            ))
        );
    } else if s.resolved == 0 {
        eprintln!("{}", style::success("no migration conflicts found"));
    } else if report.mode == RunMode::Preview {
        eprintln!(
            "{} {}",
            style::success(&format!("{} unit(s) can be resolved", s.resolved)),
            style::dim("(run without --dry-run to apply)")
        );
    } else {
        eprintln!(
            "{}",
            style::success(&format!("{} unit(s) resolved", s.resolved))
        );
    }
}
