//! Stencil CLI: serve, inspect, and manage cached templates from the
//! command line.
//!
//! Provides `stencil run` to render a template, `stencil show` and
//! `stencil list` to inspect the configured backends, and `stencil cache`
//! for cache maintenance.

#![warn(missing_docs)]

mod cache;
mod host;
mod list;
mod run;

use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter.
const LOG_ENV: &str = "STENCIL_LOG";

/// Stencil: compiled template serving with a persistent cache.
#[derive(Parser, Debug)]
#[command(name = "stencil", version, about = "Stencil template host")]
pub struct Cli {
    /// Suppress all output except errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Enable verbose (debug-level) output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to a `stencil.toml` configuration file.
    #[arg(long, global = true, env = "STENCIL_CONFIG")]
    pub config: Option<String>,

    /// The subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Render a template to standard output.
    Run(RunArgs),
    /// Print metadata of a compiled template.
    Show(ShowArgs),
    /// List template names.
    List(ListArgs),
    /// Manage the template cache.
    #[command(subcommand)]
    Cache(CacheCommand),
}

/// Arguments for the `stencil run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Template name.
    pub name: String,

    /// Variables passed to the template (`KEY=VALUE`, repeatable).
    #[arg(short, long = "env", value_parser = parse_env_pair)]
    pub env: Vec<(String, String)>,
}

/// Arguments for the `stencil show` subcommand.
#[derive(Parser, Debug)]
pub struct ShowArgs {
    /// Template name.
    pub name: String,

    /// Output format.
    #[arg(short, long, value_enum, default_value_t = ReportFormat::Text)]
    pub format: ReportFormat,
}

/// Arguments for the `stencil list` subcommand.
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Only list names matching this regular expression.
    #[arg(short, long)]
    pub pattern: Option<String>,
}

/// Cache maintenance commands.
#[derive(Subcommand, Debug)]
pub enum CacheCommand {
    /// Remove every cached artifact.
    Clear,
    /// Remove stale and over-budget artifacts.
    Sweep,
    /// Show cache occupancy.
    Status {
        /// Output format.
        #[arg(short, long, value_enum, default_value_t = ReportFormat::Text)]
        format: ReportFormat,
    },
    /// Compile templates into the cache ahead of use.
    Fetch {
        /// Names to fetch; all templates when omitted.
        names: Vec<String>,
    },
}

/// Report output format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    /// Human-readable terminal output.
    Text,
    /// Machine-readable JSON output.
    Json,
}

/// Global settings derived from CLI flags.
pub struct GlobalArgs {
    /// Whether to suppress non-error output.
    pub quiet: bool,
    /// Whether to print verbose/debug information.
    pub verbose: bool,
    /// Optional path to a configuration file.
    pub config: Option<String>,
}

/// Exit code: the operation succeeded.
pub const EXIT_OK: i32 = 0;
/// Exit code: the operation failed.
pub const EXIT_ERROR: i32 = 1;
/// Exit code: the template does not exist, or the backend has no cache.
pub const EXIT_ABSENT: i32 = 2;

fn main() {
    let cli = Cli::parse();

    let global = GlobalArgs {
        quiet: cli.quiet,
        verbose: cli.verbose,
        config: cli.config,
    };
    init_logging(&global);

    let result = match cli.command {
        Command::Run(ref args) => run::run(args, &global),
        Command::Show(ref args) => run::show(args, &global),
        Command::List(ref args) => list::run(args, &global),
        Command::Cache(ref command) => cache::run(command, &global),
    };

    match result {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(EXIT_ERROR);
        }
    }
}

/// Installs the stderr log subscriber.
///
/// `--verbose` and `--quiet` override the `STENCIL_LOG` filter.
fn init_logging(global: &GlobalArgs) {
    let filter = if global.verbose {
        EnvFilter::new("debug")
    } else if global.quiet {
        EnvFilter::new("error")
    } else {
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();
}

/// Parses a `KEY=VALUE` pair.
fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}
