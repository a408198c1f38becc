//! Command-line interface definitions using clap.

use axbridge::dispatch::DEFAULT_TIMEOUT_SECS;
use axbridge::logging::{LogConfig, LogFormat};
use clap::{Parser, Subcommand};
use tracing::Level;

/// Process-isolated dispatcher for a single-threaded accessibility API.
#[derive(Parser, Debug)]
#[command(name = "axbridge")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose logging (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log errors.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR", global = true)]
    pub no_color: bool,

    /// Log format: pretty, compact, json.
    #[arg(long, env = "AXB_LOG_FORMAT", global = true)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run as a worker: serve frames on stdin/stdout.
    Worker(WorkerArgs),

    /// Start a worker, dispatch one operation, print the response.
    Call(CallArgs),

    /// Start a worker and list the operations it registers.
    Ops(OpsArgs),
}

/// Arguments for the worker command.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Register the diagnostic operations (Ping, Echo, Sleep, Exit).
    #[arg(long)]
    pub diagnostics: bool,
}

/// Arguments for the call command.
#[derive(Parser, Debug)]
pub struct CallArgs {
    /// Operation name (exact, case-sensitive).
    pub operation: String,

    /// Parameters as a JSON object.
    #[arg(short, long, default_value = "{}")]
    pub params: String,

    /// Seconds to wait for the response.
    #[arg(short, long, default_value_t = DEFAULT_TIMEOUT_SECS, allow_negative_numbers = true)]
    pub timeout: i64,

    /// Start the worker with the diagnostic operations.
    #[arg(long)]
    pub diagnostics: bool,

    /// Dispatch the call this many times on the same worker.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub repeat: u32,
}

/// Arguments for the ops command.
#[derive(Parser, Debug)]
pub struct OpsArgs {
    /// Start the worker with the diagnostic operations.
    #[arg(long)]
    pub diagnostics: bool,
}

impl Cli {
    /// Logging configuration for this invocation.
    ///
    /// `-v`/`-q` set an explicit filter, which wins over the environment.
    pub fn log_config(&self) -> LogConfig {
        let mut config = match self.command {
            Commands::Worker(_) => LogConfig::for_worker(),
            _ => LogConfig::for_cli(),
        };
        let level = match (self.quiet, self.verbose) {
            (true, _) => Some(Level::ERROR),
            (false, 0) => None,
            (false, 1) => Some(Level::INFO),
            (false, 2) => Some(Level::DEBUG),
            (false, _) => Some(Level::TRACE),
        };
        if let Some(level) = level {
            config = config.with_filter(level.to_string().to_lowercase());
        }
        config = config.with_env_overrides();
        if let Some(format) = self.log_format {
            config = config.with_format(format);
        }
        config.with_ansi(!self.no_color)
    }
}
