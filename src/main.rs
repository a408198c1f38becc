//! axbridge - process-isolated dispatch of accessibility operations

mod cli;

use anyhow::{Context, Result, bail};
use axbridge::dispatch::{Parameters, Supervisor, SupervisorConfig, run_worker_main};
use axbridge::logging;
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};
use serde_json::Value;
use std::io::Write;

use cli::{CallArgs, Cli, Commands, OpsArgs};

/// Exit code when a dispatched call completed with `success == false`.
const EXIT_DISPATCH_FAILED: i32 = 2;

/// Parses arguments, runs the selected command, and prints the error chain
/// on failure before exiting with status 1.
fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }
    logging::init(cli.log_config());

    let result = match &cli.command {
        Commands::Worker(args) => run_worker_main(args.diagnostics),
        Commands::Call(args) => cmd_call(args),
        Commands::Ops(args) => cmd_ops(args),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!(
                "{}: {}",
                "error"
                    .if_supports_color(Stderr, |text| text.red())
                    .if_supports_color(Stderr, |text| text.bold()),
                e
            );
            for cause in e.chain().skip(1) {
                eprintln!(
                    "  {}: {}",
                    "caused by".if_supports_color(Stderr, |text| text.yellow()),
                    cause
                );
            }
            std::process::exit(1);
        }
    }
}

fn supervisor_config(diagnostics: bool) -> SupervisorConfig {
    SupervisorConfig::default()
        .with_diagnostics(diagnostics)
        .with_env_overrides()
}

fn parse_params(raw: &str) -> Result<Parameters> {
    let value: Value = serde_json::from_str(raw).context("--params is not valid JSON")?;
    match value {
        Value::Object(map) => Ok(map),
        other => bail!("--params must be a JSON object, got {}", other),
    }
}

/// Dispatch one operation (possibly repeatedly) and print each response
/// envelope as a JSON line.
fn cmd_call(args: &CallArgs) -> Result<i32> {
    let params = parse_params(&args.params)?;
    let supervisor =
        Supervisor::start(supervisor_config(args.diagnostics)).context("Failed to start worker")?;

    let mut failed = false;
    let mut stdout = std::io::stdout().lock();
    for _ in 0..args.repeat {
        let result = supervisor.execute(&args.operation, params.clone(), args.timeout);
        failed |= !result.is_success();
        writeln!(stdout, "{}", serde_json::to_string(&result.to_envelope())?)?;
    }
    stdout.flush()?;

    supervisor.stop_worker();
    Ok(if failed { EXIT_DISPATCH_FAILED } else { 0 })
}

/// List the operations announced in the worker's readiness handshake.
fn cmd_ops(args: &OpsArgs) -> Result<i32> {
    let supervisor =
        Supervisor::start(supervisor_config(args.diagnostics)).context("Failed to start worker")?;

    let mut stdout = std::io::stdout().lock();
    for name in supervisor.operations() {
        writeln!(stdout, "{}", name)?;
    }
    stdout.flush()?;

    supervisor.stop_worker();
    Ok(0)
}
