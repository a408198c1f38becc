//! Worker subprocess main entry point.
//!
//! Runs when `axbridge worker` is invoked. Stdin carries request frames,
//! stdout carries response frames; nothing else may write to stdout.

use super::diagnostics::register_diagnostics;
use super::ipc::{LineReader, LineWriter};
use super::registry::OperationRegistry;
use super::worker::{EXECUTION_THREAD_NAME, LoopExit, run_loop, spawn_execution_thread};
use crate::error::{BridgeError, Result};
use std::io;
use tracing::{error, info};

/// Serve stdio frames with a registry built by `build`.
///
/// Both the registry and the loop live on the execution thread; `build`
/// runs there too, so native state it creates is bound to that thread.
pub fn run_worker_with<B>(build: B) -> Result<LoopExit>
where
    B: FnOnce(&mut OperationRegistry) -> Result<()> + Send + 'static,
{
    let handle = spawn_execution_thread(EXECUTION_THREAD_NAME, move || -> Result<LoopExit> {
        let mut registry = OperationRegistry::new();
        build(&mut registry)?;

        let mut reader = LineReader::new(io::stdin());
        let mut writer = LineWriter::new(io::stdout());
        Ok(run_loop(&registry, &mut reader, &mut writer)?)
    })?;

    handle
        .join()
        .map_err(|_| BridgeError::Worker("execution thread panicked".into()))?
}

/// Worker process entry point. Never returns.
///
/// Exit code 0 on shutdown or EOF, 1 on any error.
pub fn run_worker_main(diagnostics: bool) -> ! {
    let result = run_worker_with(move |registry| {
        if diagnostics {
            register_diagnostics(registry)?;
        }
        Ok(())
    });

    let code = match result {
        Ok(exit) => {
            info!(?exit, "Worker exiting");
            0
        }
        Err(e) => {
            error!(error = %e, "Worker failed");
            1
        }
    };
    std::process::exit(code)
}
