//! Worker subprocess spawning.
//!
//! The worker is normally this same executable started with the `worker`
//! subcommand. Its stdin and stdout carry the frame channel; stderr is
//! inherited so worker logs land next to the parent's.

use super::proc::WorkerProc;
use crate::error::{BridgeError, Result};
use std::path::PathBuf;
use std::process::{ChildStdin, ChildStdout, Command, Stdio};
use tracing::debug;

/// Subcommand that puts the binary into worker mode.
pub const WORKER_SUBCOMMAND: &str = "worker";

/// Program and arguments used to start a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// `<program> worker [--diagnostics]`.
    pub fn worker(program: impl Into<PathBuf>, diagnostics: bool) -> Self {
        let mut cmd = Self::new(program).arg(WORKER_SUBCOMMAND);
        if diagnostics {
            cmd = cmd.arg("--diagnostics");
        }
        cmd
    }

    /// Worker command for the currently running executable.
    pub fn current_exe(diagnostics: bool) -> Result<Self> {
        let exe = std::env::current_exe().map_err(|e| {
            BridgeError::Worker(format!("Failed to get current executable: {}", e))
        })?;
        Ok(Self::worker(exe, diagnostics))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// A freshly spawned worker and its channel ends.
pub struct SpawnedWorker {
    pub proc: WorkerProc,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

/// Spawn a worker subprocess with piped stdin/stdout.
pub fn spawn_worker(command: &WorkerCommand) -> Result<SpawnedWorker> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());

    let mut child = cmd.spawn().map_err(|e| {
        BridgeError::Worker(format!(
            "Failed to spawn worker {}: {}",
            command.program.display(),
            e
        ))
    })?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| BridgeError::Worker("Child stdin not captured".into()));
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| BridgeError::Worker("Child stdout not captured".into()));
    // Wrap first so a missing pipe still reaps the child on drop.
    let proc = WorkerProc::new(child);
    let (stdin, stdout) = (stdin?, stdout?);

    debug!(pid = proc.pid(), program = %command.program.display(), args = ?command.args, "Spawned worker");
    Ok(SpawnedWorker {
        proc,
        stdin,
        stdout,
    })
}
