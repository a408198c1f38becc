//! Crash analysis for worker subprocesses.
//!
//! Turns a worker's exit status into a reason that can be logged and folded
//! into the `SessionFatal` message seen by callers.

use std::process::ExitStatus;

/// Reason why a worker process terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by a signal (raw signal number).
    Signaled(i32),
    /// SIGKILL: the OOM killer, or a forced stop.
    Killed,
    /// SIGSEGV or SIGBUS, typically a stack overflow in native code.
    Segfault,
    /// Process is still running.
    StillAlive,
    Unknown,
}

impl TerminationReason {
    /// Classify an exit status as reported by `std::process::Child`.
    pub fn from_exit_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Exited(code);
        }
        #[cfg(unix)]
        {
            use nix::sys::signal::Signal;
            use std::os::unix::process::ExitStatusExt;

            if let Some(raw) = status.signal() {
                return match Signal::try_from(raw) {
                    Ok(Signal::SIGKILL) => Self::Killed,
                    Ok(Signal::SIGSEGV) | Ok(Signal::SIGBUS) => Self::Segfault,
                    _ => Self::Signaled(raw),
                };
            }
        }
        Self::Unknown
    }

    /// A clean, requested shutdown.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Whether the worker died on its own rather than exiting cleanly.
    pub fn is_crash(&self) -> bool {
        !matches!(self, Self::Exited(0) | Self::StillAlive)
    }

    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(raw) => format!("killed by signal {}", signal_name(*raw)),
            Self::Killed => "killed (SIGKILL)".to_string(),
            Self::Segfault => "crashed with a memory fault (SIGSEGV/SIGBUS)".to_string(),
            Self::StillAlive => "still running".to_string(),
            Self::Unknown => "terminated for an unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[cfg(unix)]
fn signal_name(raw: i32) -> String {
    match nix::sys::signal::Signal::try_from(raw) {
        Ok(signal) => signal.as_str().to_string(),
        Err(_) => raw.to_string(),
    }
}

#[cfg(not(unix))]
fn signal_name(raw: i32) -> String {
    raw.to_string()
}

/// Information about a worker failure.
#[derive(Debug, Clone)]
pub struct WorkerFailure {
    pub pid: u32,
    pub reason: TerminationReason,
    /// Why the failure was noticed (e.g. channel closed).
    pub context: Option<String>,
}

impl WorkerFailure {
    pub fn new(pid: u32, reason: TerminationReason) -> Self {
        Self {
            pid,
            reason,
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

impl std::fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Worker {} {}", self.pid, self.reason)?;
        if let Some(ctx) = &self.context {
            write!(f, ": {}", ctx)?;
        }
        Ok(())
    }
}
