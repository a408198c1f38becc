//! Process handle for worker subprocesses.
//!
//! Owns the `Child` and its exit status. The pipes are handed to the
//! dispatcher at spawn time; this handle only deals with process lifetime.

use super::signals::TerminationReason;
use crate::error::{BridgeError, Result};
use std::process::{Child, ExitStatus};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Poll interval while waiting for a worker to exit.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Grace period between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_millis(200);

/// Handle to a running (or reaped) worker process.
pub struct WorkerProc {
    child: Child,
    pid: u32,
    status: Option<ExitStatus>,
}

impl WorkerProc {
    pub fn new(child: Child) -> Self {
        let pid = child.id();
        Self {
            child,
            pid,
            status: None,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Check for exit without blocking. Caches the status once reaped.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        let status = self
            .child
            .try_wait()
            .map_err(|e| BridgeError::Worker(format!("waitpid failed: {}", e)))?;
        self.status = status;
        Ok(status)
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }

    /// Poll for exit for up to `timeout`.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<ExitStatus>> {
        let start = Instant::now();
        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(Some(status));
            }
            if start.elapsed() >= timeout {
                return Ok(None);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// How the process ended, or `StillAlive`.
    pub fn termination_reason(&mut self) -> TerminationReason {
        match self.try_wait() {
            Ok(Some(status)) => TerminationReason::from_exit_status(status),
            Ok(None) => TerminationReason::StillAlive,
            Err(_) => TerminationReason::Unknown,
        }
    }

    /// Ask the process to terminate (SIGTERM on unix).
    #[cfg(unix)]
    pub fn terminate(&mut self) -> Result<()> {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        if self.status.is_some() {
            return Ok(());
        }
        let pid = i32::try_from(self.pid)
            .map_err(|_| BridgeError::Worker(format!("pid {} out of range", self.pid)))?;
        signal::kill(Pid::from_raw(pid), Signal::SIGTERM)
            .map_err(|e| BridgeError::Worker(format!("Failed to send SIGTERM: {}", e)))
    }

    /// Ask the process to terminate. Without signals this is a kill.
    #[cfg(not(unix))]
    pub fn terminate(&mut self) -> Result<()> {
        self.kill()
    }

    /// Kill the process and reap it.
    pub fn kill(&mut self) -> Result<()> {
        if self.status.is_some() {
            return Ok(());
        }
        self.child
            .kill()
            .map_err(|e| BridgeError::Worker(format!("Failed to kill worker: {}", e)))?;
        let status = self
            .child
            .wait()
            .map_err(|e| BridgeError::Worker(format!("waitpid failed: {}", e)))?;
        self.status = Some(status);
        Ok(())
    }

    /// Wait for a requested shutdown, then escalate.
    ///
    /// The caller sends the shutdown frame first; this waits up to `timeout`
    /// for the process to exit, then terminates it, then kills it.
    pub fn stop(&mut self, timeout: Duration) -> Result<TerminationReason> {
        if let Some(status) = self.wait_timeout(timeout)? {
            return Ok(TerminationReason::from_exit_status(status));
        }

        warn!(pid = self.pid, ?timeout, "Worker did not exit after shutdown, terminating");
        let _ = self.terminate();
        if let Some(status) = self.wait_timeout(TERM_GRACE)? {
            return Ok(TerminationReason::from_exit_status(status));
        }

        warn!(pid = self.pid, "Worker ignored SIGTERM, killing");
        self.kill()?;
        Ok(self.termination_reason())
    }
}

impl Drop for WorkerProc {
    fn drop(&mut self) {
        if self.status.is_none() && self.is_running() {
            debug!(pid = self.pid, "Killing worker on drop");
            let _ = self.kill();
        }
    }
}
