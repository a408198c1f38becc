//! Worker lifecycle: start, crash handling, restart, stop.
//!
//! The supervisor owns at most one live worker session (a process plus the
//! dispatcher attached to its pipes). Callers go through
//! [`Supervisor::execute`], which hands the call to the current dispatcher.
//!
//! # Environment Variables
//!
//! - `AXB_WORKER_PATH` - Worker executable (default: the current executable)
//! - `AXB_STARTUP_TIMEOUT` - Seconds to wait for the readiness handshake
//! - `AXB_SHUTDOWN_TIMEOUT` - Seconds to wait for a clean exit before SIGTERM
//! - `AXB_RESTART` - `fail-loud`, `respawn` or `respawn:N`

use super::dispatcher::{DispatchResult, DispatchStats, Dispatcher, ExitProbe};
use super::proc::WorkerProc;
use super::protocol::Parameters;
use super::signals::{TerminationReason, WorkerFailure};
use super::spawn::{WorkerCommand, spawn_worker};
use crate::error::{BridgeError, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{error, info, warn};

/// Default time allowed for the readiness handshake.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time allowed for a clean exit after a shutdown frame.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Restart limit used by a bare `respawn` policy string.
pub const DEFAULT_MAX_RESTARTS: u32 = 3;

/// How long the reader waits for a closed worker to be reapable.
const EXIT_PROBE_WAIT: Duration = Duration::from_millis(500);

/// What happens after a worker crash.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Stay fatal until [`Supervisor::restart_worker`] is called.
    #[default]
    FailLoud,
    /// Start a fresh worker on the next call, at most `max_restarts` times.
    Respawn { max_restarts: u32 },
}

impl FromStr for RestartPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        match s.as_str() {
            "fail-loud" | "failloud" | "fail" => Ok(Self::FailLoud),
            "respawn" => Ok(Self::Respawn {
                max_restarts: DEFAULT_MAX_RESTARTS,
            }),
            _ => match s.strip_prefix("respawn:") {
                Some(n) => n
                    .parse()
                    .map(|max_restarts| Self::Respawn { max_restarts })
                    .map_err(|_| format!("Invalid restart limit: '{}'", n)),
                None => Err(format!(
                    "Unknown restart policy: '{}'. Valid options: fail-loud, respawn, respawn:N",
                    s
                )),
            },
        }
    }
}

impl std::fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FailLoud => write!(f, "fail-loud"),
            Self::Respawn { max_restarts } => write!(f, "respawn:{}", max_restarts),
        }
    }
}

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Worker executable (None = current executable).
    pub worker_program: Option<PathBuf>,
    /// Extra arguments appended after `worker [--diagnostics]`.
    pub worker_args: Vec<String>,
    pub startup_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub restart_policy: RestartPolicy,
    /// Register the diagnostic operations in the worker.
    pub diagnostics: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            worker_program: None,
            worker_args: Vec::new(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            restart_policy: RestartPolicy::FailLoud,
            diagnostics: false,
        }
    }
}

impl SupervisorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = Some(program.into());
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    pub fn with_diagnostics(mut self, enabled: bool) -> Self {
        self.diagnostics = enabled;
        self
    }

    /// Apply environment variable overrides.
    ///
    /// Invalid values are logged and ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(path) = std::env::var("AXB_WORKER_PATH")
            && !path.is_empty()
        {
            self.worker_program = Some(PathBuf::from(path));
        }
        if let Some(timeout) = env_seconds("AXB_STARTUP_TIMEOUT") {
            self.startup_timeout = timeout;
        }
        if let Some(timeout) = env_seconds("AXB_SHUTDOWN_TIMEOUT") {
            self.shutdown_timeout = timeout;
        }
        if let Ok(policy) = std::env::var("AXB_RESTART") {
            match policy.parse() {
                Ok(policy) => self.restart_policy = policy,
                Err(e) => warn!(error = %e, "Ignoring AXB_RESTART"),
            }
        }
        self
    }

    /// Command line used to start a worker.
    pub fn worker_command(&self) -> Result<WorkerCommand> {
        let mut command = match &self.worker_program {
            Some(program) => WorkerCommand::worker(program, self.diagnostics),
            None => WorkerCommand::current_exe(self.diagnostics)?,
        };
        command.args.extend(self.worker_args.iter().cloned());
        Ok(command)
    }
}

fn env_seconds(name: &str) -> Option<Duration> {
    let value = std::env::var(name).ok()?;
    let timeout = value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| *secs > 0.0)
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok());
    if timeout.is_none() {
        warn!(variable = name, value = %value, "Ignoring invalid timeout");
    }
    timeout
}

/// Supervisor counters and current worker identity.
#[derive(Debug, Clone, Default)]
pub struct SupervisorStats {
    pub running: bool,
    pub pid: Option<u32>,
    /// Every worker replacement, manual or automatic.
    pub restarts: u32,
    /// Automatic replacements under `Respawn`; only these count toward
    /// `max_restarts`.
    pub respawns: u32,
    pub operations: Vec<String>,
    /// Counters of the current session's dispatcher.
    pub dispatch: DispatchStats,
    pub last_failure: Option<String>,
}

struct Session {
    dispatcher: Arc<Dispatcher>,
    proc: Arc<Mutex<WorkerProc>>,
    pid: u32,
    crash_recorded: bool,
}

fn lock_proc(proc: &Mutex<WorkerProc>) -> MutexGuard<'_, WorkerProc> {
    proc.lock().unwrap_or_else(|e| e.into_inner())
}

/// Reported to callers that arrive while a replacement worker is starting.
const RESTARTING: &str = "Worker is restarting";

/// Clears the launch flag when a launch attempt ends.
struct LaunchGuard<'a>(&'a AtomicBool);

impl Drop for LaunchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Owns the worker process and routes calls to it.
///
/// The session lock is only held to read or swap the session. Starting a
/// worker (which can take up to the startup timeout) happens outside it, with
/// `launching` set so concurrent callers are refused instead of waiting.
pub struct Supervisor {
    config: SupervisorConfig,
    session: Mutex<Option<Session>>,
    launching: AtomicBool,
    restarts: AtomicU32,
    respawns: AtomicU32,
    last_failure: Mutex<Option<WorkerFailure>>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            session: Mutex::new(None),
            launching: AtomicBool::new(false),
            restarts: AtomicU32::new(0),
            respawns: AtomicU32::new(0),
            last_failure: Mutex::new(None),
        }
    }

    /// Create a supervisor and start its worker.
    pub fn start(config: SupervisorConfig) -> Result<Self> {
        let supervisor = Self::new(config);
        supervisor.start_worker()?;
        Ok(supervisor)
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim the launch flag. Call with the session lock held.
    fn begin_launch(&self) -> Option<LaunchGuard<'_>> {
        self.launching
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| LaunchGuard(&self.launching))
    }

    /// Start the worker if none is live. Returns its pid.
    ///
    /// A fatal session left over from a crash is torn down first.
    pub fn start_worker(&self) -> Result<u32> {
        let (dead, _launch) = {
            let mut session = self.lock_session();
            if let Some(current) = session.as_ref()
                && !current.dispatcher.is_fatal()
            {
                return Ok(current.pid);
            }
            let Some(launch) = self.begin_launch() else {
                return Err(BridgeError::Worker(RESTARTING.to_string()));
            };
            (session.take(), launch)
        };

        if let Some(mut dead) = dead {
            self.record_crash(&mut dead);
            self.shutdown_session(dead);
        }
        let fresh = self.launch()?;
        let pid = fresh.pid;
        *self.lock_session() = Some(fresh);
        Ok(pid)
    }

    /// Stop the worker: shutdown frame, then SIGTERM, then kill.
    ///
    /// Returns how the worker ended, or `None` if no worker was running.
    pub fn stop_worker(&self) -> Option<TerminationReason> {
        let session = self.lock_session().take()?;
        Some(self.shutdown_session(session))
    }

    /// Stop the current worker (if any) and start a fresh one.
    ///
    /// Counts toward `stats().restarts` but not toward the `Respawn` limit.
    pub fn restart_worker(&self) -> Result<u32> {
        self.stop_worker();
        self.restarts.fetch_add(1, Ordering::Relaxed);
        self.start_worker()
    }

    /// Dispatch a call to the current worker.
    ///
    /// After a crash, `FailLoud` answers every call with `SessionFatal`;
    /// `Respawn` starts a fresh worker first while restarts remain.
    pub fn execute(
        &self,
        operation: &str,
        parameters: Parameters,
        timeout_seconds: i64,
    ) -> DispatchResult {
        match self.current_dispatcher() {
            Ok(dispatcher) => dispatcher.execute(operation, parameters, timeout_seconds),
            Err(reason) => {
                warn!(
                    target: "axbridge::dispatch",
                    operation,
                    outcome = "SessionFatal",
                    "Dispatch refused: {}",
                    reason
                );
                DispatchResult::session_fatal(operation, reason)
            }
        }
    }

    /// Dispatcher of the live session, or why there is none.
    pub fn dispatcher(&self) -> Option<Arc<Dispatcher>> {
        self.current_dispatcher().ok()
    }

    fn current_dispatcher(&self) -> std::result::Result<Arc<Dispatcher>, String> {
        let (dead, _launch, reason, attempt, max_restarts) = {
            let mut guard = self.lock_session();
            let session = match guard.as_mut() {
                None if self.launching.load(Ordering::SeqCst) => {
                    return Err(RESTARTING.to_string());
                }
                None => return Err("Worker is not running".to_string()),
                Some(session) if !session.dispatcher.is_fatal() => {
                    return Ok(session.dispatcher.clone());
                }
                Some(session) => session,
            };

            let reason = session
                .dispatcher
                .fatal_reason()
                .unwrap_or_else(|| "Worker session is fatal".to_string());
            let RestartPolicy::Respawn { max_restarts } = self.config.restart_policy else {
                self.record_crash(session);
                return Err(reason);
            };
            let attempt = self.respawns.load(Ordering::Relaxed);
            if attempt >= max_restarts {
                self.record_crash(session);
                return Err(format!("{}; restart limit ({}) reached", reason, max_restarts));
            }
            let Some(launch) = self.begin_launch() else {
                return Err(format!("{}; {}", reason, RESTARTING));
            };
            self.respawns.fetch_add(1, Ordering::Relaxed);
            self.restarts.fetch_add(1, Ordering::Relaxed);
            (guard.take(), launch, reason, attempt, max_restarts)
        };

        if let Some(mut dead) = dead {
            self.record_crash(&mut dead);
            self.shutdown_session(dead);
        }
        info!(attempt = attempt + 1, max_restarts, "Respawning worker");
        match self.launch() {
            Ok(fresh) => {
                let dispatcher = fresh.dispatcher.clone();
                *self.lock_session() = Some(fresh);
                Ok(dispatcher)
            }
            Err(e) => {
                error!(error = %e, "Failed to respawn worker");
                Err(format!("{}; respawn failed: {}", reason, e))
            }
        }
    }

    /// Spawn a worker, attach a dispatcher and wait for readiness.
    fn launch(&self) -> Result<Session> {
        let command = self.config.worker_command()?;
        let spawned = spawn_worker(&command)?;
        let pid = spawned.proc.pid();
        let proc = Arc::new(Mutex::new(spawned.proc));

        let probe_proc = proc.clone();
        let probe: ExitProbe = Box::new(move || {
            let mut proc = lock_proc(&probe_proc);
            match proc.wait_timeout(EXIT_PROBE_WAIT) {
                Ok(Some(status)) => Some(TerminationReason::from_exit_status(status).description()),
                _ => None,
            }
        });
        let dispatcher = Dispatcher::with_exit_probe(spawned.stdin, spawned.stdout, Some(probe))?;

        match dispatcher.wait_ready(self.config.startup_timeout) {
            Ok(operations) => {
                info!(pid, operations = operations.len(), "Worker ready");
            }
            Err(e) => {
                dispatcher.mark_closing();
                let mut proc = lock_proc(&proc);
                let _ = proc.kill();
                let reason = proc.termination_reason();
                drop(proc);
                return Err(match e {
                    BridgeError::StartupTimeout(_) => e,
                    other => BridgeError::Worker(format!(
                        "Worker {} failed to start ({}): {}",
                        pid, reason, other
                    )),
                });
            }
        }

        Ok(Session {
            dispatcher: Arc::new(dispatcher),
            proc,
            pid,
            crash_recorded: false,
        })
    }

    /// Log and remember a crash once per session.
    fn record_crash(&self, session: &mut Session) {
        if session.crash_recorded || !session.dispatcher.is_fatal() {
            return;
        }
        session.crash_recorded = true;

        let reason = {
            let mut proc = lock_proc(&session.proc);
            let _ = proc.wait_timeout(EXIT_PROBE_WAIT);
            proc.termination_reason()
        };
        let mut failure = WorkerFailure::new(session.pid, reason);
        if let Some(context) = session.dispatcher.fatal_reason() {
            failure = failure.with_context(context);
        }
        error!(pid = session.pid, reason = %failure.reason, "Worker terminated unexpectedly");
        if let Ok(mut last) = self.last_failure.lock() {
            *last = Some(failure);
        }
    }

    fn shutdown_session(&self, session: Session) -> TerminationReason {
        if session.dispatcher.is_fatal() {
            session.dispatcher.mark_closing();
        } else if let Err(e) = session.dispatcher.send_shutdown() {
            warn!(pid = session.pid, error = %e, "Failed to send shutdown frame");
        }

        let reason = match lock_proc(&session.proc).stop(self.config.shutdown_timeout) {
            Ok(reason) => reason,
            Err(e) => {
                warn!(pid = session.pid, error = %e, "Failed to stop worker");
                TerminationReason::Unknown
            }
        };
        session.dispatcher.join();
        info!(pid = session.pid, reason = %reason, "Worker stopped");
        reason
    }

    /// Pid of the live worker.
    pub fn pid(&self) -> Option<u32> {
        self.lock_session().as_ref().map(|s| s.pid)
    }

    pub fn is_running(&self) -> bool {
        self.lock_session()
            .as_ref()
            .is_some_and(|s| !s.dispatcher.is_fatal())
    }

    /// Operation names announced by the live worker.
    pub fn operations(&self) -> Vec<String> {
        self.lock_session()
            .as_ref()
            .map(|s| s.dispatcher.operations())
            .unwrap_or_default()
    }

    pub fn last_failure(&self) -> Option<WorkerFailure> {
        self.last_failure.lock().ok().and_then(|f| f.clone())
    }

    pub fn stats(&self) -> SupervisorStats {
        let session = self.lock_session();
        let mut stats = SupervisorStats {
            restarts: self.restarts.load(Ordering::Relaxed),
            respawns: self.respawns.load(Ordering::Relaxed),
            last_failure: self.last_failure().map(|f| f.to_string()),
            ..Default::default()
        };
        if let Some(s) = session.as_ref() {
            stats.running = !s.dispatcher.is_fatal();
            stats.pid = Some(s.pid);
            stats.operations = s.dispatcher.operations();
            stats.dispatch = s.dispatcher.stats();
        }
        stats
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop_worker();
    }
}
