//! Parent-side dispatcher.
//!
//! The dispatcher owns both ends of the worker channel. Callers on any thread
//! call [`Dispatcher::execute`]; each call gets a correlation id and a private
//! one-shot reply slot, so callers only ever wait on their own response.
//!
//! Two helper threads do the I/O:
//!
//! - the **writer** drains an unbounded FIFO of encoded frames into the
//!   worker's stdin, so a caller never blocks on a full pipe;
//! - the **reader** decodes frames from the worker's stdout and routes each
//!   response to the slot registered under its id.
//!
//! When the reader sees EOF or the writer fails, the session turns fatal:
//! every pending call is completed with `SessionFatal` and later calls fail
//! fast until a new dispatcher is created.

use super::ipc::{LineReader, LineWriter, MAX_FRAME_BYTES, exceeds_frame_limit};
use super::protocol::{
    ControlFrame, ErrorCategory, ErrorDescriptor, MAX_TIMEOUT_SECS, Parameters, RequestEnvelope,
    ResponseEnvelope, WorkerInbound, WorkerOutbound, to_line,
};
use super::state::{Completion, RequestState};
use crate::error::{BridgeError, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Diagnostic type name for failures raised by the dispatcher itself.
pub const DISPATCHER_TIMEOUT: &str = "DispatcherTimeout";
pub const SESSION_FATAL: &str = "WorkerSessionFatal";
pub const WORKER_NOT_READY: &str = "WorkerNotReady";
pub const ARGUMENT_EXCEPTION: &str = "ArgumentException";
pub const MALFORMED_RESPONSE: &str = "MalformedResponse";
pub const DESERIALIZE_ERROR: &str = "DeserializeError";

/// How many timed-out ids are remembered for late-response accounting.
const MAX_TRACKED_TIMEOUTS: usize = 4096;

/// Called by the reader thread when the worker's output closes; returns a
/// description of how the worker process ended, if it can be determined.
pub type ExitProbe = Box<dyn Fn() -> Option<String> + Send + Sync>;

/// Outcome of one dispatched call.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchResult {
    /// Correlation id, if the request got far enough to be assigned one.
    pub id: Option<u64>,
    pub operation: String,
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<ErrorDescriptor>,
    /// Final lifecycle state as seen by the caller.
    ///
    /// A timed-out call ends at `TimedOut` here. Its move to `Abandoned`
    /// happens later, inside the dispatcher, if the late response arrives.
    pub state: RequestState,
    pub elapsed: Duration,
}

impl DispatchResult {
    fn rejected(operation: &str, error: ErrorDescriptor, start: Instant) -> Self {
        Self {
            id: None,
            operation: operation.to_string(),
            success: false,
            data: None,
            error: Some(error),
            state: RequestState::Completed(Completion::Failure),
            elapsed: start.elapsed(),
        }
    }

    /// A `SessionFatal` failure for a call that never reached a worker.
    pub fn session_fatal(operation: &str, message: impl Into<String>) -> Self {
        Self::rejected(
            operation,
            ErrorDescriptor::new(ErrorCategory::SessionFatal, message, SESSION_FATAL),
            Instant::now(),
        )
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    /// Failure category, `None` on success.
    pub fn category(&self) -> Option<ErrorCategory> {
        self.error.as_ref().map(|e| e.category)
    }

    /// Convert into a plain `Result` over the payload.
    pub fn into_result(self) -> std::result::Result<Option<Value>, ErrorDescriptor> {
        match self.error {
            None => Ok(self.data),
            Some(err) => Err(err),
        }
    }

    /// Render as a wire response envelope (for printing or forwarding).
    pub fn to_envelope(&self) -> ResponseEnvelope {
        match &self.error {
            None => ResponseEnvelope::success(self.id, self.data.clone().unwrap_or(Value::Null)),
            Some(err) => ResponseEnvelope::failure(self.id, err.clone()),
        }
    }
}

/// Counter snapshot for a dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Request frames handed to the writer.
    pub sent: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    /// Late responses discarded after their caller timed out.
    pub abandoned: u64,
    /// Calls refused before any frame was sent.
    pub rejected: u64,
    /// Calls completed with `SessionFatal`.
    pub session_failures: u64,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    abandoned: AtomicU64,
    rejected: AtomicU64,
    session_failures: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            sent: self.sent.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            session_failures: self.session_failures.load(Ordering::Relaxed),
        }
    }
}

enum Reply {
    Response(ResponseEnvelope),
    Fatal(String),
}

#[derive(Default)]
struct Inner {
    pending: HashMap<u64, Sender<Reply>>,
    /// Timed-out requests whose late response may still arrive.
    timed_out: BTreeMap<u64, RequestState>,
    fatal: Option<String>,
}

/// State shared with the I/O threads.
struct Shared {
    inner: Mutex<Inner>,
    counters: Counters,
    ready: AtomicBool,
    closing: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned lock only means another thread panicked mid-update; the
        // map itself is still consistent enough to drain.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mark the session fatal and complete every pending call.
    fn fail_session(&self, reason: String) {
        let drained: Vec<(u64, Sender<Reply>)> = {
            let mut inner = self.lock();
            if inner.fatal.is_some() {
                return;
            }
            inner.fatal = Some(reason.clone());
            inner.timed_out.clear();
            inner.pending.drain().collect()
        };
        self.ready.store(false, Ordering::SeqCst);

        if self.closing.load(Ordering::SeqCst) {
            info!(reason = %reason, pending = drained.len(), "Worker session closed");
        } else {
            error!(reason = %reason, pending = drained.len(), "Worker session is fatal");
        }
        for (_, tx) in drained {
            let _ = tx.send(Reply::Fatal(reason.clone()));
        }
    }

    fn route(&self, response: ResponseEnvelope) {
        let Some(id) = response.id else {
            warn!(error = ?response.error, "Discarding response without correlation id");
            return;
        };
        let (waiter, late) = {
            let mut inner = self.lock();
            match inner.pending.remove(&id) {
                Some(tx) => (Some(tx), None),
                None => (None, inner.timed_out.remove(&id)),
            }
        };
        if let Some(tx) = waiter {
            let _ = tx.send(Reply::Response(response));
        } else if let Some(mut state) = late {
            advance(&mut state, RequestState::Abandoned);
            self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
            debug!(
                id,
                success = response.success,
                state = state.name(),
                "Discarding late response"
            );
        } else {
            warn!(id, "Discarding response for unknown request id");
        }
    }
}

/// Caller-facing entry point to a worker.
pub struct Dispatcher {
    outbound: Sender<String>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    ready_rx: Receiver<Vec<String>>,
    operations: Mutex<Vec<String>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Attach to a worker through its inbound (`writer`) and outbound
    /// (`reader`) byte streams and start the I/O threads.
    pub fn new<W, R>(writer: W, reader: R) -> Result<Self>
    where
        W: Write + Send + 'static,
        R: Read + Send + 'static,
    {
        Self::with_exit_probe(writer, reader, None)
    }

    /// Like [`Dispatcher::new`], with a probe whose answer is appended to the
    /// fatal reason when the worker's output closes.
    pub fn with_exit_probe<W, R>(writer: W, reader: R, probe: Option<ExitProbe>) -> Result<Self>
    where
        W: Write + Send + 'static,
        R: Read + Send + 'static,
    {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner::default()),
            counters: Counters::default(),
            ready: AtomicBool::new(false),
            closing: AtomicBool::new(false),
        });
        let (outbound, outbound_rx) = unbounded::<String>();
        let (ready_tx, ready_rx) = bounded::<Vec<String>>(1);

        let writer_shared = shared.clone();
        // The writer exits once every sender is gone, i.e. when the
        // dispatcher is dropped; dropping it closes the worker's stdin.
        std::thread::Builder::new()
            .name("axbridge-writer".to_string())
            .spawn(move || writer_loop(outbound_rx, LineWriter::new(writer), writer_shared))?;

        let reader_shared = shared.clone();
        let reader_thread = std::thread::Builder::new()
            .name("axbridge-reader".to_string())
            .spawn(move || reader_loop(LineReader::new(reader), reader_shared, ready_tx, probe))?;

        Ok(Self {
            outbound,
            shared,
            next_id: AtomicU64::new(1),
            ready_rx,
            operations: Mutex::new(Vec::new()),
            reader: Mutex::new(Some(reader_thread)),
        })
    }

    /// Wait for the worker's readiness handshake.
    ///
    /// Returns the operation names the worker registered.
    pub fn wait_ready(&self, timeout: Duration) -> Result<Vec<String>> {
        match self.ready_rx.recv_timeout(timeout) {
            Ok(operations) => {
                if let Ok(mut ops) = self.operations.lock() {
                    ops.clone_from(&operations);
                }
                self.shared.ready.store(true, Ordering::SeqCst);
                Ok(operations)
            }
            Err(RecvTimeoutError::Timeout) => Err(BridgeError::StartupTimeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(BridgeError::Worker(
                self.fatal_reason()
                    .unwrap_or_else(|| "worker exited before becoming ready".to_string()),
            )),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::SeqCst)
    }

    /// Whether the session has failed and no longer accepts calls.
    pub fn is_fatal(&self) -> bool {
        self.shared.lock().fatal.is_some()
    }

    pub fn fatal_reason(&self) -> Option<String> {
        self.shared.lock().fatal.clone()
    }

    /// Operation names announced by the worker.
    pub fn operations(&self) -> Vec<String> {
        self.operations
            .lock()
            .map(|ops| ops.clone())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> DispatchStats {
        self.shared.counters.snapshot()
    }

    /// Number of calls currently waiting for a response.
    pub fn in_flight(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Execute a named operation and wait for its outcome.
    ///
    /// Never returns an `Err` and never panics: every failure, including
    /// invalid arguments, timeouts and worker death, is a `DispatchResult`
    /// with `success == false`. Nothing is retried.
    pub fn execute(
        &self,
        operation: &str,
        parameters: Parameters,
        timeout_seconds: i64,
    ) -> DispatchResult {
        let start = Instant::now();
        let result = self.execute_inner(operation, parameters, timeout_seconds, start);
        self.record(&result);
        result
    }

    /// Execute and deserialize the payload into `T`.
    ///
    /// A null payload deserializes as JSON `null`.
    pub fn execute_typed<T: DeserializeOwned>(
        &self,
        operation: &str,
        parameters: Parameters,
        timeout_seconds: i64,
    ) -> std::result::Result<T, ErrorDescriptor> {
        let data = self
            .execute(operation, parameters, timeout_seconds)
            .into_result()?
            .unwrap_or(Value::Null);
        serde_json::from_value(data).map_err(|e| {
            ErrorDescriptor::new(
                ErrorCategory::Unexpected,
                format!("Payload of '{}' did not match the expected type: {}", operation, e),
                DESERIALIZE_ERROR,
            )
        })
    }

    fn execute_inner(
        &self,
        operation: &str,
        parameters: Parameters,
        timeout_seconds: i64,
        start: Instant,
    ) -> DispatchResult {
        if operation.trim().is_empty() {
            return self.reject(
                operation,
                ErrorCategory::InvalidArgument,
                "Operation name must not be empty".to_string(),
                ARGUMENT_EXCEPTION,
                start,
            );
        }
        if timeout_seconds <= 0 || timeout_seconds > MAX_TIMEOUT_SECS {
            return self.reject(
                operation,
                ErrorCategory::InvalidArgument,
                format!(
                    "timeoutSeconds must be between 1 and {}, got {}",
                    MAX_TIMEOUT_SECS, timeout_seconds
                ),
                ARGUMENT_EXCEPTION,
                start,
            );
        }

        let mut state = RequestState::Created;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = match to_line(&RequestEnvelope::new(id, operation, parameters, timeout_seconds)) {
            Ok(line) => line,
            Err(e) => {
                return self.reject(
                    operation,
                    ErrorCategory::InvalidArgument,
                    format!("Parameters could not be encoded: {}", e),
                    ARGUMENT_EXCEPTION,
                    start,
                );
            }
        };
        if exceeds_frame_limit(&line) {
            return self.reject(
                operation,
                ErrorCategory::InvalidArgument,
                format!(
                    "Request frame is {} bytes, over the {} byte limit",
                    line.len(),
                    MAX_FRAME_BYTES
                ),
                ARGUMENT_EXCEPTION,
                start,
            );
        }

        let (tx, rx) = bounded::<Reply>(1);
        {
            let mut inner = self.shared.lock();
            if let Some(reason) = inner.fatal.clone() {
                drop(inner);
                return self.reject(operation, ErrorCategory::SessionFatal, reason, SESSION_FATAL, start);
            }
            if !self.shared.ready.load(Ordering::SeqCst) {
                drop(inner);
                return self.reject(
                    operation,
                    ErrorCategory::SessionFatal,
                    "Worker has not completed its readiness handshake".to_string(),
                    WORKER_NOT_READY,
                    start,
                );
            }
            inner.pending.insert(id, tx);
        }

        if self.outbound.send(line).is_err() {
            self.shared.lock().pending.remove(&id);
            self.shared
                .fail_session("worker channel writer has stopped".to_string());
            advance(&mut state, RequestState::Completed(Completion::Failure));
            return self.finish(id, operation, Err(self.session_error()), state, start);
        }
        self.shared.counters.sent.fetch_add(1, Ordering::Relaxed);
        advance(&mut state, RequestState::Sent);
        advance(&mut state, RequestState::AwaitingResponse);
        trace!(id, operation, timeout_seconds, "Request sent");

        let timeout = Duration::from_secs(timeout_seconds.unsigned_abs());
        let reply = match rx.recv_timeout(timeout) {
            Ok(reply) => reply,
            Err(RecvTimeoutError::Timeout) => {
                let removed = {
                    let mut inner = self.shared.lock();
                    let removed = inner.pending.remove(&id).is_some();
                    if removed {
                        inner.timed_out.insert(id, RequestState::TimedOut);
                        while inner.timed_out.len() > MAX_TRACKED_TIMEOUTS {
                            inner.timed_out.pop_first();
                        }
                    }
                    removed
                };
                if removed {
                    advance(&mut state, RequestState::TimedOut);
                    let err = ErrorDescriptor::new(
                        ErrorCategory::Timeout,
                        format!(
                            "Operation '{}' did not complete within {}s",
                            operation, timeout_seconds
                        ),
                        DISPATCHER_TIMEOUT,
                    );
                    return self.finish(id, operation, Err(err), state, start);
                }
                // The reader (or a session failure) already claimed the slot
                // and sends right after releasing the lock.
                rx.recv().unwrap_or_else(|_| {
                    Reply::Fatal(
                        self.fatal_reason()
                            .unwrap_or_else(|| "reply slot closed".to_string()),
                    )
                })
            }
            Err(RecvTimeoutError::Disconnected) => Reply::Fatal(
                self.fatal_reason()
                    .unwrap_or_else(|| "reply slot closed".to_string()),
            ),
        };

        let outcome = match reply {
            Reply::Response(response) if !response.is_well_formed() => Err(ErrorDescriptor::new(
                ErrorCategory::Unexpected,
                format!("Worker sent a malformed response for '{}'", operation),
                MALFORMED_RESPONSE,
            )),
            Reply::Response(response) => match response.error_descriptor() {
                None => Ok(response.data),
                Some(err) => Err(err),
            },
            Reply::Fatal(reason) => Err(ErrorDescriptor::new(
                ErrorCategory::SessionFatal,
                reason,
                SESSION_FATAL,
            )),
        };
        let completion = if outcome.is_ok() {
            Completion::Success
        } else {
            Completion::Failure
        };
        advance(&mut state, RequestState::Completed(completion));
        self.finish(id, operation, outcome, state, start)
    }

    fn session_error(&self) -> ErrorDescriptor {
        ErrorDescriptor::new(
            ErrorCategory::SessionFatal,
            self.fatal_reason()
                .unwrap_or_else(|| "worker session is not available".to_string()),
            SESSION_FATAL,
        )
    }

    fn reject(
        &self,
        operation: &str,
        category: ErrorCategory,
        message: String,
        exception_type: &str,
        start: Instant,
    ) -> DispatchResult {
        self.shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
        DispatchResult::rejected(
            operation,
            ErrorDescriptor::new(category, message, exception_type),
            start,
        )
    }

    fn finish(
        &self,
        id: u64,
        operation: &str,
        outcome: std::result::Result<Option<Value>, ErrorDescriptor>,
        state: RequestState,
        start: Instant,
    ) -> DispatchResult {
        let (success, data, error) = match outcome {
            Ok(data) => (true, data, None),
            Err(err) => (false, None, Some(err)),
        };
        let state = if state.is_terminal() || state == RequestState::TimedOut {
            state
        } else {
            RequestState::Completed(Completion::Failure)
        };
        DispatchResult {
            id: Some(id),
            operation: operation.to_string(),
            success,
            data,
            error,
            state,
            elapsed: start.elapsed(),
        }
    }

    /// Update counters and write the per-dispatch diagnostics entry.
    fn record(&self, result: &DispatchResult) {
        let counters = &self.shared.counters;
        let outcome = match result.category() {
            None => {
                counters.succeeded.fetch_add(1, Ordering::Relaxed);
                "Success"
            }
            Some(category) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                if result.state == RequestState::TimedOut {
                    counters.timed_out.fetch_add(1, Ordering::Relaxed);
                }
                if category == ErrorCategory::SessionFatal {
                    counters.session_failures.fetch_add(1, Ordering::Relaxed);
                }
                category.as_str()
            }
        };
        info!(
            target: "axbridge::dispatch",
            operation = %result.operation,
            id = ?result.id,
            duration_ms = result.elapsed.as_millis() as u64,
            outcome,
            state = result.state.name(),
            "Dispatch"
        );
    }

    /// Queue a graceful-shutdown frame. Calls made afterwards are not served.
    pub fn send_shutdown(&self) -> Result<()> {
        self.shared.closing.store(true, Ordering::SeqCst);
        let line = WorkerInbound::Control(ControlFrame::Shutdown).to_line()?;
        self.outbound
            .send(line)
            .map_err(|_| BridgeError::Worker("worker channel writer has stopped".into()))
    }

    /// Mark the coming end of the channel as intentional.
    pub fn mark_closing(&self) {
        self.shared.closing.store(true, Ordering::SeqCst);
    }

    /// Wait for the reader thread to exit.
    ///
    /// Only returns once the worker has closed its end of the channel.
    pub fn join(&self) {
        let handle = match self.reader.lock() {
            Ok(mut reader) => reader.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shared.closing.store(true, Ordering::SeqCst);
    }
}

fn advance(state: &mut RequestState, next: RequestState) {
    if let Err(e) = state.advance(next) {
        // Transitions are driven by this module only; a rejection is a bug.
        debug_assert!(false, "{}", e);
        warn!(error = %e, "Ignoring invalid request state transition");
    }
}

fn writer_loop<W: Write>(rx: Receiver<String>, mut writer: LineWriter<W>, shared: Arc<Shared>) {
    for line in rx {
        if let Err(e) = writer.write_line(&line) {
            shared.fail_session(format!("Failed to send to worker: {}", e));
            return;
        }
    }
    trace!(frames = writer.frames_written(), "Writer thread stopped");
}

fn reader_loop<R: Read>(
    mut reader: LineReader<R>,
    shared: Arc<Shared>,
    ready_tx: Sender<Vec<String>>,
    probe: Option<ExitProbe>,
) {
    let reason = loop {
        let line = match reader.read_line() {
            Ok(Some(line)) => line,
            Ok(None) => break "Worker process closed its output channel".to_string(),
            Err(e) => break format!("Failed to receive from worker: {}", e),
        };
        if line.trim().is_empty() {
            continue;
        }
        match WorkerOutbound::from_line(line) {
            Ok(WorkerOutbound::Response(response)) => shared.route(response),
            Ok(WorkerOutbound::Control(ControlFrame::Ready { pid, operations })) => {
                debug!(pid, operations = operations.len(), "Worker handshake received");
                let _ = ready_tx.try_send(operations);
            }
            Ok(WorkerOutbound::Control(other)) => {
                warn!(frame = ?other, "Ignoring unexpected control frame from worker");
            }
            Err(e) => warn!(error = %e, "Ignoring undecodable frame from worker"),
        }
    };
    let reason = match probe.as_ref().and_then(|probe| probe()) {
        Some(exit) => format!("{} (worker {})", reason, exit),
        None => reason,
    };
    shared.fail_session(reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::classify::HandlerError;
    use crate::dispatch::params::ParamsExt;
    use crate::dispatch::registry::OperationRegistry;
    use crate::dispatch::worker::{LoopExit, run_loop, spawn_execution_thread};
    use serde_json::json;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::io;
    use std::rc::Rc;
    use std::sync::atomic::AtomicU32;

    fn params(value: Value) -> Parameters {
        match value {
            Value::Object(map) => map,
            _ => Parameters::new(),
        }
    }

    /// Run a worker loop on its own execution thread, wired to a dispatcher
    /// through OS pipes.
    fn start<B>(build: B) -> (Dispatcher, JoinHandle<io::Result<LoopExit>>)
    where
        B: FnOnce() -> OperationRegistry + Send + 'static,
    {
        let (to_worker_rx, to_worker_tx) = io::pipe().unwrap();
        let (from_worker_rx, from_worker_tx) = io::pipe().unwrap();
        let worker = spawn_execution_thread("test-worker", move || {
            let registry = build();
            let mut reader = LineReader::new(to_worker_rx);
            let mut writer = LineWriter::new(from_worker_tx);
            run_loop(&registry, &mut reader, &mut writer)
        })
        .unwrap();
        let dispatcher = Dispatcher::new(to_worker_tx, from_worker_rx).unwrap();
        dispatcher.wait_ready(Duration::from_secs(5)).unwrap();
        (dispatcher, worker)
    }

    /// Toggle handler over an in-memory element table.
    fn toggle_registry(calls: Arc<AtomicU32>) -> OperationRegistry {
        let elements: Rc<RefCell<HashMap<String, bool>>> = Rc::new(RefCell::new(
            [("cb1".to_string(), false), ("cb2".to_string(), true)].into(),
        ));
        let mut registry = OperationRegistry::new();
        registry
            .register("Toggle", move |inv| {
                calls.fetch_add(1, Ordering::SeqCst);
                let id = inv.parameters.require_str("elementId")?;
                let mut elements = elements.borrow_mut();
                let state = elements.get_mut(id).ok_or_else(|| {
                    HandlerError::ElementNotAvailable(format!("Element '{}' was not found", id))
                })?;
                let previous = *state;
                *state = !previous;
                let label = |on: bool| if on { "On" } else { "Off" };
                Ok(json!({
                    "elementId": id,
                    "previousState": label(previous),
                    "newState": label(*state),
                }))
            })
            .unwrap();
        registry
            .register("SlowOp", |inv| {
                let ms = inv.parameters.opt_i64("ms")?.unwrap_or(5000);
                std::thread::sleep(Duration::from_millis(ms.unsigned_abs()));
                Ok(json!({"done": ms}))
            })
            .unwrap();
        registry
    }

    #[test]
    fn test_toggle_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let (dispatcher, _worker) = start(move || toggle_registry(c));

        let result = dispatcher.execute("Toggle", params(json!({"elementId": "cb1"})), 30);
        assert!(result.is_success(), "{:?}", result.error);
        let data = result.data.as_ref().unwrap();
        assert_eq!(data["newState"], "On");
        assert_eq!(data["previousState"], "Off");
        assert_eq!(result.state, RequestState::Completed(Completion::Success));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_toggle_missing_element() {
        let (dispatcher, _worker) = start(|| toggle_registry(Arc::new(AtomicU32::new(0))));
        let result = dispatcher.execute("Toggle", params(json!({"elementId": "missing"})), 30);
        assert!(!result.is_success());
        assert!(result.data.is_none());
        let err = result.error.unwrap();
        assert_eq!(err.category, ErrorCategory::NotFound);
        assert!(err.message.contains("missing"));
        assert_eq!(err.exception_type, "ElementNotAvailableException");
    }

    #[test]
    fn test_unregistered_operation_runs_no_handler() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let (dispatcher, _worker) = start(move || toggle_registry(c));
        let result = dispatcher.execute("Toggel", params(json!({"elementId": "cb1"})), 30);
        assert_eq!(result.category(), Some(ErrorCategory::NotFound));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_invalid_arguments_send_nothing() {
        let (dispatcher, _worker) = start(|| toggle_registry(Arc::new(AtomicU32::new(0))));
        for timeout in [0, -1, i64::MIN, MAX_TIMEOUT_SECS + 1] {
            let result = dispatcher.execute("Toggle", Parameters::new(), timeout);
            assert_eq!(result.category(), Some(ErrorCategory::InvalidArgument));
            assert!(result.id.is_none());
        }
        let result = dispatcher.execute("", Parameters::new(), 30);
        assert_eq!(result.category(), Some(ErrorCategory::InvalidArgument));

        let stats = dispatcher.stats();
        assert_eq!(stats.sent, 0);
        assert_eq!(stats.rejected, 5);
    }

    #[test]
    fn test_oversized_request_rejected_and_session_survives() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let (dispatcher, _worker) = start(move || toggle_registry(c));

        let big = "x".repeat(MAX_FRAME_BYTES + 1024);
        let result = dispatcher.execute("Toggle", params(json!({"elementId": big})), 30);
        assert_eq!(result.category(), Some(ErrorCategory::InvalidArgument));
        assert_eq!(result.error.as_ref().unwrap().exception_type, ARGUMENT_EXCEPTION);
        assert_eq!(dispatcher.stats().sent, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let result = dispatcher.execute("Toggle", params(json!({"elementId": "cb1"})), 30);
        assert!(result.is_success(), "{:?}", result.error);
        assert!(!dispatcher.is_fatal());
    }

    #[test]
    fn test_oversized_response_fails_only_its_call() {
        let (dispatcher, _worker) = start(|| {
            let mut registry = toggle_registry(Arc::new(AtomicU32::new(0)));
            registry
                .register("Dump", |_| Ok(Value::String("x".repeat(MAX_FRAME_BYTES))))
                .unwrap();
            registry
        });

        let result = dispatcher.execute("Dump", Parameters::new(), 30);
        let err = result.error.as_ref().unwrap();
        assert_eq!(err.category, ErrorCategory::Unexpected);
        assert_eq!(err.exception_type, crate::dispatch::classify::RESPONSE_TOO_LARGE);
        assert_eq!(result.state, RequestState::Completed(Completion::Failure));

        let result = dispatcher.execute("Toggle", params(json!({"elementId": "cb2"})), 30);
        assert!(result.is_success(), "{:?}", result.error);
    }

    #[test]
    fn test_slow_handler_times_out_at_caller_budget() {
        let (dispatcher, _worker) = start(|| toggle_registry(Arc::new(AtomicU32::new(0))));
        let start = Instant::now();
        let result = dispatcher.execute("SlowOp", params(json!({"ms": 5000})), 1);
        let elapsed = start.elapsed();

        assert_eq!(result.category(), Some(ErrorCategory::Timeout));
        assert_eq!(result.state, RequestState::TimedOut);
        assert_eq!(result.error.unwrap().exception_type, DISPATCHER_TIMEOUT);
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_secs(3), "took {:?}", elapsed);
    }

    #[test]
    fn test_late_response_is_abandoned() {
        let (dispatcher, _worker) = start(|| toggle_registry(Arc::new(AtomicU32::new(0))));
        let result = dispatcher.execute("SlowOp", params(json!({"ms": 1500})), 1);
        assert_eq!(result.category(), Some(ErrorCategory::Timeout));
        assert_eq!(result.state, RequestState::TimedOut);
        assert!(dispatcher.shared.lock().timed_out.contains_key(&result.id.unwrap()));

        // The queued call waits behind the slow one, then completes normally.
        let next = dispatcher.execute("Toggle", params(json!({"elementId": "cb2"})), 10);
        assert!(next.is_success(), "{:?}", next.error);
        assert_eq!(next.data.unwrap()["newState"], "Off");

        let stats = dispatcher.stats();
        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.timed_out, 1);
        assert_eq!(dispatcher.in_flight(), 0);
        assert!(dispatcher.shared.lock().timed_out.is_empty());
    }

    #[test]
    fn test_timeout_measured_from_own_send() {
        let (dispatcher, _worker) = start(|| toggle_registry(Arc::new(AtomicU32::new(0))));
        let dispatcher = Arc::new(dispatcher);

        // A stuck call occupies the worker for 3s with a long budget.
        let d = dispatcher.clone();
        let stuck = std::thread::spawn(move || d.execute("SlowOp", params(json!({"ms": 3000})), 30));
        std::thread::sleep(Duration::from_millis(1500));

        // A second call queued behind it must time out 1s after its own send,
        // not at the stuck call's start.
        let start = Instant::now();
        let result = dispatcher.execute("Toggle", params(json!({"elementId": "cb1"})), 1);
        let elapsed = start.elapsed();
        assert_eq!(result.category(), Some(ErrorCategory::Timeout));
        assert!(elapsed >= Duration::from_millis(950), "took {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1400), "took {:?}", elapsed);

        assert!(stuck.join().unwrap().is_success());
    }

    #[test]
    fn test_concurrent_calls_not_swapped() {
        let (dispatcher, _worker) = start(|| toggle_registry(Arc::new(AtomicU32::new(0))));
        let dispatcher = Arc::new(dispatcher);

        let handles: Vec<_> = ["cb1", "cb2"]
            .into_iter()
            .map(|id| {
                let d = dispatcher.clone();
                std::thread::spawn(move || (id, d.execute("Toggle", params(json!({"elementId": id})), 10)))
            })
            .collect();

        for handle in handles {
            let (id, result) = handle.join().unwrap();
            let data = result.data.expect("success");
            assert_eq!(data["elementId"], id);
            let expected_new = if id == "cb1" { "On" } else { "Off" };
            assert_eq!(data["newState"], expected_new);
        }
    }

    #[test]
    fn test_handlers_run_on_execution_thread() {
        let (dispatcher, _worker) = start(|| {
            let mut registry = OperationRegistry::new();
            registry
                .register("Where", |_| {
                    Ok(json!({
                        "thread": std::thread::current().name(),
                        "exec": crate::dispatch::worker::is_execution_thread(),
                    }))
                })
                .unwrap();
            registry
        });
        let dispatcher = Arc::new(dispatcher);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let d = dispatcher.clone();
                std::thread::spawn(move || d.execute("Where", Parameters::new(), 5))
            })
            .collect();
        for handle in handles {
            let data = handle.join().unwrap().data.unwrap();
            assert_eq!(data["thread"], "test-worker");
            assert_eq!(data["exec"], true);
        }
    }

    #[test]
    fn test_worker_death_fails_pending_and_later_calls() {
        let (dispatcher, _worker) = start(|| {
            let mut registry = OperationRegistry::new();
            registry
                .register("Die", |_| {
                    // Ending the loop closes the worker's output channel, as a
                    // crashed process would.
                    std::thread::sleep(Duration::from_millis(200));
                    Err(HandlerError::Unexpected {
                        type_name: "Unreachable".into(),
                        message: "never delivered".into(),
                    })
                })
                .unwrap();
            registry
        });
        let dispatcher = Arc::new(dispatcher);

        let d = dispatcher.clone();
        let pending = std::thread::spawn(move || d.execute("Die", Parameters::new(), 30));
        std::thread::sleep(Duration::from_millis(50));

        // Simulate the crash from the parent's side: the channel reports EOF.
        dispatcher
            .shared
            .fail_session("Worker process closed its output channel".to_string());

        let result = pending.join().unwrap();
        assert_eq!(result.category(), Some(ErrorCategory::SessionFatal));

        let later = dispatcher.execute("Die", Parameters::new(), 30);
        assert_eq!(later.category(), Some(ErrorCategory::SessionFatal));
        assert!(later.id.is_none());
        assert!(dispatcher.is_fatal());
        assert_eq!(dispatcher.stats().session_failures, 2);
    }

    #[test]
    fn test_shutdown_ends_worker_cleanly() {
        let (dispatcher, worker) = start(|| toggle_registry(Arc::new(AtomicU32::new(0))));
        dispatcher.send_shutdown().unwrap();
        assert_eq!(worker.join().unwrap().unwrap(), LoopExit::Shutdown);
        dispatcher.join();
        assert!(dispatcher.is_fatal());
    }

    #[test]
    fn test_execute_typed() {
        #[derive(serde::Deserialize)]
        struct ToggleResult {
            #[serde(rename = "newState")]
            new_state: String,
        }
        let (dispatcher, _worker) = start(|| toggle_registry(Arc::new(AtomicU32::new(0))));
        let typed: ToggleResult = dispatcher
            .execute_typed("Toggle", params(json!({"elementId": "cb1"})), 10)
            .unwrap();
        assert_eq!(typed.new_state, "On");

        let err = dispatcher
            .execute_typed::<u32>("Toggle", params(json!({"elementId": "cb1"})), 10)
            .unwrap_err();
        assert_eq!(err.category, ErrorCategory::Unexpected);
        assert_eq!(err.exception_type, DESERIALIZE_ERROR);
    }

    #[test]
    fn test_calls_before_handshake_are_refused() {
        let (_to_worker_rx, to_worker_tx) = io::pipe().unwrap();
        let (from_worker_rx, _from_worker_tx) = io::pipe().unwrap();
        let dispatcher = Dispatcher::new(to_worker_tx, from_worker_rx).unwrap();
        let result = dispatcher.execute("Toggle", Parameters::new(), 5);
        assert_eq!(result.category(), Some(ErrorCategory::SessionFatal));
        assert_eq!(result.error.unwrap().exception_type, WORKER_NOT_READY);
        assert_eq!(dispatcher.stats().sent, 0);
    }

    #[test]
    fn test_wait_ready_times_out() {
        let (_to_worker_rx, to_worker_tx) = io::pipe().unwrap();
        let (from_worker_rx, _from_worker_tx) = io::pipe().unwrap();
        let dispatcher = Dispatcher::new(to_worker_tx, from_worker_rx).unwrap();
        let err = dispatcher.wait_ready(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, BridgeError::StartupTimeout(_)));
    }
}
