//! Worker loop and its dedicated execution thread.
//!
//! The loop reads request frames in arrival order, resolves each against the
//! registry, runs the handler, and writes exactly one response frame per
//! request. All of this happens on one thread: the accessibility API binds
//! its objects to the thread that created them, so handler code must never
//! run anywhere else.

use super::classify::{self, HandlerResult};
use super::ipc::{Frame, LineReader, LineWriter, MAX_FRAME_BYTES, exceeds_frame_limit};
use super::protocol::{
    ControlFrame, MAX_TIMEOUT_SECS, RequestEnvelope, ResponseEnvelope, WorkerInbound, to_line,
};
use super::registry::{Invocation, OperationRegistry};
use std::cell::Cell;
use std::io::{self, Read, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Name of the dedicated execution thread.
pub const EXECUTION_THREAD_NAME: &str = "axbridge-exec";

/// Stack size for the execution thread (16 MiB).
///
/// Handlers walk UI trees recursively and can go deep.
pub const EXECUTION_STACK_SIZE: usize = 16 * 1024 * 1024;

thread_local! {
    static ON_EXECUTION_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread is a worker execution thread.
pub fn is_execution_thread() -> bool {
    ON_EXECUTION_THREAD.with(Cell::get)
}

/// Spawn the dedicated execution thread.
///
/// `body` runs entirely on the new thread; build the registry inside it so
/// that handlers and their native state are created on the thread that will
/// call them.
pub fn spawn_execution_thread<F, T>(name: &str, body: F) -> io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_string())
        .stack_size(EXECUTION_STACK_SIZE)
        .spawn(move || {
            ON_EXECUTION_THREAD.with(|flag| flag.set(true));
            body()
        })
}

/// Why the worker loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Parent sent a shutdown frame.
    Shutdown,
    /// Parent closed the inbound channel.
    Eof,
}

/// Run one request against the registry and build its response.
///
/// Never panics and never returns more or less than one response.
pub fn execute_request(registry: &OperationRegistry, request: &RequestEnvelope) -> ResponseEnvelope {
    let id = request.id;
    let operation = request.operation.as_str();

    if operation.is_empty() {
        return ResponseEnvelope::failure(id, classify::invalid_request("operation name is empty"));
    }
    if request.timeout_seconds <= 0 || request.timeout_seconds > MAX_TIMEOUT_SECS {
        return ResponseEnvelope::failure(
            id,
            classify::invalid_request(format!(
                "timeoutSeconds must be between 1 and {}, got {}",
                MAX_TIMEOUT_SECS, request.timeout_seconds
            )),
        );
    }

    let Some(handler) = registry.resolve(operation) else {
        debug!(operation, ?id, "Unknown operation");
        return ResponseEnvelope::failure(id, classify::operation_not_found(operation));
    };

    let budget = Duration::from_secs(request.timeout_seconds.unsigned_abs());
    let invocation = Invocation::new(operation, &request.parameters, budget);
    let start = Instant::now();
    let outcome: std::thread::Result<HandlerResult> =
        catch_unwind(AssertUnwindSafe(|| handler(&invocation)));

    let response = match outcome {
        Ok(Ok(data)) => ResponseEnvelope::success(id, data),
        Ok(Err(err)) => ResponseEnvelope::failure(id, classify::classify(&err)),
        Err(payload) => {
            warn!(operation, ?id, "Handler panicked");
            ResponseEnvelope::failure(id, classify::classify_panic(operation, payload.as_ref()))
        }
    };

    trace!(
        operation,
        ?id,
        success = response.success,
        category = ?response.error_category,
        handler_time_ms = start.elapsed().as_millis(),
        "Handled request"
    );
    response
}

/// Recover the correlation id from a frame that failed to decode.
fn salvage_id(line: &str) -> Option<u64> {
    serde_json::from_str::<serde_json::Value>(line)
        .ok()
        .and_then(|v| v.get("id").and_then(serde_json::Value::as_u64))
}

/// Worker main loop.
///
/// Announces readiness, then serves requests until shutdown or EOF.
pub fn run_loop<R: Read, W: Write>(
    registry: &OperationRegistry,
    reader: &mut LineReader<R>,
    writer: &mut LineWriter<W>,
) -> io::Result<LoopExit> {
    let ready = ControlFrame::Ready {
        pid: std::process::id(),
        operations: registry.names(),
    };
    writer.write_line(&to_line(&ready).map_err(io::Error::other)?)?;
    info!(operations = registry.len(), "Worker ready");

    let mut handled: u64 = 0;
    loop {
        let line = match reader.read_frame()? {
            Some(Frame::Text(line)) => line.to_string(),
            Some(Frame::NotUtf8(e)) => {
                warn!(error = %e, "Request frame is not UTF-8");
                let response = ResponseEnvelope::failure(
                    None,
                    classify::invalid_request(format!("frame is not valid UTF-8: {}", e)),
                );
                write_response(writer, response, None)?;
                continue;
            }
            None => {
                debug!(handled, "Inbound channel closed");
                return Ok(LoopExit::Eof);
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let (response, operation) = match WorkerInbound::from_line(&line) {
            Ok(WorkerInbound::Control(ControlFrame::Shutdown)) => {
                info!(handled, "Shutdown requested");
                return Ok(LoopExit::Shutdown);
            }
            Ok(WorkerInbound::Control(other)) => (
                ResponseEnvelope::failure(
                    None,
                    classify::invalid_request(format!("unexpected control frame {:?}", other)),
                ),
                None,
            ),
            Ok(WorkerInbound::Request(request)) => {
                handled += 1;
                (execute_request(registry, &request), Some(request.operation))
            }
            Err(e) => {
                warn!(error = %e, "Undecodable request frame");
                (
                    ResponseEnvelope::failure(salvage_id(&line), classify::invalid_request(e)),
                    None,
                )
            }
        };

        write_response(writer, response, operation.as_deref())?;
    }
}

/// Encode and write one response, swapping in a `ResponseTooLarge` failure
/// when the frame would not fit the channel. The correlation id is kept.
fn write_response<W: Write>(
    writer: &mut LineWriter<W>,
    response: ResponseEnvelope,
    operation: Option<&str>,
) -> io::Result<()> {
    let mut line = to_line(&response).map_err(io::Error::other)?;
    if exceeds_frame_limit(&line) {
        warn!(operation, id = ?response.id, size = line.len(), "Response exceeds frame limit");
        let replacement = ResponseEnvelope::failure(
            response.id,
            classify::response_too_large(operation, line.len(), MAX_FRAME_BYTES),
        );
        line = to_line(&replacement).map_err(io::Error::other)?;
    }
    writer.write_line(&line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::classify::HandlerError;
    use crate::dispatch::protocol::{ErrorCategory, Parameters, WorkerOutbound};
    use serde_json::json;
    use std::io::Cursor;
    use std::rc::Rc;

    fn request(id: u64, op: &str, params: serde_json::Value, timeout: i64) -> RequestEnvelope {
        let parameters = match params {
            serde_json::Value::Object(map) => map,
            _ => Parameters::new(),
        };
        RequestEnvelope::new(id, op, parameters, timeout)
    }

    fn test_registry(calls: Rc<Cell<u32>>) -> OperationRegistry {
        let mut registry = OperationRegistry::new();
        let counter = calls.clone();
        registry
            .register("Echo", move |inv| {
                counter.set(counter.get() + 1);
                Ok(serde_json::Value::Object(inv.parameters.clone()))
            })
            .unwrap();
        let counter = calls.clone();
        registry
            .register("Fail", move |_| {
                counter.set(counter.get() + 1);
                Err(HandlerError::ElementNotEnabled("button is disabled".into()))
            })
            .unwrap();
        registry
            .register("Panic", |_| panic!("handler blew up"))
            .unwrap();
        registry
    }

    #[test]
    fn test_execute_success() {
        let registry = test_registry(Rc::new(Cell::new(0)));
        let resp = execute_request(&registry, &request(1, "Echo", json!({"a": 1}), 5));
        assert!(resp.success);
        assert_eq!(resp.id, Some(1));
        assert_eq!(resp.data, Some(json!({"a": 1})));
        assert!(resp.is_well_formed());
    }

    #[test]
    fn test_execute_classified_failure() {
        let registry = test_registry(Rc::new(Cell::new(0)));
        let resp = execute_request(&registry, &request(2, "Fail", json!({}), 5));
        assert!(!resp.success);
        assert_eq!(resp.error_category, Some(ErrorCategory::InvalidOperation));
        assert_eq!(resp.exception_type.as_deref(), Some("ElementNotEnabledException"));
        assert!(resp.is_well_formed());
    }

    #[test]
    fn test_unknown_operation_never_runs_a_handler() {
        let calls = Rc::new(Cell::new(0));
        let registry = test_registry(calls.clone());
        let resp = execute_request(&registry, &request(3, "echo", json!({}), 5));
        assert_eq!(resp.error_category, Some(ErrorCategory::NotFound));
        assert_eq!(resp.exception_type.as_deref(), Some(classify::OPERATION_NOT_FOUND));
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn test_invalid_timeout_rejected_before_handler() {
        let calls = Rc::new(Cell::new(0));
        let registry = test_registry(calls.clone());
        for timeout in [0, -5, MAX_TIMEOUT_SECS + 1] {
            let resp = execute_request(&registry, &request(4, "Echo", json!({}), timeout));
            assert_eq!(resp.error_category, Some(ErrorCategory::InvalidArgument));
        }
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn test_panic_is_caught() {
        let registry = test_registry(Rc::new(Cell::new(0)));
        let resp = execute_request(&registry, &request(5, "Panic", json!({}), 5));
        assert!(!resp.success);
        assert_eq!(resp.error_category, Some(ErrorCategory::Unexpected));
        assert_eq!(resp.exception_type.as_deref(), Some(classify::PANIC));
        assert!(resp.error.unwrap().contains("handler blew up"));
    }

    fn run_script(input: &str) -> (LoopExit, Vec<WorkerOutbound>) {
        let registry = test_registry(Rc::new(Cell::new(0)));
        run_bytes(&registry, input.as_bytes())
    }

    fn run_bytes(registry: &OperationRegistry, input: &[u8]) -> (LoopExit, Vec<WorkerOutbound>) {
        let mut reader = LineReader::new(Cursor::new(input.to_vec()));
        let mut out = Vec::new();
        let exit = {
            let mut writer = LineWriter::new(&mut out);
            run_loop(registry, &mut reader, &mut writer).unwrap()
        };
        let frames = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| WorkerOutbound::from_line(l).unwrap())
            .collect();
        (exit, frames)
    }

    #[test]
    fn test_loop_ready_then_fifo_responses() {
        let input = concat!(
            r#"{"id":1,"operation":"Echo","parameters":{"n":1},"timeoutSeconds":5}"#,
            "\n",
            r#"{"id":2,"operation":"Fail","parameters":{},"timeoutSeconds":5}"#,
            "\n",
            r#"{"id":3,"operation":"Echo","parameters":{"n":3},"timeoutSeconds":5}"#,
            "\n",
        );
        let (exit, frames) = run_script(input);
        assert_eq!(exit, LoopExit::Eof);
        assert_eq!(frames.len(), 4);

        match &frames[0] {
            WorkerOutbound::Control(ControlFrame::Ready { operations, .. }) => {
                assert_eq!(operations, &vec!["Echo", "Fail", "Panic"]);
            }
            other => panic!("Expected Ready first, got {:?}", other),
        }
        let ids: Vec<Option<u64>> = frames[1..]
            .iter()
            .map(|f| match f {
                WorkerOutbound::Response(r) => r.id,
                other => panic!("Expected response, got {:?}", other),
            })
            .collect();
        assert_eq!(ids, vec![Some(1), Some(2), Some(3)]);
    }

    #[test]
    fn test_loop_shutdown_stops_reading() {
        let input = concat!(
            r#"{"control":"shutdown"}"#,
            "\n",
            r#"{"id":1,"operation":"Echo"}"#,
            "\n",
        );
        let (exit, frames) = run_script(input);
        assert_eq!(exit, LoopExit::Shutdown);
        assert_eq!(frames.len(), 1); // only Ready
    }

    #[test]
    fn test_loop_malformed_frame_gets_error_with_salvaged_id() {
        let input = concat!(
            r#"{"id":9,"parameters":{}}"#,
            "\n",
            "not json at all\n",
            "\n",
        );
        let (_, frames) = run_script(input);
        assert_eq!(frames.len(), 3);
        for (frame, expected_id) in frames[1..].iter().zip([Some(9), None]) {
            match frame {
                WorkerOutbound::Response(r) => {
                    assert_eq!(r.id, expected_id);
                    assert_eq!(r.error_category, Some(ErrorCategory::InvalidArgument));
                    assert_eq!(r.exception_type.as_deref(), Some(classify::INVALID_REQUEST));
                }
                other => panic!("Expected response, got {:?}", other),
            }
        }
    }

    fn responses(frames: &[WorkerOutbound]) -> Vec<&ResponseEnvelope> {
        frames
            .iter()
            .filter_map(|f| match f {
                WorkerOutbound::Response(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_loop_answers_non_utf8_frame_and_keeps_serving() {
        let registry = test_registry(Rc::new(Cell::new(0)));
        let mut input = b"\xff\xfe\n".to_vec();
        input.extend_from_slice(
            br#"{"id":1,"operation":"Echo","parameters":{"n":1},"timeoutSeconds":5}"#,
        );
        input.push(b'\n');

        let (exit, frames) = run_bytes(&registry, &input);
        assert_eq!(exit, LoopExit::Eof);
        let responses = responses(&frames);
        assert_eq!(responses.len(), 2);

        assert_eq!(responses[0].id, None);
        assert_eq!(responses[0].error_category, Some(ErrorCategory::InvalidArgument));
        assert_eq!(responses[0].exception_type.as_deref(), Some(classify::INVALID_REQUEST));

        assert!(responses[1].success);
        assert_eq!(responses[1].id, Some(1));
    }

    #[test]
    fn test_loop_replaces_oversized_response() {
        let mut registry = OperationRegistry::new();
        registry
            .register("Huge", |_| Ok(serde_json::Value::String("x".repeat(MAX_FRAME_BYTES))))
            .unwrap();
        registry
            .register("Small", |_| Ok(json!({"ok": true})))
            .unwrap();
        let input = concat!(
            r#"{"id":7,"operation":"Huge","parameters":{},"timeoutSeconds":5}"#,
            "\n",
            r#"{"id":8,"operation":"Small","parameters":{},"timeoutSeconds":5}"#,
            "\n",
        );

        let (exit, frames) = run_bytes(&registry, input.as_bytes());
        assert_eq!(exit, LoopExit::Eof);
        let responses = responses(&frames);
        assert_eq!(responses.len(), 2);

        let huge = responses[0];
        assert_eq!(huge.id, Some(7));
        assert!(!huge.success);
        assert_eq!(huge.error_category, Some(ErrorCategory::Unexpected));
        assert_eq!(huge.exception_type.as_deref(), Some(classify::RESPONSE_TOO_LARGE));
        assert!(huge.error.as_deref().unwrap().contains("'Huge'"));

        assert!(responses[1].success);
        assert_eq!(responses[1].id, Some(8));
    }

    #[test]
    fn test_execution_thread_marker() {
        assert!(!is_execution_thread());
        let handle = spawn_execution_thread("test-exec", || {
            (
                is_execution_thread(),
                std::thread::current().name().map(String::from),
            )
        })
        .unwrap();
        let (flag, name) = handle.join().unwrap();
        assert!(flag);
        assert_eq!(name.as_deref(), Some("test-exec"));
    }
}
