//! Diagnostic operations for exercising the engine end to end.
//!
//! These are registered only when the worker runs with `--diagnostics`. They
//! touch no UI state: `Ping` reports where handlers run, `Echo` returns its
//! parameters, `Sleep` holds the execution thread, and `Exit` terminates the
//! worker process to simulate a crash.

use super::classify::{HandlerError, HandlerResult};
use super::params::ParamsExt;
use super::registry::{Invocation, OperationRegistry};
use super::worker::is_execution_thread;
use crate::error::Result;
use serde_json::{Value, json};
use std::time::Duration;

/// Longest sleep `Sleep` accepts (10 minutes).
const MAX_SLEEP_MS: i64 = 600_000;

/// Slice used when `Sleep` honors its deadline.
const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Register the diagnostic operations.
pub fn register_diagnostics(registry: &mut OperationRegistry) -> Result<()> {
    registry.register("Ping", ping)?;
    registry.register("Echo", echo)?;
    registry.register("Sleep", sleep)?;
    registry.register("Exit", exit)?;
    Ok(())
}

fn ping(_inv: &Invocation<'_>) -> HandlerResult {
    let thread = std::thread::current();
    Ok(json!({
        "pid": std::process::id(),
        "thread": thread.name(),
        "executionThread": is_execution_thread(),
    }))
}

fn echo(inv: &Invocation<'_>) -> HandlerResult {
    Ok(Value::Object(inv.parameters.clone()))
}

/// `{ms: int, honorDeadline?: bool}`.
fn sleep(inv: &Invocation<'_>) -> HandlerResult {
    let ms = inv.parameters.require_i64("ms")?;
    if !(0..=MAX_SLEEP_MS).contains(&ms) {
        return Err(HandlerError::InvalidArgument(format!(
            "Parameter 'ms' must be between 0 and {}, got {}",
            MAX_SLEEP_MS, ms
        )));
    }
    let total = Duration::from_millis(ms.unsigned_abs());
    let honor_deadline = inv.parameters.opt_bool("honorDeadline")?.unwrap_or(false);

    if honor_deadline {
        let start = std::time::Instant::now();
        while start.elapsed() < total {
            inv.check_deadline()?;
            std::thread::sleep(SLEEP_SLICE.min(total.saturating_sub(start.elapsed())));
        }
    } else {
        std::thread::sleep(total);
    }
    Ok(json!({ "sleptMs": ms }))
}

/// `{code?: int}`. Never returns.
fn exit(inv: &Invocation<'_>) -> HandlerResult {
    let code = inv.parameters.opt_i64("code")?.unwrap_or(3);
    let code = i32::try_from(code)
        .map_err(|_| HandlerError::InvalidArgument(format!("Exit code {} out of range", code)))?;
    tracing::warn!(code, "Exit requested by diagnostic operation");
    std::process::exit(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::protocol::Parameters;

    fn registry() -> OperationRegistry {
        let mut registry = OperationRegistry::new();
        register_diagnostics(&mut registry).unwrap();
        registry
    }

    fn invoke(registry: &OperationRegistry, op: &str, params: Value, budget: Duration) -> HandlerResult {
        let params: Parameters = match params {
            Value::Object(map) => map,
            _ => Parameters::new(),
        };
        let inv = Invocation::new(op, &params, budget);
        registry.resolve(op).expect("registered")(&inv)
    }

    #[test]
    fn test_registers_all() {
        assert_eq!(registry().names(), vec!["Echo", "Exit", "Ping", "Sleep"]);
    }

    #[test]
    fn test_registering_twice_fails() {
        let mut registry = registry();
        assert!(register_diagnostics(&mut registry).is_err());
    }

    #[test]
    fn test_ping_reports_process() {
        let data = invoke(&registry(), "Ping", json!({}), Duration::from_secs(1)).unwrap();
        assert_eq!(data["pid"], std::process::id());
        assert_eq!(data["executionThread"], false);
    }

    #[test]
    fn test_echo() {
        let data = invoke(&registry(), "Echo", json!({"nested": {"a": [1, 2]}}), Duration::from_secs(1)).unwrap();
        assert_eq!(data, json!({"nested": {"a": [1, 2]}}));
    }

    #[test]
    fn test_sleep_validates() {
        let r = registry();
        assert!(matches!(
            invoke(&r, "Sleep", json!({}), Duration::from_secs(1)),
            Err(HandlerError::ArgumentMissing(_))
        ));
        assert!(matches!(
            invoke(&r, "Sleep", json!({"ms": -1}), Duration::from_secs(1)),
            Err(HandlerError::InvalidArgument(_))
        ));
        let data = invoke(&r, "Sleep", json!({"ms": 5}), Duration::from_secs(1)).unwrap();
        assert_eq!(data["sleptMs"], 5);
    }

    #[test]
    fn test_sleep_honoring_deadline_times_out_internally() {
        let start = std::time::Instant::now();
        let err = invoke(
            &registry(),
            "Sleep",
            json!({"ms": 5000, "honorDeadline": true}),
            Duration::from_millis(50),
        )
        .unwrap_err();
        assert!(matches!(err, HandlerError::Timeout(_)));
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
