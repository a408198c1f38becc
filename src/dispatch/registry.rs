//! Operation registry: the fixed name -> handler table of a worker.
//!
//! The registry is built once, on the worker's dedicated thread, before the
//! readiness handshake. Handlers are not required to be `Send`: they may hold
//! thread-affine native resources, and the registry itself never leaves the
//! thread that built it.

use super::classify::{HandlerError, HandlerResult};
use super::protocol::Parameters;
use crate::error::{BridgeError, Result};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

/// Everything a handler gets to see about one request.
pub struct Invocation<'a> {
    pub operation: &'a str,
    pub parameters: &'a Parameters,
    deadline: Instant,
}

impl<'a> Invocation<'a> {
    pub fn new(operation: &'a str, parameters: &'a Parameters, budget: Duration) -> Self {
        Self {
            operation,
            parameters,
            deadline: Instant::now() + budget,
        }
    }

    /// Point in time after which the caller has stopped waiting.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Budget left before the deadline (zero once it has passed).
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Fail with the internal `Timeout` signature once the budget is spent.
    ///
    /// Long-running handlers call this between steps; nothing interrupts a
    /// handler that does not.
    pub fn check_deadline(&self) -> std::result::Result<(), HandlerError> {
        if Instant::now() >= self.deadline {
            Err(HandlerError::Timeout(format!(
                "Operation '{}' exceeded its time budget",
                self.operation
            )))
        } else {
            Ok(())
        }
    }
}

/// A registered operation handler.
pub type Handler = Box<dyn Fn(&Invocation<'_>) -> HandlerResult>;

/// Name -> handler table with exact, case-sensitive lookup.
#[derive(Default)]
pub struct OperationRegistry {
    handlers: HashMap<String, Handler>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a unique name.
    pub fn register<F>(&mut self, name: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(&Invocation<'_>) -> HandlerResult + 'static,
    {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(BridgeError::EmptyOperationName);
        }
        if self.handlers.contains_key(&name) {
            return Err(BridgeError::DuplicateOperation(name));
        }
        tracing::trace!(operation = %name, "Registered operation");
        self.handlers.insert(name, Box::new(handler));
        Ok(())
    }

    /// Look up a handler by exact name.
    pub fn resolve(&self, name: &str) -> Option<&Handler> {
        self.handlers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("operations", &self.names())
            .finish()
    }
}
