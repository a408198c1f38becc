//! axbridge - process-isolated dispatch of accessibility operations.
//!
//! See [`dispatch`] for the engine; [`logging`] sets up `tracing` for both
//! the parent and the worker process.

pub mod dispatch;
pub mod error;
pub mod logging;

pub use error::{BridgeError, Result};
