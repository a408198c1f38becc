//! Failure classification at the worker boundary.
//!
//! Handlers fail with one of the fixed [`HandlerError`] signatures. The mapper
//! turns each signature into an [`ErrorDescriptor`] carrying a category, the
//! message, and a diagnostic type name. Only the signature is inspected; the
//! message text never influences the category.

use super::protocol::{ErrorCategory, ErrorDescriptor};
use std::any::Any;
use thiserror::Error;

/// Type name reported when the requested operation is not registered.
pub const OPERATION_NOT_FOUND: &str = "OperationNotFound";

/// Type name reported for frames that are not valid request envelopes.
pub const INVALID_REQUEST: &str = "InvalidRequest";

/// Type name reported when a handler panics.
pub const PANIC: &str = "Panic";

/// Type name reported when an encoded response would exceed the frame cap.
pub const RESPONSE_TOO_LARGE: &str = "ResponseTooLarge";

/// The recognized failure signatures a handler may raise.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The target UI element no longer exists or was never found.
    #[error("{0}")]
    ElementNotAvailable(String),

    /// A lookup key (window handle, cached element id) is unknown.
    #[error("{0}")]
    NotFound(String),

    /// The element exists but is disabled.
    #[error("{0}")]
    ElementNotEnabled(String),

    /// The element does not implement the requested control pattern.
    #[error("{0}")]
    PatternNotSupported(String),

    /// The element is in the wrong state for the requested action.
    #[error("{0}")]
    InvalidOperation(String),

    /// A required parameter was not supplied.
    #[error("Missing required parameter '{0}'")]
    ArgumentMissing(String),

    /// A parameter was supplied but is malformed or out of range.
    #[error("{0}")]
    InvalidArgument(String),

    /// The OS refused access to the target.
    #[error("{0}")]
    UnauthorizedAccess(String),

    /// The handler exceeded its own internal budget.
    #[error("{0}")]
    Timeout(String),

    /// Anything else, with the originating type name kept for diagnostics.
    #[error("{message}")]
    Unexpected { type_name: String, message: String },
}

impl HandlerError {
    /// Wrap an arbitrary error as `Unexpected`, keeping its Rust type name.
    pub fn unexpected<E: std::error::Error>(err: E) -> Self {
        Self::Unexpected {
            type_name: short_type_name(std::any::type_name::<E>()).to_string(),
            message: err.to_string(),
        }
    }

    /// Category this signature maps to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ElementNotAvailable(_) | Self::NotFound(_) => ErrorCategory::NotFound,
            Self::ElementNotEnabled(_)
            | Self::PatternNotSupported(_)
            | Self::InvalidOperation(_) => ErrorCategory::InvalidOperation,
            Self::ArgumentMissing(_) | Self::InvalidArgument(_) => ErrorCategory::InvalidArgument,
            Self::UnauthorizedAccess(_) => ErrorCategory::Unauthorized,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::Unexpected { .. } => ErrorCategory::Unexpected,
        }
    }

    /// Diagnostic type name reported across the boundary.
    pub fn type_name(&self) -> &str {
        match self {
            Self::ElementNotAvailable(_) => "ElementNotAvailableException",
            Self::NotFound(_) => "KeyNotFoundException",
            Self::ElementNotEnabled(_) => "ElementNotEnabledException",
            Self::PatternNotSupported(_) => "PatternNotSupportedException",
            Self::InvalidOperation(_) => "InvalidOperationException",
            Self::ArgumentMissing(_) => "ArgumentNullException",
            Self::InvalidArgument(_) => "ArgumentException",
            Self::UnauthorizedAccess(_) => "UnauthorizedAccessException",
            Self::Timeout(_) => "TimeoutException",
            Self::Unexpected { type_name, .. } => type_name,
        }
    }
}

/// Result type returned by operation handlers.
pub type HandlerResult = std::result::Result<serde_json::Value, HandlerError>;

/// Map a handler failure onto the wire descriptor.
pub fn classify(err: &HandlerError) -> ErrorDescriptor {
    ErrorDescriptor::new(err.category(), err.to_string(), err.type_name())
}

/// Map a caught panic payload onto the wire descriptor.
pub fn classify_panic(operation: &str, payload: &(dyn Any + Send)) -> ErrorDescriptor {
    let detail = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    };
    ErrorDescriptor::new(
        ErrorCategory::Unexpected,
        format!("Handler for '{}' panicked: {}", operation, detail),
        PANIC,
    )
}

/// Descriptor for an operation name with no registered handler.
pub fn operation_not_found(operation: &str) -> ErrorDescriptor {
    ErrorDescriptor::new(
        ErrorCategory::NotFound,
        format!("Operation '{}' is not registered", operation),
        OPERATION_NOT_FOUND,
    )
}

/// Descriptor for a frame that could not be decoded as a request.
pub fn invalid_request(reason: impl std::fmt::Display) -> ErrorDescriptor {
    ErrorDescriptor::new(
        ErrorCategory::InvalidArgument,
        format!("Invalid request: {}", reason),
        INVALID_REQUEST,
    )
}

/// Descriptor replacing a response whose encoded frame is `size` bytes,
/// more than the channel accepts.
pub fn response_too_large(operation: Option<&str>, size: usize, limit: usize) -> ErrorDescriptor {
    let subject = match operation {
        Some(op) => format!("Response for '{}'", op),
        None => "Response".to_string(),
    };
    ErrorDescriptor::new(
        ErrorCategory::Unexpected,
        format!("{} is {} bytes, over the {} byte frame limit", subject, size, limit),
        RESPONSE_TOO_LARGE,
    )
}

/// Strip the module path from a Rust type name.
fn short_type_name(full: &str) -> &str {
    let head = full.split('<').next().unwrap_or(full);
    head.rsplit("::").next().unwrap_or(head)
}
