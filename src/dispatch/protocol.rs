//! Wire protocol between the dispatcher and the worker subprocess.
//!
//! Every frame is a single JSON object terminated by a newline. Requests and
//! responses use the envelope shapes below; lifecycle frames carry a `control`
//! field instead of an `operation` / `success` field.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Timeout applied when a request does not carry one.
pub const DEFAULT_TIMEOUT_SECS: i64 = 30;

/// Upper bound on any single request's timeout budget.
pub const MAX_TIMEOUT_SECS: i64 = 600;

/// Weakly-typed parameter set handed to a handler.
pub type Parameters = serde_json::Map<String, Value>;

fn default_timeout() -> i64 {
    DEFAULT_TIMEOUT_SECS
}

/// Fixed failure taxonomy shared by both sides of the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// Target element or operation absent.
    NotFound,
    /// Element exists but can't do this right now.
    InvalidOperation,
    /// Malformed or missing parameter.
    InvalidArgument,
    /// OS-level access denial.
    Unauthorized,
    /// A budget elapsed, either the handler's own or the caller's.
    Timeout,
    /// Anything unrecognized.
    Unexpected,
    /// The worker process itself is unusable.
    SessionFatal,
}

impl ErrorCategory {
    /// All categories, in declaration order.
    pub const ALL: [ErrorCategory; 7] = [
        Self::NotFound,
        Self::InvalidOperation,
        Self::InvalidArgument,
        Self::Unauthorized,
        Self::Timeout,
        Self::Unexpected,
        Self::SessionFatal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::InvalidOperation => "InvalidOperation",
            Self::InvalidArgument => "InvalidArgument",
            Self::Unauthorized => "Unauthorized",
            Self::Timeout => "Timeout",
            Self::Unexpected => "Unexpected",
            Self::SessionFatal => "SessionFatal",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Categorized failure that crosses the process boundary in place of an
/// error object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDescriptor {
    pub message: String,
    pub category: ErrorCategory,
    /// Diagnostic type name of the original failure, preserved verbatim.
    pub exception_type: String,
}

impl ErrorDescriptor {
    pub fn new(
        category: ErrorCategory,
        message: impl Into<String>,
        exception_type: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            category,
            exception_type: exception_type.into(),
        }
    }
}

impl fmt::Display for ErrorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}): {}",
            self.category, self.exception_type, self.message
        )
    }
}

impl std::error::Error for ErrorDescriptor {}

/// Request from parent to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    /// Correlation token assigned by the dispatcher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub operation: String,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: i64,
}

impl RequestEnvelope {
    pub fn new(id: u64, operation: impl Into<String>, parameters: Parameters, timeout: i64) -> Self {
        Self {
            id: Some(id),
            operation: operation.into(),
            parameters,
            timeout_seconds: timeout,
        }
    }
}

/// Response from worker to parent.
///
/// Exactly one of `data` / `error` is meaningful, selected by `success`. A
/// successful response may carry a null payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    #[serde(default)]
    pub id: Option<u64>,
    pub success: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_category: Option<ErrorCategory>,
    #[serde(default)]
    pub exception_type: Option<String>,
}

impl ResponseEnvelope {
    /// Create a successful response. A JSON null payload is stored as `None`.
    pub fn success(id: Option<u64>, data: Value) -> Self {
        Self {
            id,
            success: true,
            data: if data.is_null() { None } else { Some(data) },
            error: None,
            error_category: None,
            exception_type: None,
        }
    }

    /// Create a failed response from a classified error.
    pub fn failure(id: Option<u64>, error: ErrorDescriptor) -> Self {
        Self {
            id,
            success: false,
            data: None,
            error: Some(error.message),
            error_category: Some(error.category),
            exception_type: Some(error.exception_type),
        }
    }

    /// Extract the error descriptor of a failed response.
    ///
    /// Missing fields on a malformed failure degrade to `Unexpected`.
    pub fn error_descriptor(&self) -> Option<ErrorDescriptor> {
        if self.success {
            return None;
        }
        Some(ErrorDescriptor {
            message: self.error.clone().unwrap_or_default(),
            category: self.error_category.unwrap_or(ErrorCategory::Unexpected),
            exception_type: self
                .exception_type
                .clone()
                .unwrap_or_else(|| "Unknown".to_string()),
        })
    }

    /// Check the payload/error exclusivity invariant.
    pub fn is_well_formed(&self) -> bool {
        if self.success {
            self.error.is_none() && self.error_category.is_none() && self.exception_type.is_none()
        } else {
            self.data.is_none() && self.error.is_some() && self.error_category.is_some()
        }
    }
}

/// Lifecycle frames exchanged outside the request/response flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "control", rename_all = "snake_case")]
pub enum ControlFrame {
    /// Worker has built its registry and is reading requests.
    Ready { pid: u32, operations: Vec<String> },
    /// Parent asks the worker to exit cleanly.
    Shutdown,
}

/// Any frame the worker may receive.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerInbound {
    Control(ControlFrame),
    Request(RequestEnvelope),
}

/// Any frame the parent may receive.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutbound {
    Control(ControlFrame),
    Response(ResponseEnvelope),
}

fn is_control(value: &Value) -> bool {
    value.get("control").is_some()
}

/// Serialize any frame to a JSON line (with newline).
pub fn to_line<T: Serialize>(frame: &T) -> Result<String> {
    let mut json = serde_json::to_string(frame)?;
    json.push('\n');
    Ok(json)
}

impl WorkerInbound {
    /// Decode an already-parsed JSON frame.
    pub fn from_value(value: Value) -> std::result::Result<Self, serde_json::Error> {
        if is_control(&value) {
            serde_json::from_value(value).map(Self::Control)
        } else {
            serde_json::from_value(value).map(Self::Request)
        }
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> std::result::Result<Self, serde_json::Error> {
        Self::from_value(serde_json::from_str(line.trim())?)
    }

    pub fn to_line(&self) -> Result<String> {
        match self {
            Self::Control(frame) => to_line(frame),
            Self::Request(request) => to_line(request),
        }
    }
}

impl WorkerOutbound {
    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> std::result::Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(line.trim())?;
        if is_control(&value) {
            serde_json::from_value(value).map(Self::Control)
        } else {
            serde_json::from_value(value).map(Self::Response)
        }
    }

    pub fn to_line(&self) -> Result<String> {
        match self {
            Self::Control(frame) => to_line(frame),
            Self::Response(response) => to_line(response),
        }
    }
}
