//! Per-request lifecycle.
//!
//! ```text
//! Created -> Sent -> AwaitingResponse -> Completed(Success | Failure)
//!                 \-> TimedOut ---------> Abandoned (late response discarded)
//! ```
//!
//! A request can also complete straight from `Created` when it is rejected
//! before anything is sent, and straight from `Sent` when the session dies
//! before the caller starts waiting.
//!
//! `TimedOut` is where the caller's view of a request ends. Only the
//! dispatcher's own bookkeeping moves it on to `Abandoned`, once the late
//! response is discarded.

use crate::error::{BridgeError, Result};

/// How a completed request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Success,
    Failure,
}

/// Lifecycle state of one dispatched request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Created,
    Sent,
    AwaitingResponse,
    TimedOut,
    Completed(Completion),
    Abandoned,
}

impl RequestState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Sent => "Sent",
            Self::AwaitingResponse => "AwaitingResponse",
            Self::TimedOut => "TimedOut",
            Self::Completed(Completion::Success) => "Completed(Success)",
            Self::Completed(Completion::Failure) => "Completed(Failure)",
            Self::Abandoned => "Abandoned",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::Abandoned)
    }

    fn allows(&self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (Created, Sent)
                | (Created, Completed(Completion::Failure))
                | (Sent, AwaitingResponse)
                | (Sent, Completed(Completion::Failure))
                | (AwaitingResponse, Completed(_))
                | (AwaitingResponse, TimedOut)
                | (TimedOut, Abandoned)
        )
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn advance(&mut self, next: RequestState) -> Result<()> {
        if !self.allows(next) {
            return Err(BridgeError::InvalidTransition {
                from: self.name(),
                to: next.name(),
            });
        }
        *self = next;
        Ok(())
    }
}
