//! Process-isolated operation dispatch.
//!
//! The wrapped accessibility API binds every object to the thread that
//! created it, so all calls run in a separate worker process on one
//! dedicated execution thread. The parent serializes each call into a
//! frame, waits for the matching response with a bounded timeout, and
//! turns whatever happens into a uniform [`DispatchResult`].
//!
//! # Architecture
//!
//! ```text
//!   caller threads          Parent Process                 Worker Process
//!  ┌──────────────┐   ┌──────────────────────────┐   ┌──────────────────────────┐
//!  │ execute(...) ├──►│ Dispatcher               │   │ execution thread         │
//!  │ execute(...) ├──►│  id + reply slot per call│   │  OperationRegistry       │
//!  └──────────────┘   │  writer thread ──────────┼──►│  run_loop (FIFO)         │
//!                     │  reader thread ◄─────────┼───┤  handler -> classify     │
//!                     ├──────────────────────────┤   └──────────────────────────┘
//!                     │ Supervisor               │
//!                     │  spawn / stop / restart  │
//!                     └──────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Thread affinity**: handlers only ever run on the execution thread
//! - **Bounded waits**: each call times out from its own send time
//! - **Crash containment**: worker death fails pending calls immediately
//! - **Fixed taxonomy**: every failure carries one of seven categories

mod classify;
pub mod diagnostics;
mod dispatcher;
mod ipc;
mod params;
mod proc;
mod protocol;
mod registry;
mod signals;
mod spawn;
mod state;
mod supervisor;
mod worker;
pub mod worker_main;

pub use classify::{HandlerError, HandlerResult, classify, classify_panic};
pub use dispatcher::{DispatchResult, DispatchStats, Dispatcher, ExitProbe};
pub use ipc::{Frame, LineReader, LineWriter, MAX_FRAME_BYTES, exceeds_frame_limit};
pub use params::ParamsExt;
pub use protocol::{
    ControlFrame, DEFAULT_TIMEOUT_SECS, ErrorCategory, ErrorDescriptor, MAX_TIMEOUT_SECS,
    Parameters, RequestEnvelope, ResponseEnvelope, WorkerInbound, WorkerOutbound,
};
pub use registry::{Handler, Invocation, OperationRegistry};
pub use signals::{TerminationReason, WorkerFailure};
pub use proc::WorkerProc;
pub use spawn::{SpawnedWorker, WorkerCommand, spawn_worker};
pub use state::{Completion, RequestState};
pub use supervisor::{RestartPolicy, Supervisor, SupervisorConfig, SupervisorStats};
pub use worker::{
    EXECUTION_THREAD_NAME, LoopExit, execute_request, is_execution_thread, run_loop,
    spawn_execution_thread,
};
pub use worker_main::{run_worker_main, run_worker_with};
