//! Supervision of the oCIS server and its individually started services.
//!
//! Handles:
//! - Process lifecycle (start, stop, restart) with bounded crash retries
//! - Forwarding of process output to the wrapper's stdout
//! - Confirmation that no server process survived a stop
//! - Readiness polling after every (re)start
//! - One-shot interactive commands on a pseudo-terminal
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │                 Supervisor                 │
//! ├────────────────────────────────────────────┤
//! │ Registry │ LogPump │ Shutdown │ Readiness  │
//! │ (pids)   │ (lines) │ (sysinfo)│ (reqwest)  │
//! ├────────────────────────────────────────────┤
//! │   ocis server   │   <service> server  ...  │
//! └────────────────────────────────────────────┘
//! ```

pub mod command;
pub mod controller;
pub mod log_pump;
pub mod readiness;
pub mod registry;
pub mod shutdown;

pub use command::{CommandOutput, CommandRunner};
pub use controller::Supervisor;
pub use log_pump::{ConsoleSink, LogLine, LogSink, Stream};
pub use readiness::ReadinessProber;
pub use registry::{ProcessRegistry, PARENT};
pub use shutdown::{InvocationSignature, ProcessTable, ShutdownPoller, SystemProcessTable};
