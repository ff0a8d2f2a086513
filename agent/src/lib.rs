//! Agent daemon for gridbench
//!
//! An agent runs on every test-cluster host. It exposes one network
//! endpoint to the coordinator, forks and supervises worker child
//! processes, and scans for worker failures (exception artifacts, OOM
//! artifacts, heartbeat timeouts, unexpected exits), forwarding
//! everything it finds upstream.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod connector;
mod error;
mod monitor;
mod process;

pub use connector::{Agent, AgentConfig, UpstreamSender};
pub use error::{AgentError, AgentResult};
pub use monitor::{FailureSink, MonitorConfig, WorkerProcessFailureMonitor};
pub use process::{ProcessProbe, WorkerLaunchConfig, WorkerProcess, WorkerProcessManager};
