//! Worker runtime for gridbench
//!
//! A worker is a child process launched by an agent. It reads
//! operations from stdin, executes test phases against the target data
//! grid through a named workload, and reports completions, performance
//! samples, and benchmark results back on stdout. Unhandled workload
//! errors are dropped as `.exception` artifact files in the worker home
//! directory, where the agent's failure monitor picks them up.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod perf;
mod runtime;
mod workload;
mod workloads;

pub use error::{WorkerError, WorkerResult};
pub use perf::OperationTracker;
pub use runtime::{WorkerConfig, WorkerRuntime};
pub use workload::{TestContext, Workload, WorkloadError, WorkloadRegistry};
