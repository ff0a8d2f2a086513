//! Coordinator for gridbench
//!
//! The coordinator is the single central controller of a benchmark
//! run: it connects to every agent, launches workers, sequences each
//! test through the phase lifecycle (sequentially or in parallel with
//! phase barriers), aggregates failures and performance data, and
//! terminates the fleet at the end.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
mod connector;
mod engine;
mod error;
mod failures;
mod listeners;
mod performance;
mod remote;
mod runner;
mod sync;

#[cfg(test)]
mod testutil;

pub use connector::{spawn_failure_dispatcher, CoordinatorConnector};
pub use engine::{Coordinator, CoordinatorParameters};
pub use error::{CoordinatorError, CoordinatorResult};
pub use failures::FailureContainer;
pub use listeners::{PhaseCompletion, TestPhaseListeners};
pub use performance::PerformanceStatsContainer;
pub use remote::{ensure_success, RemoteClient};
pub use runner::{TestCaseRunner, TestCaseRunnerConfig};
pub use sync::{CountdownLatch, TestPhaseSyncMap};
