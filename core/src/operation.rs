//! Operations exchanged between coordinator, agents, and workers
//!
//! Every message body is either an [`Operation`] or a
//! [`crate::response::Response`]. Operations carry a routing
//! destination in their envelope and expect exactly one response from
//! the receiving side.

use serde::{Deserialize, Serialize};

use crate::failure::FailureOperation;
use crate::phase::TestPhase;
use crate::suite::{TestCase, TestSuite};

/// The kind of worker to launch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerType {
    /// A full data-grid member node
    Member,
    /// A thin client connecting to the grid
    Client,
}

impl WorkerType {
    /// The type name as used in logs and worker ids
    pub fn name(&self) -> &'static str {
        match self {
            WorkerType::Member => "member",
            WorkerType::Client => "client",
        }
    }
}

/// Launch settings for one worker process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Member or client
    pub worker_type: WorkerType,
    /// Version spec of the grid binary the worker should load
    pub version_spec: String,
}

impl WorkerSettings {
    /// Settings for a member worker on the default version
    pub fn member() -> Self {
        Self {
            worker_type: WorkerType::Member,
            version_spec: "default".into(),
        }
    }

    /// Settings for a client worker on the default version
    pub fn client() -> Self {
        Self {
            worker_type: WorkerType::Client,
            version_spec: "default".into(),
        }
    }
}

/// A periodic throughput/latency snapshot streamed from a worker during RUN
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSample {
    /// Index of the test the sample belongs to
    pub test_index: u32,
    /// Operations completed since the test started
    pub operation_count: u64,
    /// Throughput over the last sample interval
    pub interval_ops_per_second: f64,
    /// Latency percentiles over the last interval, if recorded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<LatencySnapshot>,
}

/// Latency percentiles in microseconds
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LatencySnapshot {
    /// 50th percentile
    pub p50_us: u64,
    /// 99th percentile
    pub p99_us: u64,
    /// 99.9th percentile
    pub p999_us: u64,
    /// Maximum observed
    pub max_us: u64,
}

/// Final benchmark numbers for one test on one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkReport {
    /// Index of the test the report belongs to
    pub test_index: u32,
    /// Total operations completed during RUN
    pub operation_count: u64,
    /// Wall-clock length of the RUN phase in milliseconds
    pub duration_ms: u64,
    /// Overall throughput
    pub ops_per_second: f64,
    /// Latency percentiles over the whole RUN
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<LatencySnapshot>,
}

/// Log severity carried by [`Operation::Log`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Informational
    Info,
    /// Degraded but continuing
    Warn,
    /// Failure
    Error,
}

/// A command or report routed through the message bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Operation {
    /// Register the suite with an agent before workers launch
    InitTestSuite {
        /// The suite to register
        suite: TestSuite,
    },
    /// Launch worker processes on an agent
    CreateWorkers {
        /// One entry per worker to launch
        settings: Vec<WorkerSettings>,
    },
    /// Construct the workload for a test on a worker
    InitTest {
        /// Registry index of the test
        test_index: u32,
        /// The test definition
        case: TestCase,
    },
    /// Start a lifecycle phase for a test
    StartPhase {
        /// Id of the test
        test_id: String,
        /// Registry index of the test
        test_index: u32,
        /// The phase to enter
        phase: TestPhase,
    },
    /// Stop the RUN phase of a test
    StopRun {
        /// Id of the test
        test_id: String,
        /// Registry index of the test
        test_index: u32,
    },
    /// Request the final benchmark numbers for a test
    GetBenchmarkResults {
        /// Id of the test
        test_id: String,
        /// Registry index of the test
        test_index: u32,
    },
    /// Final benchmark numbers, sent upstream by a worker
    BenchmarkResults {
        /// The report
        report: BenchmarkReport,
    },
    /// A phase finished on a worker, sent upstream
    PhaseCompleted {
        /// Registry index of the test
        test_index: u32,
        /// The completed phase
        phase: TestPhase,
    },
    /// Periodic throughput snapshot, sent upstream during RUN
    PerformanceSample {
        /// The snapshot
        sample: PerformanceSample,
    },
    /// Shut down all workers (agent) or this worker (worker)
    TerminateWorkers,
    /// Begin heartbeat-timeout detection on an agent
    StartTimeoutDetection,
    /// Stop heartbeat-timeout detection on an agent
    StopTimeoutDetection,
    /// Write a message into the receiver's log
    Log {
        /// Severity
        level: LogLevel,
        /// The message text
        message: String,
    },
    /// A failure report travelling from an agent to the coordinator
    Failure {
        /// The failure
        failure: FailureOperation,
    },
    /// Liveness probe; answered like any other operation
    Ping,
}

impl Operation {
    /// Short tag for logging without dumping payloads
    pub fn tag(&self) -> &'static str {
        match self {
            Operation::InitTestSuite { .. } => "initTestSuite",
            Operation::CreateWorkers { .. } => "createWorkers",
            Operation::InitTest { .. } => "initTest",
            Operation::StartPhase { .. } => "startPhase",
            Operation::StopRun { .. } => "stopRun",
            Operation::GetBenchmarkResults { .. } => "getBenchmarkResults",
            Operation::BenchmarkResults { .. } => "benchmarkResults",
            Operation::PhaseCompleted { .. } => "phaseCompleted",
            Operation::PerformanceSample { .. } => "performanceSample",
            Operation::TerminateWorkers => "terminateWorkers",
            Operation::StartTimeoutDetection => "startTimeoutDetection",
            Operation::StopTimeoutDetection => "stopTimeoutDetection",
            Operation::Log { .. } => "log",
            Operation::Failure { .. } => "failure",
            Operation::Ping => "ping",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_round_trips() {
        let op = Operation::StartPhase {
            test_id: "map".into(),
            test_index: 1,
            phase: TestPhase::GlobalWarmup,
        };
        let json = serde_json::to_string(&op).unwrap();
        assert!(json.contains("\"op\":\"startPhase\""), "{json}");
        assert!(json.contains("\"globalWarmup\""), "{json}");

        let back: Operation = serde_json::from_str(&json).unwrap();
        match back {
            Operation::StartPhase {
                test_id,
                test_index,
                phase,
            } => {
                assert_eq!(test_id, "map");
                assert_eq!(test_index, 1);
                assert_eq!(phase, TestPhase::GlobalWarmup);
            }
            other => panic!("wrong variant: {}", other.tag()),
        }
    }

    #[test]
    fn test_unit_variants_round_trip() {
        for op in [
            Operation::TerminateWorkers,
            Operation::StartTimeoutDetection,
            Operation::StopTimeoutDetection,
            Operation::Ping,
        ] {
            let json = serde_json::to_string(&op).unwrap();
            let back: Operation = serde_json::from_str(&json).unwrap();
            assert_eq!(back.tag(), op.tag());
        }
    }

    #[test]
    fn test_worker_settings_defaults() {
        let member = WorkerSettings::member();
        assert_eq!(member.worker_type, WorkerType::Member);
        assert_eq!(member.worker_type.name(), "member");
        assert_eq!(member.version_spec, "default");
    }
}
