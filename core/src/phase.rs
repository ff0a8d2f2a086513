//! The fixed test-phase lifecycle
//!
//! Every test steps through the same eight phases in declared order.
//! Phases prefixed `global` execute on exactly one designated worker;
//! all other phases execute on every worker hosting the test.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Ordered lifecycle stages applied to every test
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TestPhase {
    /// Construct the workload and its resources
    Setup,
    /// Warm up on every worker
    LocalWarmup,
    /// Warm up on the designated first worker only
    GlobalWarmup,
    /// The timed benchmark body
    Run,
    /// Verify on the designated first worker only
    GlobalVerify,
    /// Verify on every worker
    LocalVerify,
    /// Tear down on the designated first worker only
    GlobalTeardown,
    /// Tear down on every worker
    LocalTeardown,
}

impl TestPhase {
    /// All phases in execution order
    pub fn iter() -> impl Iterator<Item = TestPhase> {
        [
            TestPhase::Setup,
            TestPhase::LocalWarmup,
            TestPhase::GlobalWarmup,
            TestPhase::Run,
            TestPhase::GlobalVerify,
            TestPhase::LocalVerify,
            TestPhase::GlobalTeardown,
            TestPhase::LocalTeardown,
        ]
        .into_iter()
    }

    /// Whether this phase runs on a single designated worker
    pub fn is_global(&self) -> bool {
        matches!(
            self,
            TestPhase::GlobalWarmup | TestPhase::GlobalVerify | TestPhase::GlobalTeardown
        )
    }

    /// The phase name as used in logs and wire messages
    pub fn name(&self) -> &'static str {
        match self {
            TestPhase::Setup => "setup",
            TestPhase::LocalWarmup => "localWarmup",
            TestPhase::GlobalWarmup => "globalWarmup",
            TestPhase::Run => "run",
            TestPhase::GlobalVerify => "globalVerify",
            TestPhase::LocalVerify => "localVerify",
            TestPhase::GlobalTeardown => "globalTeardown",
            TestPhase::LocalTeardown => "localTeardown",
        }
    }

    /// The last phase in the lifecycle
    pub fn last() -> TestPhase {
        TestPhase::LocalTeardown
    }
}

impl fmt::Display for TestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for TestPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TestPhase::iter()
            .find(|phase| phase.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown test phase '{s}'"))
    }
}
