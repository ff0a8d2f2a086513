//! Test suites and test cases
//!
//! A [`TestSuite`] is an ordered sequence of [`TestCase`]s plus the
//! run-wide settings (duration, fail-fast policy, tolerated failure
//! kinds). A [`TestCase`] is an id plus a free-form property map; the
//! `class` property names the workload to execute.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::failure::FailureKind;

/// Property key naming the workload a test case executes
pub const CLASS_PROPERTY: &str = "class";

/// A single test definition: an id plus workload properties
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    /// Unique id within the suite
    pub id: String,
    /// Workload configuration; keys are unique, order irrelevant
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl TestCase {
    /// Create a test case with no properties
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Set a property, replacing any previous value
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Look up a property
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// The workload name from the `class` property
    pub fn workload_class(&self) -> Option<&str> {
        self.property(CLASS_PROPERTY)
    }

    /// Parse a property into any `FromStr` type, with a default when absent
    pub fn parsed_property<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.property(key)
            .and_then(|value| value.parse().ok())
            .unwrap_or(default)
    }
}

impl fmt::Display for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TestCase[{}]", self.id)?;
        for (key, value) in &self.properties {
            write!(f, ", {key}={value}")?;
        }
        Ok(())
    }
}

/// An ordered collection of test cases and their run-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSuite {
    /// Short unique token identifying this run
    pub id: String,
    /// Tests in declared order
    pub cases: Vec<TestCase>,
    /// Length of the RUN phase; `0` skips the run entirely
    pub duration_seconds: u64,
    /// Run until the workload stops itself instead of a fixed duration
    pub wait_for_test_case: bool,
    /// Abort remaining tests after the first critical failure
    pub fail_fast: bool,
    /// Failure kinds that do not count as critical
    pub tolerable_failures: BTreeSet<FailureKind>,
}

impl TestSuite {
    /// Create an empty suite with a freshly generated id
    pub fn new() -> Self {
        Self::with_id(generate_suite_id())
    }

    /// Create an empty suite with an explicit id
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            cases: Vec::new(),
            duration_seconds: 0,
            wait_for_test_case: false,
            fail_fast: false,
            tolerable_failures: BTreeSet::from([FailureKind::WorkerFinished]),
        }
    }

    /// Append a test case
    pub fn add_test(&mut self, case: TestCase) {
        self.cases.push(case);
    }

    /// Number of tests in the suite
    pub fn size(&self) -> usize {
        self.cases.len()
    }

    /// Length of the longest test-case id, for aligned log output
    pub fn max_case_id_len(&self) -> usize {
        self.cases.iter().map(|case| case.id.len()).max().unwrap_or(0)
    }

    /// Whether the given failure kind is tolerated by this suite
    pub fn tolerates(&self, kind: FailureKind) -> bool {
        self.tolerable_failures.contains(&kind)
    }
}

impl Default for TestSuite {
    fn default() -> Self {
        Self::new()
    }
}

/// Generate a timestamp-based suite id token
fn generate_suite_id() -> String {
    chrono::Local::now().format("%Y_%m_%d__%H_%M_%S").to_string()
}
