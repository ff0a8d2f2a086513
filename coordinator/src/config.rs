//! Agents-file and suite-descriptor loading
//!
//! The agents file is newline-separated `publicIp[,privateIp]` entries;
//! the suite descriptor is a JSON document listing test cases and
//! run-wide settings. Both feed the component registry and the engine.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use gridbench_core::failure::FailureKind;
use gridbench_core::registry::ComponentRegistry;
use gridbench_core::suite::{TestCase, TestSuite};

use crate::error::{CoordinatorError, CoordinatorResult};

/// Parse agents-file content into `(public, private)` address pairs
///
/// Blank lines and `#` comments are skipped; a missing private address
/// falls back to the public one.
pub fn parse_agents(content: &str) -> CoordinatorResult<Vec<(String, String)>> {
    let mut agents = Vec::new();
    for (line_number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.splitn(2, ',');
        let public = parts
            .next()
            .map(str::trim)
            .filter(|address| !address.is_empty())
            .ok_or_else(|| {
                CoordinatorError::Config(format!("agents file line {}: empty entry", line_number + 1))
            })?;
        let private = parts.next().map(str::trim).unwrap_or(public);
        agents.push((public.to_string(), private.to_string()));
    }
    if agents.is_empty() {
        return Err(CoordinatorError::Config("agents file names no agents".into()));
    }
    Ok(agents)
}

/// Load an agents file into a fresh component registry
pub fn load_registry(path: &Path) -> CoordinatorResult<Arc<ComponentRegistry>> {
    let content = std::fs::read_to_string(path).map_err(|err| {
        CoordinatorError::Config(format!("could not read agents file {}: {err}", path.display()))
    })?;
    let registry = Arc::new(ComponentRegistry::new());
    for (public, private) in parse_agents(&content)? {
        registry.add_agent(public, private);
    }
    Ok(registry)
}

/// On-disk shape of a suite descriptor
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SuiteSpec {
    tests: Vec<TestCaseSpec>,
    #[serde(default)]
    duration_seconds: u64,
    #[serde(default)]
    wait_for_test_case: bool,
    #[serde(default)]
    fail_fast: bool,
    #[serde(default)]
    tolerable_failures: Option<Vec<FailureKind>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct TestCaseSpec {
    id: String,
    #[serde(default)]
    properties: BTreeMap<String, String>,
}

/// Parse suite-descriptor content into a suite with a fresh id
pub fn parse_suite(content: &str) -> CoordinatorResult<TestSuite> {
    let spec: SuiteSpec = serde_json::from_str(content)
        .map_err(|err| CoordinatorError::Config(format!("suite descriptor: {err}")))?;
    if spec.tests.is_empty() {
        return Err(CoordinatorError::Config("suite descriptor names no tests".into()));
    }

    let mut suite = TestSuite::new();
    suite.duration_seconds = spec.duration_seconds;
    suite.wait_for_test_case = spec.wait_for_test_case;
    suite.fail_fast = spec.fail_fast;
    if let Some(tolerable) = spec.tolerable_failures {
        suite.tolerable_failures = BTreeSet::from_iter(tolerable);
    }

    let mut seen = BTreeSet::new();
    for test in spec.tests {
        if !seen.insert(test.id.clone()) {
            return Err(CoordinatorError::Config(format!(
                "duplicate test id '{}'",
                test.id
            )));
        }
        suite.add_test(TestCase {
            id: test.id,
            properties: test.properties,
        });
    }
    Ok(suite)
}

/// Load a suite descriptor from disk
pub fn load_suite(path: &Path) -> CoordinatorResult<TestSuite> {
    let content = std::fs::read_to_string(path).map_err(|err| {
        CoordinatorError::Config(format!(
            "could not read suite descriptor {}: {err}",
            path.display()
        ))
    })?;
    parse_suite(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_agents_with_private_addresses() {
        let content = "10.0.0.1,192.168.0.1\n# a comment\n\n10.0.0.2\n";
        let agents = parse_agents(content).unwrap();
        assert_eq!(
            agents,
            vec![
                ("10.0.0.1".to_string(), "192.168.0.1".to_string()),
                ("10.0.0.2".to_string(), "10.0.0.2".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_agents_rejects_empty_file() {
        assert!(matches!(
            parse_agents("# nothing\n"),
            Err(CoordinatorError::Config(_))
        ));
    }

    #[test]
    fn test_parse_suite() {
        let content = r#"{
            "tests": [
                {"id": "map", "properties": {"class": "success"}},
                {"id": "queue", "properties": {"class": "sleep", "sleepSeconds": "2"}}
            ],
            "durationSeconds": 60,
            "failFast": true
        }"#;

        let suite = parse_suite(content).unwrap();
        assert_eq!(suite.size(), 2);
        assert_eq!(suite.duration_seconds, 60);
        assert!(suite.fail_fast);
        assert!(!suite.wait_for_test_case);
        assert_eq!(suite.cases[0].workload_class(), Some("success"));
        // Default tolerated kinds survive when the descriptor is silent.
        assert!(suite.tolerates(FailureKind::WorkerFinished));
    }

    #[test]
    fn test_parse_suite_rejects_duplicate_ids() {
        let content = r#"{"tests": [{"id": "map"}, {"id": "map"}]}"#;
        assert!(matches!(
            parse_suite(content),
            Err(CoordinatorError::Config(_))
        ));
    }

    #[test]
    fn test_parse_suite_explicit_tolerable_failures() {
        let content = r#"{
            "tests": [{"id": "map"}],
            "tolerableFailures": ["WORKER_TIMEOUT"]
        }"#;
        let suite = parse_suite(content).unwrap();
        assert!(suite.tolerates(FailureKind::WorkerTimeout));
        assert!(!suite.tolerates(FailureKind::WorkerFinished));
    }

    #[test]
    fn test_load_registry_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agents.txt");
        std::fs::write(&path, "10.0.0.1,192.168.0.1\n").unwrap();

        let registry = load_registry(&path).unwrap();
        assert_eq!(registry.agent_count(), 1);
        assert_eq!(registry.agents()[0].private_address, "192.168.0.1");
    }
}
