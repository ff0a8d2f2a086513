//! Hierarchical simulator addresses
//!
//! Every component in a benchmark run is identified by a
//! [`SimulatorAddress`]: the Coordinator sits at the root, Agents below
//! it, Workers below their Agent, and Tests below their Worker. Each
//! component index is either a concrete positive integer or the
//! wildcard `*` (encoded internally as `0`), which addresses all
//! siblings at that level.
//!
//! Addresses render as `C`, `C_A1`, `C_A1_W2`, `C_A1_W2_T3` and
//! round-trip through their string form.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ProtocolError;

/// Wildcard component index, addressing all siblings at a level
const ALL: u32 = 0;

/// The hierarchy level an address points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AddressLevel {
    /// The single central coordinator
    Coordinator,
    /// An agent process on a remote host
    Agent,
    /// A worker child process owned by an agent
    Worker,
    /// A test running inside a worker
    Test,
}

/// Hierarchical routing identifier for coordinator, agents, workers, and tests
///
/// Value-typed and immutable; ordering is lexicographic over
/// `(level, agent, worker, test)`, so worker addresses sort by
/// `(agent index, worker index)` as required for first-worker
/// designation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SimulatorAddress {
    level: AddressLevel,
    agent: u32,
    worker: u32,
    test: u32,
}

/// The coordinator's address (`C`)
pub const COORDINATOR: SimulatorAddress = SimulatorAddress {
    level: AddressLevel::Coordinator,
    agent: 0,
    worker: 0,
    test: 0,
};

impl SimulatorAddress {
    /// Address of the coordinator
    pub fn coordinator() -> Self {
        COORDINATOR
    }

    /// Address of a single agent
    pub fn agent(agent_index: u32) -> Self {
        Self {
            level: AddressLevel::Agent,
            agent: agent_index,
            worker: 0,
            test: 0,
        }
    }

    /// Address of a single worker
    pub fn worker(agent_index: u32, worker_index: u32) -> Self {
        Self {
            level: AddressLevel::Worker,
            agent: agent_index,
            worker: worker_index,
            test: 0,
        }
    }

    /// Address of a test on a specific worker
    pub fn test(agent_index: u32, worker_index: u32, test_index: u32) -> Self {
        Self {
            level: AddressLevel::Test,
            agent: agent_index,
            worker: worker_index,
            test: test_index,
        }
    }

    /// Broadcast address matching every component at the given level
    pub fn broadcast(level: AddressLevel) -> Self {
        Self {
            level,
            agent: ALL,
            worker: ALL,
            test: ALL,
        }
    }

    /// The level this address points at
    pub fn level(&self) -> AddressLevel {
        self.level
    }

    /// The agent component, `None` when wildcard or above agent level
    pub fn agent_index(&self) -> Option<u32> {
        (self.level >= AddressLevel::Agent && self.agent != ALL).then_some(self.agent)
    }

    /// The worker component, `None` when wildcard or above worker level
    pub fn worker_index(&self) -> Option<u32> {
        (self.level >= AddressLevel::Worker && self.worker != ALL).then_some(self.worker)
    }

    /// The test component, `None` when wildcard or not a test address
    pub fn test_index(&self) -> Option<u32> {
        (self.level == AddressLevel::Test && self.test != ALL).then_some(self.test)
    }

    /// The containing address one level up, `None` for the coordinator
    pub fn parent(&self) -> Option<Self> {
        match self.level {
            AddressLevel::Coordinator => None,
            AddressLevel::Agent => Some(Self::coordinator()),
            AddressLevel::Worker => Some(Self::agent(self.agent)),
            AddressLevel::Test => Some(Self::worker(self.agent, self.worker)),
        }
    }

    /// A child of this address at the next level down
    ///
    /// Returns `None` for test-level addresses, which have no children.
    pub fn child(&self, index: u32) -> Option<Self> {
        match self.level {
            AddressLevel::Coordinator => Some(Self::agent(index)),
            AddressLevel::Agent => Some(Self::worker(self.agent, index)),
            AddressLevel::Worker => Some(Self::test(self.agent, self.worker, index)),
            AddressLevel::Test => None,
        }
    }

    /// Whether this (possibly wildcard) address matches a concrete one
    ///
    /// A wildcard component matches any index at that level; levels must
    /// be equal.
    pub fn matches(&self, concrete: &SimulatorAddress) -> bool {
        if self.level != concrete.level {
            return false;
        }
        let component = |ours: u32, theirs: u32| ours == ALL || ours == theirs;
        component(self.agent, concrete.agent)
            && component(self.worker, concrete.worker)
            && component(self.test, concrete.test)
    }

    /// Whether any component of this address is a wildcard
    pub fn is_wildcard(&self) -> bool {
        match self.level {
            AddressLevel::Coordinator => false,
            AddressLevel::Agent => self.agent == ALL,
            AddressLevel::Worker => self.agent == ALL || self.worker == ALL,
            AddressLevel::Test => self.agent == ALL || self.worker == ALL || self.test == ALL,
        }
    }
}

impl fmt::Display for SimulatorAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn component(f: &mut fmt::Formatter<'_>, tag: char, index: u32) -> fmt::Result {
            if index == ALL {
                write!(f, "_{tag}*")
            } else {
                write!(f, "_{tag}{index}")
            }
        }

        write!(f, "C")?;
        if self.level >= AddressLevel::Agent {
            component(f, 'A', self.agent)?;
        }
        if self.level >= AddressLevel::Worker {
            component(f, 'W', self.worker)?;
        }
        if self.level == AddressLevel::Test {
            component(f, 'T', self.test)?;
        }
        Ok(())
    }
}

impl FromStr for SimulatorAddress {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProtocolError::InvalidAddress(s.to_string());

        let mut parts = s.split('_');
        if parts.next() != Some("C") {
            return Err(invalid());
        }

        let mut component = |tag: char| -> Result<Option<u32>, ProtocolError> {
            match parts.next() {
                None => Ok(None),
                Some(part) => {
                    let rest = part.strip_prefix(tag).ok_or_else(invalid)?;
                    if rest == "*" {
                        Ok(Some(ALL))
                    } else {
                        let index: u32 = rest.parse().map_err(|_| invalid())?;
                        if index == 0 {
                            return Err(invalid());
                        }
                        Ok(Some(index))
                    }
                }
            }
        };

        let agent = component('A')?;
        let worker = component('W')?;
        let test = component('T')?;
        if parts.next().is_some() {
            return Err(invalid());
        }

        match (agent, worker, test) {
            (None, None, None) => Ok(Self::coordinator()),
            (Some(a), None, None) => Ok(Self::agent(a)),
            (Some(a), Some(w), None) => Ok(Self::worker(a, w)),
            (Some(a), Some(w), Some(t)) => Ok(Self::test(a, w, t)),
            _ => Err(invalid()),
        }
    }
}

impl Serialize for SimulatorAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SimulatorAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}
