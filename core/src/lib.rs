//! Core types, protocol model, and component registry for gridbench
//!
//! This crate provides the foundational types shared by the Coordinator,
//! Agent, and Worker binaries:
//!
//! - Hierarchical simulator addresses and the component registry
//! - Protocol data structures (operations, responses, wire framing)
//! - The test model (suites, cases, phases)
//! - Failure classification

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod address;
pub mod error;
pub mod failure;
pub mod operation;
pub mod phase;
pub mod registry;
pub mod response;
pub mod suite;
pub mod wire;

/// Commonly used core types
pub mod prelude {
    pub use crate::address::{AddressLevel, SimulatorAddress};
    pub use crate::error::{ProtocolError, ProtocolResult};
    pub use crate::failure::{FailureKind, FailureOperation};
    pub use crate::operation::Operation;
    pub use crate::phase::TestPhase;
    pub use crate::response::{Response, ResponseType};
    pub use crate::suite::{TestCase, TestSuite};
}
