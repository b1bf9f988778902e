//! Shared contracts for nkudo.
//!
//! This crate defines everything the control plane and the edge agent must
//! agree on: wire types for enrollment, heartbeats, and plan dispatch; the
//! state machines for microVMs, executions, and plans; the error taxonomy;
//! salted fingerprints for bearer secrets; and the audit hash chain.
//!
//! Nothing in here touches the network, the filesystem, or a database — the
//! crate is pure data plus the deterministic routines over it, so both
//! processes (and every test suite) share one definition of the protocol.

pub mod audit;
pub mod error;
pub mod fingerprint;
pub mod plan;
pub mod state;
pub mod wire;

pub use error::ErrorCode;
pub use plan::{ActionSpec, ApplyPlanRequest, PlanAction};
pub use state::{
    AgentState, ConnectivityState, ExecutionState, OperationKind, PlanStatus, VmState,
};
