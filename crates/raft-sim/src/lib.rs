//! # raft-sim
//!
//! why: exercise the consensus core under faults without threads or clocks
//! relations: drives raft-core::RaftNode instances through a simulated
//!            network; raft-core's integration tests cover the happy paths,
//!            this crate covers the hostile ones
//! what: discrete-event cluster simulator with a lossy/reordering/duplicating
//!       network, a continuously-checked invariant suite and a replay trace
//!
//! everything is deterministic given a seed. a failing scenario reproduces
//! from its seed alone, and the trace names every message that moved.

mod cluster;
mod invariants;
mod network;
mod trace;

pub use cluster::{SimCluster, SimConfig};
pub use invariants::InvariantChecker;
pub use network::{FaultPlan, InFlight, SendOutcome, SimNetwork};
pub use trace::TraceEvent;
