//! # raft-core
//!
//! why: implement the core raft consensus algorithm in pure, portable rust
//! relations: driven by raft-sim for validation and raft-transport in production,
//!            persisted via raft-storage
//! what: node state machine, election logic, log replication, snapshot
//!       installation, membership-change guard, message/action types
//!
//! the core is a deterministic transition function: the driver feeds one
//! [`RaftMessage`] at a time into [`RaftNode::handle`], which mutates the node
//! in place and returns the [`RaftAction`]s the driver must execute. the core
//! itself performs no i/o, holds no clock, and never blocks.

pub mod election;
pub mod log;
pub mod membership;
pub mod message;
pub mod node;
pub mod options;
pub mod replication;

/// unique identifier of a cluster member
pub type NodeId = u64;
/// election epoch, monotonically increasing; at most one leader per term
pub type Term = u64;
/// 1-based position in the replicated log
pub type LogIndex = u64;

pub use log::{EntryPayload, LogEntry, RaftLog};
pub use message::{RaftAction, RaftMessage};
pub use node::{RaftNode, RaftRole};
pub use options::RaftOptions;
