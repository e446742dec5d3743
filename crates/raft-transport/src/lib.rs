//! # raft-transport
//!
//! why: the core is a pure transition function; something has to move its
//!      messages over real sockets, run its timers and persist its actions
//! relations: wraps raft-core nodes in tokio worker tasks, persists through
//!            raft-storage, frames messages as json-rpc lines over tcp
//! what: wire framing, retrying RpcClient, Discovery, ClusterRuntime with
//!       one listener and one worker per hosted node

mod client;
mod discovery;
mod runtime;
mod wire;

use thiserror::Error;

use raft_core::NodeId;
use raft_storage::StorageError;

pub use client::RpcClient;
pub use discovery::{Discovery, StaticDiscovery};
pub use runtime::{ClusterRuntime, NodeConfig, NodeHandle, NodeStatus};
pub use wire::{RpcRequest, RpcResponse};

/// everything that can go wrong between two nodes
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport io: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("no address known for node {0}")]
    UnknownPeer(NodeId),
    #[error("peer closed the connection")]
    ConnectionClosed,
    #[error("response id {got} does not match request id {want}")]
    IdMismatch { want: u64, got: u64 },
    #[error("node worker is gone")]
    WorkerClosed,
}
