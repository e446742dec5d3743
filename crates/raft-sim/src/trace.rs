//! # trace
//!
//! why: a failing fault scenario is worthless if it cannot be read back
//! relations: cluster.rs appends one event per injected, sent, delivered or
//!            lost message; tests print the dump on unexpected state
//! what: the replay trace event type and its one-line rendering

use std::fmt;

use raft_core::{NodeId, RaftMessage};

/// one step of a simulation run
#[derive(Debug, Clone)]
pub enum TraceEvent {
    /// a local event (timeout, client command) fed to a node
    Injected {
        at: u64,
        node: NodeId,
        message: RaftMessage,
    },
    /// a message accepted by the network
    Sent {
        at: u64,
        from: NodeId,
        to: NodeId,
        message: RaftMessage,
    },
    /// a message handed to its destination
    Delivered {
        at: u64,
        to: NodeId,
        message: RaftMessage,
    },
    /// a message lost to a fault or a partition
    Dropped {
        at: u64,
        from: NodeId,
        to: NodeId,
        message: RaftMessage,
    },
    /// a message the network decided to deliver twice
    Duplicated {
        at: u64,
        from: NodeId,
        to: NodeId,
    },
}

/// short tag for a message, enough to follow a trace by eye
pub(crate) fn message_kind(message: &RaftMessage) -> &'static str {
    match message {
        RaftMessage::ElectionTimeout => "ElectionTimeout",
        RaftMessage::HeartbeatTimeout => "HeartbeatTimeout",
        RaftMessage::ClientCommand { .. } => "ClientCommand",
        RaftMessage::AddNode { .. } => "AddNode",
        RaftMessage::RemoveNode { .. } => "RemoveNode",
        RaftMessage::PreVoteRequest { .. } => "PreVoteRequest",
        RaftMessage::PreVoteResponse { .. } => "PreVoteResponse",
        RaftMessage::VoteRequest { .. } => "VoteRequest",
        RaftMessage::VoteResponse { .. } => "VoteResponse",
        RaftMessage::AppendEntries { .. } => "AppendEntries",
        RaftMessage::AppendEntriesResponse { .. } => "AppendEntriesResponse",
        RaftMessage::InstallSnapshot { .. } => "InstallSnapshot",
        RaftMessage::InstallSnapshotResponse { .. } => "InstallSnapshotResponse",
    }
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceEvent::Injected { at, node, message } => {
                write!(f, "[{at:>5}] inject  {} -> node {node}", message_kind(message))
            }
            TraceEvent::Sent {
                at,
                from,
                to,
                message,
            } => write!(f, "[{at:>5}] send    {} {from} -> {to}", message_kind(message)),
            TraceEvent::Delivered { at, to, message } => {
                write!(f, "[{at:>5}] deliver {} -> node {to}", message_kind(message))
            }
            TraceEvent::Dropped {
                at,
                from,
                to,
                message,
            } => write!(f, "[{at:>5}] drop    {} {from} -> {to}", message_kind(message)),
            TraceEvent::Duplicated { at, from, to } => {
                write!(f, "[{at:>5}] dup     {from} -> {to}")
            }
        }
    }
}
