//! # message
//!
//! why: define the closed vocabulary of inbound events and outbound effects
//! relations: RaftMessage is consumed by node.rs::handle, RaftAction is
//!            executed by the driving shell (raft-sim or raft-transport)
//! what: RaftMessage enum (timer events, client proposals, rpc pairs) and
//!       RaftAction enum (send, persist, apply, timer reset)

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::log::LogEntry;
use crate::{LogIndex, NodeId, Term};

/// every event the core can react to
///
/// this set is closed on purpose: `handle` matches it exhaustively, so adding
/// a variant forces every dispatch site to be revisited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    /// the election timer fired without hearing from a leader
    ElectionTimeout,
    /// the heartbeat timer fired (meaningful on leaders only)
    HeartbeatTimeout,
    /// a client asks to replicate an opaque command
    ClientCommand { command: Vec<u8> },
    /// a client asks to add a voting member
    AddNode { node_id: NodeId },
    /// a client asks to remove a voting member
    RemoveNode { node_id: NodeId },
    /// non-binding vote solicitation for a prospective term
    PreVoteRequest {
        term: Term,
        candidate_id: NodeId,
        last_log_index: LogIndex,
        last_log_term: Term,
    },
    /// answer to a pre-vote round; `term` echoes the prospective term
    PreVoteResponse {
        term: Term,
        from: NodeId,
        vote_granted: bool,
    },
    /// request a binding vote during leader election
    VoteRequest {
        term: Term,
        candidate_id: NodeId,
        last_log_index: LogIndex,
        last_log_term: Term,
    },
    /// response to a vote request
    VoteResponse {
        term: Term,
        from: NodeId,
        vote_granted: bool,
    },
    /// replicate log entries (empty entries = heartbeat)
    AppendEntries {
        term: Term,
        leader_id: NodeId,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    },
    /// response to AppendEntries
    ///
    /// on success `match_index` is the highest index now replicated on the
    /// follower; on failure it is the follower's hint for where the leader
    /// should back `next_index` off to.
    AppendEntriesResponse {
        term: Term,
        from: NodeId,
        success: bool,
        match_index: LogIndex,
    },
    /// ship a compacted log prefix to a far-lagging follower
    ///
    /// `members` is the sender's membership view: config entries folded into
    /// the snapshot are never replayed, so the receiver adopts the set whole.
    InstallSnapshot {
        term: Term,
        leader_id: NodeId,
        last_included_index: LogIndex,
        last_included_term: Term,
        members: BTreeSet<NodeId>,
        data: Vec<u8>,
    },
    /// response to InstallSnapshot
    InstallSnapshotResponse {
        term: Term,
        from: NodeId,
        last_included_index: LogIndex,
    },
}

/// every effect the core can ask the driver to perform
///
/// the core executes nothing itself. the enum covers send, persist, apply
/// and timer concerns from day one so new effects are variant additions, not
/// api breaks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftAction {
    /// deliver `message` to `to` over whatever transport the driver owns
    SendMessage { to: NodeId, message: RaftMessage },
    /// durably record term and vote before executing any later send in the
    /// same batch
    PersistHardState { term: Term, voted_for: Option<NodeId> },
    /// the log changed at or after `first_index` (append, truncation, or a
    /// new snapshot prefix ending just before it); re-persist from there
    PersistEntries { first_index: LogIndex },
    /// commit advanced; the driver should drain `entries_to_apply` up to here
    ApplyEntries { up_to: LogIndex },
    /// a valid leader or candidate made contact; restart the election timer
    ResetElectionTimer,
}

impl RaftAction {
    /// the sends in an action batch, in emission order (test helper shape,
    /// but useful to drivers too)
    pub fn sends(actions: &[RaftAction]) -> Vec<(&NodeId, &RaftMessage)> {
        actions
            .iter()
            .filter_map(|a| match a {
                RaftAction::SendMessage { to, message } => Some((to, message)),
                _ => None,
            })
            .collect()
    }
}
