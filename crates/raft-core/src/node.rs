//! # node
//!
//! why: define the raft node state record and the single transition function
//! relations: election.rs, replication.rs and membership.rs hang their
//!            handlers off RaftNode; drivers call handle() and nothing else
//! what: RaftRole enum, RaftNode struct, handle() dispatch, role transitions,
//!       commit/apply bookkeeping

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::log::{LogEntry, RaftLog};
use crate::message::{RaftAction, RaftMessage};
use crate::options::RaftOptions;
use crate::{LogIndex, NodeId, Term};

/// the three possible roles a raft node can hold
///
/// exactly one at a time. a node running a pre-vote round stays Follower;
/// pre-voting is tally state, not a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RaftRole {
    /// passive: listens for heartbeats, votes when asked
    #[default]
    Follower,
    /// transitional: soliciting votes to become leader
    Candidate,
    /// active: accepts commands, replicates the log, sends heartbeats
    Leader,
}

/// a single raft node: all mutable per-node state plus the transition function
///
/// the driver owns the node exclusively and delivers exactly one message at a
/// time; the struct carries no locks and no interior mutability. fields are
/// public in the same spirit as the rest of this workspace: tests and
/// invariant checkers read them directly, only `handle` (and the methods it
/// dispatches to) writes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftNode {
    /// unique identifier for this node
    pub id: NodeId,
    /// current cluster membership, including self
    pub members: BTreeSet<NodeId>,
    /// latest term this node has seen; never decreases
    pub current_term: Term,
    /// current role
    pub role: RaftRole,
    /// candidate that received our vote in current_term, if any
    pub voted_for: Option<NodeId>,
    /// the replicated log (snapshot-aware)
    pub log: RaftLog,
    /// highest index known to be durable on a majority
    pub commit_index: LogIndex,
    /// highest index handed to the host state machine
    pub last_applied: LogIndex,
    /// last known leader, used by shells to redirect clients
    pub leader_id: Option<NodeId>,
    /// leader-volatile: next index to send each peer
    pub next_index: HashMap<NodeId, LogIndex>,
    /// leader-volatile: highest index known replicated on each peer
    pub match_index: HashMap<NodeId, LogIndex>,
    /// candidate-volatile: who granted us a binding vote this term
    pub votes_received: BTreeSet<NodeId>,
    /// follower-volatile: who granted our current pre-vote round
    pub pre_votes_received: BTreeSet<NodeId>,
    /// index of the in-flight membership change, if any
    pub pending_config_index: Option<LogIndex>,
    /// node the in-flight membership change adds or removes
    pub pending_config_node: Option<NodeId>,
    /// fixed per-node tunables
    pub options: RaftOptions,
}

impl RaftNode {
    /// create a new node in Follower state with default options
    pub fn new(id: NodeId, members: Vec<NodeId>) -> Self {
        Self::with_options(id, members, RaftOptions::default())
    }

    /// create a new node with explicit options
    pub fn with_options(id: NodeId, members: Vec<NodeId>, options: RaftOptions) -> Self {
        Self {
            id,
            members: members.into_iter().collect(),
            current_term: 0,
            role: RaftRole::Follower,
            voted_for: None,
            log: RaftLog::new(),
            commit_index: 0,
            last_applied: 0,
            leader_id: None,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            votes_received: BTreeSet::new(),
            pre_votes_received: BTreeSet::new(),
            pending_config_index: None,
            pending_config_node: None,
            options,
        }
    }

    /// the single entry point: mutate state for `message`, return the effects
    ///
    /// total over every state x message pair, deterministic, performs no i/o.
    /// the driver must execute the returned actions in order (persistence
    /// before the sends that depend on it).
    pub fn handle(&mut self, message: RaftMessage) -> Vec<RaftAction> {
        match message {
            RaftMessage::ElectionTimeout => self.on_election_timeout(),
            RaftMessage::HeartbeatTimeout => self.on_heartbeat_timeout(),
            RaftMessage::ClientCommand { command } => self.on_client_command(command),
            RaftMessage::AddNode { node_id } => self.propose_add_node(node_id),
            RaftMessage::RemoveNode { node_id } => self.propose_remove_node(node_id),
            RaftMessage::PreVoteRequest {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
            } => self.handle_pre_vote_request(term, candidate_id, last_log_index, last_log_term),
            RaftMessage::PreVoteResponse {
                term,
                from,
                vote_granted,
            } => self.handle_pre_vote_response(term, vote_granted, from),
            RaftMessage::VoteRequest {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
            } => self.handle_vote_request(term, candidate_id, last_log_index, last_log_term),
            RaftMessage::VoteResponse {
                term,
                from,
                vote_granted,
            } => self.handle_vote_response(term, vote_granted, from),
            RaftMessage::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => self.handle_append_entries(
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            ),
            RaftMessage::AppendEntriesResponse {
                term,
                from,
                success,
                match_index,
            } => self.handle_append_entries_response(term, success, from, match_index),
            RaftMessage::InstallSnapshot {
                term,
                leader_id,
                last_included_index,
                last_included_term,
                members,
                data,
            } => self.handle_install_snapshot(
                term,
                leader_id,
                last_included_index,
                last_included_term,
                members,
                data,
            ),
            RaftMessage::InstallSnapshotResponse {
                term,
                from,
                last_included_index,
            } => self.handle_install_snapshot_response(term, from, last_included_index),
        }
    }

    // -- quorum helpers --

    /// smallest majority of the current membership
    pub fn quorum_size(&self) -> usize {
        self.members.len() / 2 + 1
    }

    /// true when the binding votes gathered this term form a majority
    pub fn has_quorum(&self) -> bool {
        self.votes_received.len() >= self.quorum_size()
    }

    /// every member except this node
    pub fn peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        let me = self.id;
        self.members.iter().copied().filter(move |&p| p != me)
    }

    // -- log tail caches --

    /// index of the last log entry (0 when empty)
    pub fn last_log_index(&self) -> LogIndex {
        self.log.last_index()
    }

    /// term of the last log entry (0 when empty)
    pub fn last_log_term(&self) -> Term {
        self.log.last_term()
    }

    /// the entry at `index`, if still retained
    pub fn entry_at(&self, index: LogIndex) -> Option<&LogEntry> {
        self.log.entry_at(index)
    }

    /// the term at `index`, 0 when unknown
    pub fn term_at(&self, index: LogIndex) -> Term {
        self.log.term_at(index).unwrap_or(0)
    }

    // -- role transitions --

    /// step down to Follower, adopting `term` if it is newer
    ///
    /// a newer term clears voted_for (votes are scoped to a term); stepping
    /// down within the same term keeps it.
    pub fn become_follower(&mut self, term: Term) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
        }
        if self.role != RaftRole::Follower {
            debug!(
                node = self.id,
                term = self.current_term,
                "stepping down to follower"
            );
        }
        self.role = RaftRole::Follower;
        self.votes_received.clear();
        self.pre_votes_received.clear();
        self.next_index.clear();
        self.match_index.clear();
    }

    /// take leadership for the current term
    ///
    /// initializes per-peer replication state and returns the empty
    /// AppendEntries broadcast that asserts leadership immediately.
    pub(crate) fn become_leader(&mut self) -> Vec<RaftAction> {
        info!(node = self.id, term = self.current_term, "elected leader");
        self.role = RaftRole::Leader;
        self.leader_id = Some(self.id);
        self.votes_received.clear();
        self.pre_votes_received.clear();
        let next = self.last_log_index() + 1;
        self.next_index = self.peers().map(|p| (p, next)).collect();
        self.match_index = self.peers().map(|p| (p, 0)).collect();
        self.broadcast_append_entries()
    }

    // -- commit / apply bookkeeping --

    /// raise commit_index to `index`, reacting to any config entries that
    /// just committed; returns the apply action when commit advanced
    pub(crate) fn advance_commit_to(&mut self, index: LogIndex) -> Vec<RaftAction> {
        if index <= self.commit_index {
            return Vec::new();
        }
        let previous = self.commit_index;
        self.commit_index = index;
        debug!(node = self.id, from = previous, to = index, "commit advanced");
        self.apply_committed_config_changes(previous, index);
        vec![RaftAction::ApplyEntries { up_to: index }]
    }

    /// committed-but-unapplied entries, advancing last_applied
    ///
    /// idempotent between commits: a second call returns nothing until
    /// commit_index moves again. entries folded into a snapshot are skipped
    /// (the host restored them from the snapshot itself).
    pub fn entries_to_apply(&mut self) -> Vec<LogEntry> {
        let from = (self.last_applied + 1).max(self.log.first_index());
        if self.commit_index < from {
            self.last_applied = self.last_applied.max(self.commit_index);
            return Vec::new();
        }
        let entries = self.log.range(from, self.commit_index);
        self.last_applied = self.commit_index;
        entries
    }

    /// fold the log up to `up_to` into a snapshot (host-triggered)
    ///
    /// only committed entries may be compacted; returns false otherwise.
    pub fn compact(&mut self, up_to: LogIndex, data: Vec<u8>) -> bool {
        if up_to > self.commit_index {
            return false;
        }
        self.log.compact(up_to, data)
    }
}
