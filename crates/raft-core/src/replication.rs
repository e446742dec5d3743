//! # replication
//!
//! why: implement log replication, covering command acceptance, the AppendEntries
//!      exchange, commit-index advancement, and snapshot-based catch-up
//! relations: impl block on node.rs::RaftNode, reached only through handle();
//!            leaders get here after election.rs promotes them
//! what: client command path, heartbeat/append broadcast with per-peer
//!       batching, follower-side consistency check and conflict truncation,
//!       quorum commit rule, InstallSnapshot rpc pair

use std::collections::BTreeSet;

use tracing::debug;

use crate::log::LogEntry;
use crate::message::{RaftAction, RaftMessage};
use crate::node::{RaftNode, RaftRole};
use crate::{LogIndex, NodeId, Term};

impl RaftNode {
    /// a client command arrived: leaders append and replicate, everyone else
    /// drops it (the shell redirects clients using leader_id)
    pub(crate) fn on_client_command(&mut self, command: Vec<u8>) -> Vec<RaftAction> {
        if self.role != RaftRole::Leader {
            return Vec::new();
        }
        let entry = self.append_entry(command);
        let mut actions = vec![RaftAction::PersistEntries {
            first_index: entry.index,
        }];
        // a single-node cluster commits on its own match
        actions.extend(self.try_advance_leader_commit());
        actions.extend(self.broadcast_append_entries());
        actions
    }

    /// append a command to the local log with the current term and next index
    pub fn append_entry(&mut self, command: Vec<u8>) -> LogEntry {
        let entry = LogEntry::command(self.current_term, self.last_log_index() + 1, command);
        self.log.append(entry.clone());
        entry
    }

    /// the heartbeat timer fired: leaders renew leadership, others ignore it
    pub(crate) fn on_heartbeat_timeout(&mut self) -> Vec<RaftAction> {
        if self.role != RaftRole::Leader {
            return Vec::new();
        }
        self.broadcast_append_entries()
    }

    /// one AppendEntries (or InstallSnapshot, for peers behind the snapshot
    /// boundary) per peer, batched at max_entries_per_append
    pub(crate) fn broadcast_append_entries(&mut self) -> Vec<RaftAction> {
        self.peers()
            .map(|peer| RaftAction::SendMessage {
                to: peer,
                message: self.replication_message_for(peer),
            })
            .collect()
    }

    /// what `peer` needs next, given next_index and the snapshot boundary
    fn replication_message_for(&self, peer: NodeId) -> RaftMessage {
        let next = self
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or(self.last_log_index() + 1);
        if next <= self.log.snapshot_index() {
            // the entries before next are compacted away; ship the snapshot
            return RaftMessage::InstallSnapshot {
                term: self.current_term,
                leader_id: self.id,
                last_included_index: self.log.snapshot_index(),
                last_included_term: self.log.snapshot_term(),
                members: self.members.clone(),
                data: self.log.snapshot_data().to_vec(),
            };
        }
        let prev_log_index = next - 1;
        let prev_log_term = self.log.term_at(prev_log_index).unwrap_or(0);
        RaftMessage::AppendEntries {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries: self.log.entries_from(next, self.options.max_entries_per_append),
            leader_commit: self.commit_index,
        }
    }

    /// follower/candidate side of the AppendEntries exchange
    pub fn handle_append_entries(
        &mut self,
        term: Term,
        leader_id: NodeId,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    ) -> Vec<RaftAction> {
        if term < self.current_term {
            // stale leader: tell it our term, no timer reset
            return vec![RaftAction::SendMessage {
                to: leader_id,
                message: RaftMessage::AppendEntriesResponse {
                    term: self.current_term,
                    from: self.id,
                    success: false,
                    match_index: self.last_log_index(),
                },
            }];
        }

        let mut actions = Vec::new();
        if term > self.current_term {
            self.become_follower(term);
            actions.push(RaftAction::PersistHardState {
                term: self.current_term,
                voted_for: self.voted_for,
            });
        } else if self.role != RaftRole::Follower {
            // a candidate (or a leader that somehow coexists at this term)
            // yields to the sender
            self.become_follower(term);
        }
        self.leader_id = Some(leader_id);
        actions.push(RaftAction::ResetElectionTimer);

        // probes at or below the snapshot boundary always match: everything
        // there is committed and folded into the snapshot
        if prev_log_index > self.log.snapshot_index()
            && !self.log.matches(prev_log_index, prev_log_term)
        {
            // hint where to back off to: just before the probe point, capped
            // by what we actually hold
            let hint = self.last_log_index().min(prev_log_index.saturating_sub(1));
            actions.push(RaftAction::SendMessage {
                to: leader_id,
                message: RaftMessage::AppendEntriesResponse {
                    term: self.current_term,
                    from: self.id,
                    success: false,
                    match_index: hint,
                },
            });
            return actions;
        }

        // the boundary floor keeps the success match_index honest when the
        // leader probed below our snapshot
        let last_new = entries
            .last()
            .map(|e| e.index)
            .unwrap_or(prev_log_index)
            .max(self.log.snapshot_index());
        let mut first_changed: Option<LogIndex> = None;
        for entry in entries {
            if entry.index <= self.log.snapshot_index() {
                continue; // already folded into our snapshot
            }
            match self.log.term_at(entry.index) {
                Some(t) if t == entry.term => continue, // duplicate delivery
                Some(_) => {
                    // conflict: an uncommitted divergent suffix gets replaced
                    debug!(node = self.id, index = entry.index, "truncating conflicting suffix");
                    self.log.truncate_from(entry.index);
                    first_changed.get_or_insert(entry.index);
                    self.log.append(entry);
                }
                None => {
                    first_changed.get_or_insert(entry.index);
                    self.log.append(entry);
                }
            }
        }
        if let Some(first_index) = first_changed {
            actions.push(RaftAction::PersistEntries { first_index });
        }

        actions.extend(self.advance_commit_to(leader_commit.min(last_new)));
        actions.push(RaftAction::SendMessage {
            to: leader_id,
            message: RaftMessage::AppendEntriesResponse {
                term: self.current_term,
                from: self.id,
                success: true,
                match_index: last_new,
            },
        });
        actions
    }

    /// leader side of the AppendEntries exchange
    pub fn handle_append_entries_response(
        &mut self,
        term: Term,
        success: bool,
        from: NodeId,
        match_index: LogIndex,
    ) -> Vec<RaftAction> {
        if term > self.current_term {
            self.become_follower(term);
            return vec![RaftAction::PersistHardState {
                term: self.current_term,
                voted_for: self.voted_for,
            }];
        }
        if self.role != RaftRole::Leader || term < self.current_term {
            return Vec::new();
        }

        if success {
            let known = self.match_index.entry(from).or_insert(0);
            if match_index > *known {
                *known = match_index;
            }
            self.next_index.insert(from, match_index + 1);
            self.try_advance_leader_commit()
        } else {
            // back off and retry on the next heartbeat; the follower's hint
            // bounds the plain decrement
            let fallback = self.last_log_index() + 1;
            let next = self.next_index.entry(from).or_insert(fallback);
            *next = next.saturating_sub(1).min(match_index + 1).max(1);
            Vec::new()
        }
    }

    /// recompute the leader commit index: the highest N replicated on a
    /// majority whose entry carries the current term (a previous term's entry
    /// never commits by count alone)
    pub(crate) fn try_advance_leader_commit(&mut self) -> Vec<RaftAction> {
        let mut best = self.commit_index;
        for n in (self.commit_index + 1)..=self.last_log_index() {
            if self.log.term_at(n) != Some(self.current_term) {
                continue;
            }
            let own = usize::from(self.members.contains(&self.id));
            let replicas = own
                + self
                    .peers()
                    .filter(|p| self.match_index.get(p).copied().unwrap_or(0) >= n)
                    .count();
            if replicas >= self.quorum_size() {
                best = n;
            }
        }
        self.advance_commit_to(best)
    }

    /// follower side of snapshot installation
    ///
    /// discards everything the snapshot covers and adopts it as the new log
    /// prefix; commit_index and last_applied never stay below the boundary.
    /// the sender's membership set is adopted too, because config entries
    /// folded into the snapshot will never pass through commit-time apply.
    pub fn handle_install_snapshot(
        &mut self,
        term: Term,
        leader_id: NodeId,
        last_included_index: LogIndex,
        last_included_term: Term,
        members: BTreeSet<NodeId>,
        data: Vec<u8>,
    ) -> Vec<RaftAction> {
        if term < self.current_term {
            return vec![RaftAction::SendMessage {
                to: leader_id,
                message: RaftMessage::InstallSnapshotResponse {
                    term: self.current_term,
                    from: self.id,
                    last_included_index: 0,
                },
            }];
        }

        let mut actions = Vec::new();
        if term > self.current_term {
            self.become_follower(term);
            actions.push(RaftAction::PersistHardState {
                term: self.current_term,
                voted_for: self.voted_for,
            });
        } else if self.role != RaftRole::Follower {
            self.become_follower(term);
        }
        self.leader_id = Some(leader_id);
        actions.push(RaftAction::ResetElectionTimer);

        debug!(
            node = self.id,
            last_included_index, "installing snapshot"
        );
        self.log
            .install_snapshot(last_included_index, last_included_term, data);
        self.members = members;
        if self.commit_index < last_included_index {
            self.commit_index = last_included_index;
        }
        if self.last_applied < last_included_index {
            self.last_applied = last_included_index;
        }
        // any change the snapshot covers has committed in some form
        if matches!(self.pending_config_index, Some(i) if i <= last_included_index) {
            self.pending_config_index = None;
            self.pending_config_node = None;
        }
        actions.push(RaftAction::PersistEntries {
            first_index: last_included_index + 1,
        });
        actions.push(RaftAction::SendMessage {
            to: leader_id,
            message: RaftMessage::InstallSnapshotResponse {
                term: self.current_term,
                from: self.id,
                last_included_index,
            },
        });
        actions
    }

    /// leader side of snapshot installation: the follower now holds the
    /// prefix, so replication resumes right after it
    pub fn handle_install_snapshot_response(
        &mut self,
        term: Term,
        from: NodeId,
        last_included_index: LogIndex,
    ) -> Vec<RaftAction> {
        if term > self.current_term {
            self.become_follower(term);
            return vec![RaftAction::PersistHardState {
                term: self.current_term,
                voted_for: self.voted_for,
            }];
        }
        if self.role != RaftRole::Leader || term < self.current_term {
            return Vec::new();
        }
        let known = self.match_index.entry(from).or_insert(0);
        if last_included_index > *known {
            *known = last_included_index;
        }
        let resume = *known + 1;
        self.next_index.insert(from, resume);
        Vec::new()
    }
}
