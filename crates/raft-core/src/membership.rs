//! # membership
//!
//! why: serialize cluster membership changes, one in flight at a time
//! relations: impl block on node.rs::RaftNode; changes ride the log via
//!            replication.rs and take effect when node.rs advances commit
//! what: add/remove proposal gate, pending-change markers, commit-time
//!       application of config entries
//!
//! two concurrently pending reconfigurations could form two disjoint
//! majorities. the guard trades reconfiguration throughput for safety: a new
//! change is accepted only once the previous one has committed.

use tracing::info;

use crate::log::{EntryPayload, LogEntry};
use crate::message::RaftAction;
use crate::node::{RaftNode, RaftRole};
use crate::{LogIndex, NodeId};

impl RaftNode {
    /// propose adding a voting member (leader only, one change at a time)
    pub(crate) fn propose_add_node(&mut self, node_id: NodeId) -> Vec<RaftAction> {
        if self.members.contains(&node_id) {
            return Vec::new();
        }
        self.propose_config_change(EntryPayload::AddNode(node_id), node_id)
    }

    /// propose removing a voting member (leader only, one change at a time)
    pub(crate) fn propose_remove_node(&mut self, node_id: NodeId) -> Vec<RaftAction> {
        if !self.members.contains(&node_id) {
            return Vec::new();
        }
        self.propose_config_change(EntryPayload::RemoveNode(node_id), node_id)
    }

    fn propose_config_change(
        &mut self,
        payload: EntryPayload,
        node_id: NodeId,
    ) -> Vec<RaftAction> {
        if self.role != RaftRole::Leader {
            return Vec::new();
        }
        if self.pending_config_index.is_some() {
            // the previous change has not committed yet
            return Vec::new();
        }
        let index = self.last_log_index() + 1;
        self.log
            .append(LogEntry::new(self.current_term, index, payload));
        self.pending_config_index = Some(index);
        self.pending_config_node = Some(node_id);
        info!(node = self.id, index, changed = node_id, "membership change proposed");

        let mut actions = vec![RaftAction::PersistEntries { first_index: index }];
        actions.extend(self.try_advance_leader_commit());
        actions.extend(self.broadcast_append_entries());
        actions
    }

    /// apply every config entry whose index just became committed
    ///
    /// runs on leaders and followers alike, so the whole cluster converges on
    /// the same membership at the same log positions. a leader that commits
    /// its own removal steps down.
    pub(crate) fn apply_committed_config_changes(
        &mut self,
        after: LogIndex,
        up_to: LogIndex,
    ) {
        let changes: Vec<(LogIndex, EntryPayload)> = self
            .log
            .range(after + 1, up_to)
            .into_iter()
            .filter_map(|e| match e.payload {
                EntryPayload::AddNode(_) | EntryPayload::RemoveNode(_) => {
                    Some((e.index, e.payload))
                }
                _ => None,
            })
            .collect();

        for (index, payload) in changes {
            match payload {
                EntryPayload::AddNode(added) => {
                    if self.members.insert(added) {
                        info!(node = self.id, added, "member added");
                        if self.role == RaftRole::Leader && added != self.id {
                            self.next_index.insert(added, self.last_log_index() + 1);
                            self.match_index.insert(added, 0);
                        }
                    }
                }
                EntryPayload::RemoveNode(removed) => {
                    if self.members.remove(&removed) {
                        info!(node = self.id, removed, "member removed");
                        self.next_index.remove(&removed);
                        self.match_index.remove(&removed);
                        if removed == self.id && self.role == RaftRole::Leader {
                            // a removed leader stops leading once the removal
                            // is durable
                            self.become_follower(self.current_term);
                        }
                    }
                }
                EntryPayload::Command(_) | EntryPayload::Noop => {}
            }
            if self.pending_config_index == Some(index) {
                self.pending_config_index = None;
                self.pending_config_node = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::message::RaftMessage;

    fn leader_of_three() -> RaftNode {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        node.start_election();
        node.handle_vote_response(1, true, 2);
        node
    }

    #[test]
    fn add_node_rides_the_log() {
        let mut node = leader_of_three();
        let actions = node.handle(RaftMessage::AddNode { node_id: 4 });

        assert_eq!(node.pending_config_index, Some(1));
        assert_eq!(node.pending_config_node, Some(4));
        assert_eq!(
            node.entry_at(1).unwrap().payload,
            EntryPayload::AddNode(4)
        );
        assert!(!RaftAction::sends(&actions).is_empty());
        // not a member until the entry commits
        assert!(!node.members.contains(&4));
    }

    #[test]
    fn second_change_rejected_while_one_is_pending() {
        let mut node = leader_of_three();
        node.handle(RaftMessage::AddNode { node_id: 4 });
        let actions = node.handle(RaftMessage::AddNode { node_id: 5 });

        assert!(actions.is_empty());
        assert_eq!(node.last_log_index(), 1);
        assert_eq!(node.pending_config_node, Some(4));
    }

    #[test]
    fn commit_applies_the_change_and_clears_the_gate() {
        let mut node = leader_of_three();
        node.handle(RaftMessage::AddNode { node_id: 4 });
        node.handle_append_entries_response(1, true, 2, 1);

        assert_eq!(node.commit_index, 1);
        assert!(node.members.contains(&4));
        assert_eq!(node.pending_config_index, None);
        assert_eq!(node.quorum_size(), 3); // 4 members now
        // the new peer is tracked for replication
        assert_eq!(node.next_index.get(&4), Some(&2));

        // and a follow-up change is accepted again
        let actions = node.handle(RaftMessage::RemoveNode { node_id: 3 });
        assert!(!actions.is_empty());
    }

    #[test]
    fn followers_apply_config_entries_at_commit() {
        let mut node = RaftNode::new(2, vec![1, 2, 3]);
        let entries = vec![LogEntry::new(1, 1, EntryPayload::AddNode(4))];
        node.handle_append_entries(1, 1, 0, 0, entries, 1);

        assert_eq!(node.commit_index, 1);
        assert!(node.members.contains(&4));
    }

    #[test]
    fn non_leader_cannot_propose_changes() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        let actions = node.handle(RaftMessage::AddNode { node_id: 4 });
        assert!(actions.is_empty());
        assert_eq!(node.last_log_index(), 0);
    }

    #[test]
    fn adding_an_existing_member_is_a_noop() {
        let mut node = leader_of_three();
        let actions = node.handle(RaftMessage::AddNode { node_id: 2 });
        assert!(actions.is_empty());
        assert_eq!(node.pending_config_index, None);
    }

    #[test]
    fn snapshot_carries_membership_to_a_lagging_follower() {
        // a config entry folded into a snapshot never replays at commit time,
        // so the snapshot itself must deliver the membership set
        let mut leader = leader_of_three();
        leader.handle(RaftMessage::AddNode { node_id: 4 });
        leader.handle_append_entries_response(1, true, 2, 1);
        assert!(leader.members.contains(&4));
        assert!(leader.compact(1, b"state".to_vec()));

        // node 3 replicated nothing; next_index=1 is behind the boundary
        let actions = leader.handle(RaftMessage::HeartbeatTimeout);
        let snapshot = RaftAction::sends(&actions)
            .into_iter()
            .find(|(to, _)| **to == 3)
            .unwrap()
            .1
            .clone();
        assert!(matches!(snapshot, RaftMessage::InstallSnapshot { .. }));

        let mut follower = RaftNode::new(3, vec![1, 2, 3]);
        follower.handle(snapshot);
        assert_eq!(follower.members, BTreeSet::from([1, 2, 3, 4]));
        assert_eq!(follower.quorum_size(), 3);
    }

    #[test]
    fn install_snapshot_clears_a_covered_pending_change() {
        let mut old_leader = leader_of_three();
        old_leader.handle(RaftMessage::AddNode { node_id: 4 });
        assert_eq!(old_leader.pending_config_index, Some(1));

        // deposed before the change committed; a newer leader's snapshot
        // covering that index settles it either way
        old_leader.handle_install_snapshot(
            2,
            2,
            3,
            2,
            BTreeSet::from([1, 2, 3]),
            b"state".to_vec(),
        );
        assert_eq!(old_leader.pending_config_index, None);
        assert_eq!(old_leader.pending_config_node, None);
        assert_eq!(old_leader.members, BTreeSet::from([1, 2, 3]));
    }

    #[test]
    fn leader_steps_down_after_committing_own_removal() {
        let mut node = leader_of_three();
        node.handle(RaftMessage::RemoveNode { node_id: 1 });
        node.handle_append_entries_response(1, true, 2, 1);

        assert!(!node.members.contains(&1));
        assert_eq!(node.role, RaftRole::Follower);
    }
}
