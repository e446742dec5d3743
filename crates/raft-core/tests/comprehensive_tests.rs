//! # comprehensive raft tests
//!
//! why: verify the transition function end to end, driven only through handle()
//! relations: exercises raft-core exactly the way raft-sim and raft-transport
//!            drive it: messages in, actions out, nothing else
//! what: election, replication, commit, snapshot, membership and edge-case
//!       scenarios over a hand-routed in-memory cluster

use std::collections::BTreeMap;

use raft_core::{
    EntryPayload, LogEntry, NodeId, RaftAction, RaftMessage, RaftNode, RaftOptions, RaftRole,
};

/// a tiny hand-routed cluster: delivers every SendMessage action until the
/// network is quiet, with an optional per-node isolation flag
struct MiniCluster {
    nodes: BTreeMap<NodeId, RaftNode>,
    isolated: Vec<NodeId>,
}

impl MiniCluster {
    fn new(n: u64) -> Self {
        let ids: Vec<NodeId> = (1..=n).collect();
        let nodes = ids
            .iter()
            .map(|&id| (id, RaftNode::new(id, ids.clone())))
            .collect();
        Self {
            nodes,
            isolated: Vec::new(),
        }
    }

    fn node(&self, id: NodeId) -> &RaftNode {
        &self.nodes[&id]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut RaftNode {
        self.nodes.get_mut(&id).unwrap()
    }

    fn isolate(&mut self, id: NodeId) {
        self.isolated.push(id);
    }

    fn heal(&mut self) {
        self.isolated.clear();
    }

    /// feed `message` to `id` and route resulting sends until quiescent
    fn deliver(&mut self, id: NodeId, message: RaftMessage) {
        let mut inbox = vec![(id, message)];
        while let Some((to, message)) = inbox.pop() {
            let from_isolated = self.isolated.contains(&to);
            let actions = self.node_mut(to).handle(message);
            for action in actions {
                if let RaftAction::SendMessage { to: target, message } = action {
                    if from_isolated || self.isolated.contains(&target) {
                        continue; // dropped by the partition
                    }
                    if self.nodes.contains_key(&target) {
                        inbox.push((target, message));
                    }
                }
            }
        }
    }

    fn elect(&mut self, id: NodeId) {
        self.deliver(id, RaftMessage::ElectionTimeout);
    }

    fn heartbeat(&mut self, id: NodeId) {
        self.deliver(id, RaftMessage::HeartbeatTimeout);
    }

    fn submit(&mut self, id: NodeId, command: &[u8]) {
        self.deliver(
            id,
            RaftMessage::ClientCommand {
                command: command.to_vec(),
            },
        );
    }

    fn leaders(&self) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.role == RaftRole::Leader)
            .map(|n| n.id)
            .collect()
    }
}

// =============================================================================
// SECTION 1: INITIALIZATION
// =============================================================================

mod initialization {
    use super::*;

    #[test]
    fn new_node_starts_as_follower() {
        let node = RaftNode::new(1, vec![1, 2, 3]);
        assert_eq!(node.role, RaftRole::Follower);
        assert_eq!(node.current_term, 0);
        assert_eq!(node.voted_for, None);
        assert!(node.log.is_empty());
        assert_eq!(node.commit_index, 0);
        assert_eq!(node.last_applied, 0);
    }

    #[test]
    fn node_knows_cluster_membership() {
        let node = RaftNode::new(1, vec![1, 2, 3]);
        assert_eq!(node.members.len(), 3);
        assert!(node.members.contains(&1));
        assert_eq!(node.id, 1);
    }

    #[test]
    fn custom_options_are_applied() {
        let options = RaftOptions {
            enable_pre_vote: true,
            max_entries_per_append: 8,
            election_timeout_min: 200,
            election_timeout_max: 400,
            heartbeat_interval: 100,
        };
        let node = RaftNode::with_options(1, vec![1, 2, 3], options);
        assert!(node.options.enable_pre_vote);
        assert_eq!(node.options.max_entries_per_append, 8);
        assert_eq!(node.options.election_timeout_min, 200);
    }

    #[test]
    fn default_option_values() {
        let options = RaftOptions::default();
        assert!(!options.enable_pre_vote);
        assert_eq!(options.election_timeout_min, 150);
        assert_eq!(options.election_timeout_max, 300);
        assert_eq!(options.heartbeat_interval, 50);
    }
}

// =============================================================================
// SECTION 2: QUORUM CALCULATION
// =============================================================================

mod quorum {
    use super::*;

    #[test]
    fn quorum_sizes() {
        assert_eq!(RaftNode::new(1, vec![1]).quorum_size(), 1);
        assert_eq!(RaftNode::new(1, vec![1, 2, 3]).quorum_size(), 2);
        assert_eq!(RaftNode::new(1, vec![1, 2, 3, 4, 5]).quorum_size(), 3);
        assert_eq!(RaftNode::new(1, (1..=7).collect()).quorum_size(), 4);
    }

    #[test]
    fn has_quorum_tracks_votes_received() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        node.votes_received.insert(1);
        assert!(!node.has_quorum());
        node.votes_received.insert(2);
        assert!(node.has_quorum());
    }
}

// =============================================================================
// SECTION 3: ELECTION VIA MESSAGE ROUTING
// =============================================================================

mod election {
    use super::*;

    #[test]
    fn timeout_elects_exactly_one_leader() {
        let mut cluster = MiniCluster::new(3);
        cluster.elect(1);

        assert_eq!(cluster.leaders(), vec![1]);
        assert_eq!(cluster.node(1).current_term, 1);
        // followers learned the leader from its immediate empty append
        assert_eq!(cluster.node(2).leader_id, Some(1));
        assert_eq!(cluster.node(3).leader_id, Some(1));
    }

    #[test]
    fn competing_candidate_with_stale_log_loses() {
        let mut cluster = MiniCluster::new(3);
        cluster.elect(1);
        cluster.submit(1, b"cmd");

        // node 3 somehow never got the entry
        let mut lagging = RaftNode::new(3, vec![1, 2, 3]);
        lagging.current_term = cluster.node(3).current_term;
        *cluster.node_mut(3) = lagging;

        cluster.elect(3);
        // 3's log is behind, so 1 and 2 refuse it; no second leader appears
        assert_ne!(cluster.node(3).role, RaftRole::Leader);
    }

    #[test]
    fn higher_term_candidate_deposes_leader() {
        let mut cluster = MiniCluster::new(3);
        cluster.elect(1);
        cluster.elect(2); // term 2 campaign reaches node 1 too

        assert_eq!(cluster.leaders(), vec![2]);
        assert_eq!(cluster.node(1).role, RaftRole::Follower);
        assert_eq!(cluster.node(1).current_term, 2);
    }

    #[test]
    fn pre_vote_cluster_still_elects_a_leader() {
        let ids = vec![1, 2, 3];
        let mut cluster = MiniCluster::new(3);
        for &id in &ids {
            let options = RaftOptions {
                enable_pre_vote: true,
                ..RaftOptions::default()
            };
            *cluster.node_mut(id) = RaftNode::with_options(id, ids.clone(), options);
        }
        cluster.elect(1);
        assert_eq!(cluster.leaders(), vec![1]);
        assert_eq!(cluster.node(1).current_term, 1);
    }

    #[test]
    fn isolated_pre_voter_does_not_disturb_the_term() {
        let ids = vec![1, 2, 3];
        let mut cluster = MiniCluster::new(3);
        for &id in &ids {
            let options = RaftOptions {
                enable_pre_vote: true,
                ..RaftOptions::default()
            };
            *cluster.node_mut(id) = RaftNode::with_options(id, ids.clone(), options);
        }
        cluster.elect(1);
        let stable_term = cluster.node(2).current_term;

        cluster.isolate(3);
        for _ in 0..5 {
            cluster.elect(3); // pre-vote rounds that never reach a majority
        }
        cluster.heal();

        // the failed rounds never bumped node 3's own term
        assert_eq!(cluster.node(3).current_term, stable_term);
        cluster.heartbeat(1);
        assert_eq!(cluster.leaders(), vec![1]);
    }
}

// =============================================================================
// SECTION 4: LOG REPLICATION AND COMMIT
// =============================================================================

mod replication {
    use super::*;

    #[test]
    fn command_commits_after_one_round() {
        let mut cluster = MiniCluster::new(3);
        cluster.elect(1);
        cluster.submit(1, b"SET key value");

        // responses arrive synchronously in the mini cluster, so the leader
        // commits right away and the next heartbeat spreads commit_index
        assert_eq!(cluster.node(1).commit_index, 1);
        cluster.heartbeat(1);
        assert_eq!(cluster.node(2).commit_index, 1);
        assert_eq!(cluster.node(3).commit_index, 1);
    }

    #[test]
    fn committed_entries_reach_every_state_machine() {
        let mut cluster = MiniCluster::new(3);
        cluster.elect(1);
        cluster.submit(1, b"a");
        cluster.submit(1, b"b");
        cluster.heartbeat(1);

        for id in 1..=3 {
            let applied = cluster.node_mut(id).entries_to_apply();
            assert_eq!(applied.len(), 2, "node {id} should apply both entries");
            assert_eq!(applied[0].command_bytes(), Some(&b"a"[..]));
            assert_eq!(cluster.node(id).last_applied, 2);
        }
    }

    #[test]
    fn entries_to_apply_is_idempotent_between_commits() {
        let mut cluster = MiniCluster::new(3);
        cluster.elect(1);
        cluster.submit(1, b"cmd");

        let first = cluster.node_mut(1).entries_to_apply();
        let second = cluster.node_mut(1).entries_to_apply();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[test]
    fn follower_catches_up_after_missing_entries() {
        let mut cluster = MiniCluster::new(3);
        cluster.elect(1);

        cluster.isolate(3);
        cluster.submit(1, b"a");
        cluster.submit(1, b"b");
        cluster.heal();

        assert_eq!(cluster.node(3).last_log_index(), 0);
        // heartbeats probe backwards and then refill the follower
        cluster.heartbeat(1);
        cluster.heartbeat(1);
        assert_eq!(cluster.node(3).last_log_index(), 2);
        assert_eq!(cluster.node(3).commit_index, 2);
    }

    #[test]
    fn divergent_uncommitted_suffix_is_overwritten() {
        let mut cluster = MiniCluster::new(3);
        cluster.elect(1); // term 1

        // a term-1 leader got "stale" onto node 3 only, then died
        cluster
            .node_mut(3)
            .log
            .append(LogEntry::command(1, 1, b"stale".to_vec()));

        cluster.elect(2); // term 2 takes over
        cluster.submit(2, b"real");
        cluster.heartbeat(2);

        let n2 = cluster.node(2);
        let n3 = cluster.node(3);
        assert_eq!(
            (n3.last_log_index(), n3.last_log_term()),
            (n2.last_log_index(), n2.last_log_term())
        );
        assert_eq!(n3.entry_at(1).unwrap().command_bytes(), Some(&b"real"[..]));
    }
}

// =============================================================================
// SECTION 5: PARTITIONS
// =============================================================================

mod partitions {
    use super::*;

    #[test]
    fn isolated_leader_cannot_commit() {
        let mut cluster = MiniCluster::new(3);
        cluster.elect(1);

        cluster.isolate(1);
        cluster.submit(1, b"doomed");

        assert_eq!(cluster.node(1).commit_index, 0);
        assert_eq!(cluster.node(2).commit_index, 0);
        assert_eq!(cluster.node(3).commit_index, 0);
    }

    #[test]
    fn majority_side_elects_and_old_leader_rejoins_cleanly() {
        let mut cluster = MiniCluster::new(3);
        cluster.elect(1);

        cluster.isolate(1);
        cluster.elect(2); // term 2 on the majority side
        assert_eq!(cluster.node(2).role, RaftRole::Leader);
        assert_eq!(cluster.node(2).current_term, 2);

        cluster.heal();
        cluster.heartbeat(2);

        // one leader total, and never two at the same term
        assert_eq!(cluster.leaders(), vec![2]);
        assert_eq!(cluster.node(1).role, RaftRole::Follower);
        assert_eq!(cluster.node(1).current_term, 2);
    }

    #[test]
    fn minority_partition_discards_uncommitted_entry_on_heal() {
        let mut cluster = MiniCluster::new(3);
        cluster.elect(1);

        cluster.isolate(1);
        cluster.submit(1, b"lost"); // replicated nowhere
        cluster.elect(2);
        cluster.submit(2, b"kept");

        cluster.heal();
        cluster.heartbeat(2);
        cluster.heartbeat(2);

        let n1 = cluster.node(1);
        assert_eq!(n1.last_log_index(), 1);
        assert_eq!(n1.entry_at(1).unwrap().command_bytes(), Some(&b"kept"[..]));
    }
}

// =============================================================================
// SECTION 6: SNAPSHOT CATCH-UP
// =============================================================================

mod snapshot {
    use super::*;

    #[test]
    fn lagging_follower_catches_up_via_snapshot() {
        let mut cluster = MiniCluster::new(3);
        cluster.elect(1);

        cluster.isolate(3);
        for i in 0..10u8 {
            cluster.submit(1, &[i]);
        }
        assert_eq!(cluster.node(1).commit_index, 10);
        assert!(cluster.node_mut(1).compact(10, b"state-at-10".to_vec()));

        cluster.heal();
        cluster.heartbeat(1); // probes back, follower still empty
        cluster.heartbeat(1); // next_index now at/behind the boundary

        let n3 = cluster.node(3);
        assert!(n3.commit_index >= 10);
        assert_eq!(n3.log.snapshot_index(), 10);
        assert_eq!(n3.log.snapshot_data(), b"state-at-10");
    }

    #[test]
    fn entries_after_snapshot_still_replicate() {
        let mut cluster = MiniCluster::new(3);
        cluster.elect(1);

        cluster.isolate(3);
        for i in 0..5u8 {
            cluster.submit(1, &[i]);
        }
        cluster.node_mut(1).compact(5, b"snap".to_vec());
        cluster.heal();
        cluster.heartbeat(1);
        cluster.heartbeat(1);

        cluster.submit(1, b"after");
        cluster.heartbeat(1);
        assert_eq!(cluster.node(3).last_log_index(), 6);
        assert_eq!(cluster.node(3).commit_index, 6);
    }
}

// =============================================================================
// SECTION 7: MEMBERSHIP CHANGES
// =============================================================================

mod membership {
    use super::*;

    #[test]
    fn add_node_converges_across_the_cluster() {
        let mut cluster = MiniCluster::new(3);
        cluster.elect(1);
        cluster.deliver(1, RaftMessage::AddNode { node_id: 4 });
        cluster.heartbeat(1);

        for id in 1..=3 {
            assert!(
                cluster.node(id).members.contains(&4),
                "node {id} should see the new member"
            );
            assert_eq!(cluster.node(id).quorum_size(), 3);
        }
        assert_eq!(cluster.node(1).pending_config_index, None);
    }

    #[test]
    fn config_entry_payload_survives_replication() {
        let mut cluster = MiniCluster::new(3);
        cluster.elect(1);
        cluster.deliver(1, RaftMessage::RemoveNode { node_id: 3 });
        cluster.heartbeat(1);

        assert_eq!(
            cluster.node(2).entry_at(1).unwrap().payload,
            EntryPayload::RemoveNode(3)
        );
        assert!(!cluster.node(2).members.contains(&3));
    }

    #[test]
    fn only_one_change_in_flight() {
        let mut cluster = MiniCluster::new(3);
        cluster.elect(1);

        // keep the first change uncommitted by isolating the followers
        cluster.isolate(2);
        cluster.isolate(3);
        cluster.deliver(1, RaftMessage::AddNode { node_id: 4 });
        cluster.deliver(1, RaftMessage::AddNode { node_id: 5 });

        assert_eq!(cluster.node(1).last_log_index(), 1);
        assert_eq!(cluster.node(1).pending_config_node, Some(4));
    }
}

// =============================================================================
// SECTION 8: EDGE CASES AND INVARIANTS
// =============================================================================

mod edge_cases {
    use super::*;

    #[test]
    fn applied_never_exceeds_commit() {
        let mut cluster = MiniCluster::new(3);
        cluster.elect(1);
        for i in 0..4u8 {
            cluster.submit(1, &[i]);
            cluster.heartbeat(1);
            for id in 1..=3 {
                let node = cluster.node_mut(id);
                node.entries_to_apply();
                assert!(node.last_applied <= node.commit_index);
                assert!(node.commit_index <= node.last_log_index());
            }
        }
    }

    #[test]
    fn log_matching_across_nodes() {
        let mut cluster = MiniCluster::new(3);
        cluster.elect(1);
        for i in 0..6u8 {
            cluster.submit(1, &[i]);
        }
        cluster.heartbeat(1);

        for index in 1..=6u64 {
            let reference = cluster.node(1).entry_at(index).unwrap().clone();
            for id in 2..=3 {
                assert_eq!(cluster.node(id).entry_at(index), Some(&reference));
            }
        }
    }

    #[test]
    fn voted_for_resets_on_term_change() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        node.handle_vote_request(1, 2, 0, 0);
        assert_eq!(node.voted_for, Some(2));
        node.handle_vote_request(2, 3, 0, 0);
        assert_eq!(node.voted_for, Some(3));
    }

    #[test]
    fn unknown_leader_commit_never_rolls_backwards() {
        let mut node = RaftNode::new(2, vec![1, 2, 3]);
        node.handle_append_entries(1, 1, 0, 0, vec![LogEntry::command(1, 1, vec![1])], 1);
        assert_eq!(node.commit_index, 1);
        // a duplicate of an older append must not lower commit
        node.handle_append_entries(1, 1, 0, 0, vec![], 0);
        assert_eq!(node.commit_index, 1);
    }

    #[test]
    fn single_node_cluster_runs_solo() {
        let mut cluster = MiniCluster::new(1);
        cluster.elect(1);
        cluster.submit(1, b"only");
        let node = cluster.node_mut(1);
        assert_eq!(node.role, RaftRole::Leader);
        assert_eq!(node.commit_index, 1);
        assert_eq!(node.entries_to_apply().len(), 1);
    }
}
