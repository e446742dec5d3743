//! # invariants
//!
//! why: the point of simulating faults is catching safety violations, not
//!      watching the happy path succeed again
//! relations: cluster.rs runs check() after every single transition, so a
//!            violation panics at the exact step that introduced it
//! what: election safety, log matching, commit durability and per-node state
//!       sanity, accumulated across the whole run

use std::collections::BTreeMap;

use raft_core::{LogEntry, LogIndex, NodeId, RaftNode, RaftRole, Term};

/// cross-run safety checks
///
/// keeps history (leaders per term, committed entry terms) so violations that
/// only show up across time, like a committed entry being rewritten, are
/// caught even after the offending node has moved on.
#[derive(Debug, Default)]
pub struct InvariantChecker {
    leaders_by_term: BTreeMap<Term, NodeId>,
    committed_terms: BTreeMap<LogIndex, Term>,
}

impl InvariantChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// the node recorded as leader of `term`, if one ever emerged
    pub fn leader_of_term(&self, term: Term) -> Option<NodeId> {
        self.leaders_by_term.get(&term).copied()
    }

    /// validate every safety property against the current cluster state
    ///
    /// panics with the violated property, which fails the enclosing test and
    /// leaves the replay trace in the output.
    pub fn check(&mut self, nodes: &BTreeMap<NodeId, RaftNode>, applied: &BTreeMap<NodeId, Vec<LogEntry>>) {
        self.check_election_safety(nodes);
        self.check_state_sanity(nodes);
        self.check_log_matching(nodes);
        self.check_commit_durability(nodes);
        self.check_applied_prefix(applied);
    }

    /// at most one leader per term, ever
    fn check_election_safety(&mut self, nodes: &BTreeMap<NodeId, RaftNode>) {
        for node in nodes.values() {
            if node.role != RaftRole::Leader {
                continue;
            }
            let recorded = self.leaders_by_term.entry(node.current_term).or_insert(node.id);
            assert_eq!(
                *recorded, node.id,
                "election safety violated: nodes {recorded} and {} both led term {}",
                node.id, node.current_term
            );
        }
    }

    /// applied <= committed <= last log index, on every node
    fn check_state_sanity(&self, nodes: &BTreeMap<NodeId, RaftNode>) {
        for node in nodes.values() {
            assert!(
                node.last_applied <= node.commit_index,
                "node {} applied index {} past commit index {}",
                node.id,
                node.last_applied,
                node.commit_index
            );
            assert!(
                node.commit_index <= node.last_log_index(),
                "node {} commit index {} past last log index {}",
                node.id,
                node.commit_index,
                node.last_log_index()
            );
        }
    }

    /// same (index, term) on two nodes means the same entry
    fn check_log_matching(&self, nodes: &BTreeMap<NodeId, RaftNode>) {
        let nodes: Vec<&RaftNode> = nodes.values().collect();
        for (i, a) in nodes.iter().enumerate() {
            for b in &nodes[i + 1..] {
                let from = a.log.first_index().max(b.log.first_index());
                let to = a.last_log_index().min(b.last_log_index());
                for index in from..=to {
                    let (ea, eb) = match (a.entry_at(index), b.entry_at(index)) {
                        (Some(ea), Some(eb)) => (ea, eb),
                        _ => continue,
                    };
                    if ea.term == eb.term {
                        assert_eq!(
                            ea.payload, eb.payload,
                            "log matching violated at index {index} term {} between nodes {} and {}",
                            ea.term, a.id, b.id
                        );
                    }
                }
            }
        }
    }

    /// a committed entry keeps its term forever, on every node that has it
    fn check_commit_durability(&mut self, nodes: &BTreeMap<NodeId, RaftNode>) {
        for node in nodes.values() {
            for index in node.log.first_index()..=node.commit_index {
                let Some(entry) = node.entry_at(index) else {
                    continue;
                };
                let recorded = self.committed_terms.entry(index).or_insert(entry.term);
                assert_eq!(
                    *recorded, entry.term,
                    "commit durability violated: index {index} committed at term {recorded} \
                     but node {} holds term {}",
                    node.id, entry.term
                );
            }
        }
    }

    /// entries reach each state machine in strictly increasing index order,
    /// and only entries that really committed
    fn check_applied_prefix(&self, applied: &BTreeMap<NodeId, Vec<LogEntry>>) {
        for (node, entries) in applied {
            let mut previous = 0;
            for entry in entries {
                assert!(
                    entry.index > previous,
                    "node {node} applied index {} after {previous}",
                    entry.index
                );
                previous = entry.index;
                if let Some(term) = self.committed_terms.get(&entry.index) {
                    assert_eq!(
                        *term, entry.term,
                        "node {node} applied an uncommitted entry at index {}",
                        entry.index
                    );
                }
            }
        }
    }
}
