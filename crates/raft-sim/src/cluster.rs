//! # cluster
//!
//! why: tie nodes, network, invariants and trace into one steppable world
//! relations: tests drive this and nothing else; network.rs carries the
//!            messages, invariants.rs vets every transition, trace.rs records
//! what: SimCluster with local-event injection, single-message delivery, a
//!       run-until-quiet loop and partition controls
//!
//! time is the delivery clock of the network, not wall time. timeouts never
//! fire on their own; a scenario injects ElectionTimeout or HeartbeatTimeout
//! exactly where it wants them, which is what makes runs reproducible.

use std::collections::BTreeMap;

use tracing::debug;

use raft_core::{LogEntry, NodeId, RaftAction, RaftMessage, RaftNode, Term};

use crate::invariants::InvariantChecker;
use crate::network::{FaultPlan, SendOutcome, SimNetwork};
use crate::trace::TraceEvent;

/// knobs for a simulation run
#[derive(Debug, Clone, Copy)]
pub struct SimConfig {
    pub seed: u64,
    pub drop_rate: f64,
    pub duplicate_rate: f64,
    pub max_delay: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            drop_rate: 0.0,
            duplicate_rate: 0.0,
            max_delay: 0,
        }
    }
}

impl SimConfig {
    pub fn seeded(seed: u64) -> Self {
        Self {
            seed,
            ..Self::default()
        }
    }
}

/// a whole cluster in one struct, stepped one message at a time
pub struct SimCluster {
    nodes: BTreeMap<NodeId, RaftNode>,
    network: SimNetwork,
    checker: InvariantChecker,
    trace: Vec<TraceEvent>,
    /// everything each host state machine has been handed, in order
    applied: BTreeMap<NodeId, Vec<LogEntry>>,
    now: u64,
}

impl SimCluster {
    /// a fresh cluster of `size` nodes, ids 1..=size, all followers at term 0
    pub fn new(size: u64, config: SimConfig) -> Self {
        let members: Vec<NodeId> = (1..=size).collect();
        let nodes = members
            .iter()
            .map(|&id| (id, RaftNode::new(id, members.clone())))
            .collect();
        let plan = FaultPlan {
            drop_rate: config.drop_rate,
            duplicate_rate: config.duplicate_rate,
            max_delay: config.max_delay,
        };
        Self {
            nodes,
            network: SimNetwork::new(config.seed, plan),
            checker: InvariantChecker::new(),
            trace: Vec::new(),
            applied: members.iter().map(|&id| (id, Vec::new())).collect(),
            now: 0,
        }
    }

    // -- local events --

    pub fn trigger_election(&mut self, node: NodeId) {
        self.inject(node, RaftMessage::ElectionTimeout);
    }

    pub fn trigger_heartbeat(&mut self, node: NodeId) {
        self.inject(node, RaftMessage::HeartbeatTimeout);
    }

    pub fn submit_command(&mut self, node: NodeId, command: &[u8]) {
        self.inject(
            node,
            RaftMessage::ClientCommand {
                command: command.to_vec(),
            },
        );
    }

    pub fn add_node(&mut self, via: NodeId, node_id: NodeId) {
        // the new node starts as an empty follower that the leader catches up
        let members: Vec<NodeId> = self.nodes.keys().copied().chain([node_id]).collect();
        self.nodes
            .entry(node_id)
            .or_insert_with(|| RaftNode::new(node_id, members));
        self.applied.entry(node_id).or_default();
        self.inject(via, RaftMessage::AddNode { node_id });
    }

    pub fn remove_node(&mut self, via: NodeId, node_id: NodeId) {
        self.inject(via, RaftMessage::RemoveNode { node_id });
    }

    /// feed a local event straight to a node, bypassing the network
    pub fn inject(&mut self, node: NodeId, message: RaftMessage) {
        self.trace.push(TraceEvent::Injected {
            at: self.now,
            node,
            message: message.clone(),
        });
        self.step(node, message);
    }

    // -- stepping --

    /// deliver the next in-flight message; false when the network is quiet
    pub fn deliver_next(&mut self) -> bool {
        let Some((flight, lost)) = self.network.next() else {
            return false;
        };
        self.now = self.now.max(flight.deliver_at);
        if lost {
            self.trace.push(TraceEvent::Dropped {
                at: self.now,
                from: flight.from,
                to: flight.to,
                message: flight.message,
            });
            return true;
        }
        self.trace.push(TraceEvent::Delivered {
            at: self.now,
            to: flight.to,
            message: flight.message.clone(),
        });
        self.step(flight.to, flight.message);
        true
    }

    /// deliver up to `steps` messages; returns how many actually moved
    pub fn run(&mut self, steps: usize) -> usize {
        let mut delivered = 0;
        while delivered < steps && self.deliver_next() {
            delivered += 1;
        }
        delivered
    }

    /// deliver until the network drains; panics past `limit` deliveries,
    /// which in practice means a message loop
    pub fn run_until_quiet(&mut self, limit: usize) -> usize {
        let mut steps = 0;
        while self.deliver_next() {
            steps += 1;
            assert!(steps <= limit, "network never went quiet:\n{}", self.dump_trace());
        }
        steps
    }

    fn step(&mut self, node_id: NodeId, message: RaftMessage) {
        let Some(node) = self.nodes.get_mut(&node_id) else {
            // traffic addressed to a node removed mid-run
            return;
        };
        let actions = node.handle(message);
        for action in actions {
            match action {
                RaftAction::SendMessage { to, message } => {
                    let outcome = self.network.send(self.now, node_id, to, message.clone());
                    let event = match outcome {
                        SendOutcome::Queued => TraceEvent::Sent {
                            at: self.now,
                            from: node_id,
                            to,
                            message,
                        },
                        SendOutcome::Duplicated => TraceEvent::Duplicated {
                            at: self.now,
                            from: node_id,
                            to,
                        },
                        SendOutcome::Dropped => TraceEvent::Dropped {
                            at: self.now,
                            from: node_id,
                            to,
                            message,
                        },
                    };
                    self.trace.push(event);
                }
                RaftAction::ApplyEntries { .. } => {
                    let node = self.nodes.get_mut(&node_id).expect("node exists");
                    let entries = node.entries_to_apply();
                    self.applied.entry(node_id).or_default().extend(entries);
                }
                // the simulator has no disk or timers; persistence and timer
                // resets are the shell's concern and are validated in
                // raft-transport
                RaftAction::PersistHardState { .. }
                | RaftAction::PersistEntries { .. }
                | RaftAction::ResetElectionTimer => {}
            }
        }
        self.checker.check(&self.nodes, &self.applied);
        debug!(node = node_id, now = self.now, "step checked");
    }

    /// host-triggered log compaction on one node
    pub fn compact(&mut self, node: NodeId, up_to: u64, data: &[u8]) -> bool {
        let ok = self
            .nodes
            .get_mut(&node)
            .map(|n| n.compact(up_to, data.to_vec()))
            .unwrap_or(false);
        self.checker.check(&self.nodes, &self.applied);
        ok
    }

    // -- partitions --

    pub fn isolate(&mut self, node: NodeId) {
        self.network.isolate(node);
    }

    pub fn heal(&mut self, node: NodeId) {
        self.network.heal(node);
    }

    // -- observation --

    pub fn node(&self, id: NodeId) -> &RaftNode {
        &self.nodes[&id]
    }

    /// the current leader, preferring the highest term when stale leaders
    /// linger behind a partition
    pub fn leader(&self) -> Option<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.role == raft_core::RaftRole::Leader)
            .max_by_key(|n| n.current_term)
            .map(|n| n.id)
    }

    /// the node that led `term`, as witnessed by the invariant checker
    pub fn leader_at_term(&self, term: Term) -> Option<NodeId> {
        self.checker.leader_of_term(term)
    }

    /// command payloads a node's state machine has seen, in apply order
    pub fn applied_commands(&self, node: NodeId) -> Vec<Vec<u8>> {
        self.applied[&node]
            .iter()
            .filter_map(|e| e.command_bytes().map(<[u8]>::to_vec))
            .collect()
    }

    pub fn trace(&self) -> &[TraceEvent] {
        &self.trace
    }

    pub fn dump_trace(&self) -> String {
        self.trace
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }
}
