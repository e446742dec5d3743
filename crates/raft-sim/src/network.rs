//! # network
//!
//! why: model the only part of the world raft has to survive, the network
//! relations: owned by cluster.rs::SimCluster; carries raft-core messages
//! what: a priority queue of in-flight messages with seeded drop, duplicate
//!       and delay faults, plus node isolation for partition scenarios
//!
//! faults are decided when a message is sent, from a seeded rng, so the same
//! seed replays the same run exactly. ties in delivery time break on send
//! order, which keeps a zero-delay network FIFO.

use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use raft_core::{NodeId, RaftMessage};

/// fault probabilities and delay bounds for a simulated network
#[derive(Debug, Clone, Copy)]
pub struct FaultPlan {
    /// probability a sent message is silently lost
    pub drop_rate: f64,
    /// probability a sent message is delivered twice
    pub duplicate_rate: f64,
    /// maximum delivery delay in ticks (0 keeps the network FIFO)
    pub max_delay: u64,
}

impl Default for FaultPlan {
    fn default() -> Self {
        Self {
            drop_rate: 0.0,
            duplicate_rate: 0.0,
            max_delay: 0,
        }
    }
}

/// a message somewhere between sender and receiver
#[derive(Debug, Clone)]
pub struct InFlight {
    pub deliver_at: u64,
    seq: u64,
    pub from: NodeId,
    pub to: NodeId,
    pub message: RaftMessage,
}

// ordering ignores the payload: earliest deliver_at first, send order breaks
// ties. wrapped in Reverse inside the heap to get a min-queue.
impl PartialEq for InFlight {
    fn eq(&self, other: &Self) -> bool {
        self.deliver_at == other.deliver_at && self.seq == other.seq
    }
}

impl Eq for InFlight {}

impl PartialOrd for InFlight {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InFlight {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deliver_at, self.seq).cmp(&(other.deliver_at, other.seq))
    }
}

/// what the network did with a sent message, for the trace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    Duplicated,
    Dropped,
}

/// the simulated network: in-flight messages plus the fault machinery
pub struct SimNetwork {
    rng: StdRng,
    plan: FaultPlan,
    queue: BinaryHeap<std::cmp::Reverse<InFlight>>,
    seq: u64,
    isolated: BTreeSet<NodeId>,
}

impl SimNetwork {
    pub fn new(seed: u64, plan: FaultPlan) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            plan,
            queue: BinaryHeap::new(),
            seq: 0,
            isolated: BTreeSet::new(),
        }
    }

    /// queue a message, applying the fault plan; returns what happened
    pub fn send(&mut self, now: u64, from: NodeId, to: NodeId, message: RaftMessage) -> SendOutcome {
        if self.isolated.contains(&from) || self.isolated.contains(&to) {
            return SendOutcome::Dropped;
        }
        if self.plan.drop_rate > 0.0 && self.rng.gen_bool(self.plan.drop_rate) {
            return SendOutcome::Dropped;
        }
        let duplicated =
            self.plan.duplicate_rate > 0.0 && self.rng.gen_bool(self.plan.duplicate_rate);
        self.enqueue(now, from, to, message.clone());
        if duplicated {
            self.enqueue(now, from, to, message);
            SendOutcome::Duplicated
        } else {
            SendOutcome::Queued
        }
    }

    fn enqueue(&mut self, now: u64, from: NodeId, to: NodeId, message: RaftMessage) {
        let delay = if self.plan.max_delay == 0 {
            0
        } else {
            self.rng.gen_range(0..=self.plan.max_delay)
        };
        self.queue.push(std::cmp::Reverse(InFlight {
            deliver_at: now + 1 + delay,
            seq: self.seq,
            from,
            to,
            message,
        }));
        self.seq += 1;
    }

    /// the next message due for delivery, earliest first
    ///
    /// messages already in flight toward or from an isolated node are lost
    /// here, so isolating a node cuts its traffic in both directions at once.
    pub fn next(&mut self) -> Option<(InFlight, bool)> {
        let std::cmp::Reverse(flight) = self.queue.pop()?;
        let lost =
            self.isolated.contains(&flight.from) || self.isolated.contains(&flight.to);
        Some((flight, lost))
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn isolate(&mut self, node: NodeId) {
        self.isolated.insert(node);
    }

    pub fn heal(&mut self, node: NodeId) {
        self.isolated.remove(&node);
    }
}
