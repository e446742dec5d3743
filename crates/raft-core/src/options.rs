//! # options
//!
//! why: collect the per-node tunables in one serializable struct
//! relations: consumed by node.rs (pre-vote, batching) and by the driving
//!            shell (timeout/heartbeat intervals)
//! what: RaftOptions with sensible defaults

use serde::{Deserialize, Serialize};

/// per-node configuration, fixed at construction
///
/// the timing fields are plain data for the host shell: the core never reads
/// a clock, it only reacts to `ElectionTimeout` / `HeartbeatTimeout` messages
/// the shell injects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftOptions {
    /// run a non-binding pre-vote round before incrementing the term
    pub enable_pre_vote: bool,
    /// cap on entries carried by a single AppendEntries batch
    pub max_entries_per_append: usize,
    /// lower bound of the randomized election timeout, in ms
    pub election_timeout_min: u64,
    /// upper bound of the randomized election timeout, in ms
    pub election_timeout_max: u64,
    /// leader heartbeat interval, in ms
    pub heartbeat_interval: u64,
}

impl Default for RaftOptions {
    fn default() -> Self {
        Self {
            enable_pre_vote: false,
            max_entries_per_append: 64,
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
        }
    }
}
