//! # log
//!
//! why: manage the append-only log of commands that raft replicates
//! relations: used by node.rs for replication and commit tracking, persisted
//!            via raft-storage, compacted by snapshots
//! what: LogEntry/EntryPayload types, snapshot-aware RaftLog with consistency
//!       checking, truncation and compaction

use serde::{Deserialize, Serialize};

use crate::{LogIndex, Term};

/// what a log entry carries
///
/// client commands stay opaque bytes; membership changes need structure the
/// node can interpret when the entry commits, so they get their own variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// opaque client command, applied by the host state machine
    Command(Vec<u8>),
    /// add a voting member to the cluster
    AddNode(u64),
    /// remove a voting member from the cluster
    RemoveNode(u64),
    /// leader no-op, carries no state machine effect
    Noop,
}

/// a single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// the term when this entry was created
    pub term: Term,
    /// the index of this entry in the log (1-indexed, gap-free)
    pub index: LogIndex,
    /// the payload replicated to every node
    pub payload: EntryPayload,
}

impl LogEntry {
    /// create a new log entry
    pub fn new(term: Term, index: LogIndex, payload: EntryPayload) -> Self {
        Self {
            term,
            index,
            payload,
        }
    }

    /// shorthand for a client-command entry
    pub fn command(term: Term, index: LogIndex, command: Vec<u8>) -> Self {
        Self::new(term, index, EntryPayload::Command(command))
    }

    /// the command bytes, if this is a client-command entry
    pub fn command_bytes(&self) -> Option<&[u8]> {
        match &self.payload {
            EntryPayload::Command(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// the replicated log, compacted at a snapshot boundary
///
/// entries at or before `snapshot_index` have been folded into
/// `snapshot_data`; `entries` holds everything after it. index arithmetic
/// stays 1-based and global, so callers never see the compaction offset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RaftLog {
    snapshot_index: LogIndex,
    snapshot_term: Term,
    snapshot_data: Vec<u8>,
    entries: Vec<LogEntry>,
}

impl RaftLog {
    /// create an empty log with no snapshot
    pub fn new() -> Self {
        Self::default()
    }

    /// index of the last entry folded into the snapshot (0 if none)
    pub fn snapshot_index(&self) -> LogIndex {
        self.snapshot_index
    }

    /// term of the last entry folded into the snapshot (0 if none)
    pub fn snapshot_term(&self) -> Term {
        self.snapshot_term
    }

    /// the compacted prefix, opaque to the log
    pub fn snapshot_data(&self) -> &[u8] {
        &self.snapshot_data
    }

    /// index of the first entry still retained (snapshot_index + 1)
    pub fn first_index(&self) -> LogIndex {
        self.snapshot_index + 1
    }

    /// index of the last entry, counting the snapshot boundary
    pub fn last_index(&self) -> LogIndex {
        self.entries
            .last()
            .map(|e| e.index)
            .unwrap_or(self.snapshot_index)
    }

    /// term of the last entry, counting the snapshot boundary
    pub fn last_term(&self) -> Term {
        self.entries
            .last()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_term)
    }

    /// number of retained (non-compacted) entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// true when no entries are retained
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// the term recorded at `index`, if known
    ///
    /// index 0 is the empty-log sentinel (term 0); the snapshot boundary is
    /// answerable from metadata; anything older is compacted away (None).
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        if index < self.snapshot_index {
            return None;
        }
        self.entry_at(index).map(|e| e.term)
    }

    /// the retained entry at `index`, if any
    pub fn entry_at(&self, index: LogIndex) -> Option<&LogEntry> {
        if index < self.first_index() || index > self.last_index() {
            return None;
        }
        let offset = (index - self.first_index()) as usize;
        self.entries.get(offset)
    }

    /// clone up to `max` entries starting at `from` (inclusive)
    pub fn entries_from(&self, from: LogIndex, max: usize) -> Vec<LogEntry> {
        if from > self.last_index() || max == 0 {
            return Vec::new();
        }
        let start = from.max(self.first_index());
        let offset = (start - self.first_index()) as usize;
        self.entries[offset..]
            .iter()
            .take(max)
            .cloned()
            .collect()
    }

    /// clone entries in the inclusive range `[from, to]`
    pub fn range(&self, from: LogIndex, to: LogIndex) -> Vec<LogEntry> {
        if to < from {
            return Vec::new();
        }
        self.entries_from(from, (to - from + 1) as usize)
            .into_iter()
            .filter(|e| e.index <= to)
            .collect()
    }

    /// true when the log contains `prev_term` at `prev_index` (the
    /// AppendEntries consistency check)
    pub fn matches(&self, prev_index: LogIndex, prev_term: Term) -> bool {
        self.term_at(prev_index) == Some(prev_term)
    }

    /// append one entry at the tail
    pub fn append(&mut self, entry: LogEntry) {
        debug_assert_eq!(entry.index, self.last_index() + 1, "log must be gap-free");
        self.entries.push(entry);
    }

    /// drop every retained entry at or after `from`
    pub fn truncate_from(&mut self, from: LogIndex) {
        self.entries.retain(|e| e.index < from);
    }

    /// fold everything up to `up_to` (inclusive) into a snapshot
    ///
    /// returns false when `up_to` is not a retained index, in which case the
    /// log is unchanged.
    pub fn compact(&mut self, up_to: LogIndex, data: Vec<u8>) -> bool {
        let Some(term) = self.term_at(up_to) else {
            return false;
        };
        if up_to <= self.snapshot_index || up_to > self.last_index() {
            return false;
        }
        self.entries.retain(|e| e.index > up_to);
        self.snapshot_index = up_to;
        self.snapshot_term = term;
        self.snapshot_data = data;
        true
    }

    /// adopt a leader-sent snapshot as the new log prefix
    ///
    /// a retained entry matching `(last_index, last_term)` means our suffix
    /// is still valid and survives; otherwise the whole log is replaced.
    pub fn install_snapshot(&mut self, last_index: LogIndex, last_term: Term, data: Vec<u8>) {
        if self.term_at(last_index) == Some(last_term) {
            self.entries.retain(|e| e.index > last_index);
        } else {
            self.entries.clear();
        }
        self.snapshot_index = last_index;
        self.snapshot_term = last_term;
        self.snapshot_data = data;
    }
}
