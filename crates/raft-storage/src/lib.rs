//! # raft-storage
//!
//! why: a node that forgets its term or its log after a crash can vote twice
//!      and uncommit entries; durability is a safety requirement here
//! relations: raft-transport executes raft-core's PersistHardState and
//!            PersistEntries actions through the Storage trait; load_into
//!            rebuilds a RaftNode on restart
//! what: Storage trait, Snapshot record, FileStorage (atomic json files),
//!       InMemoryStorage for tests, load_into recovery helper

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use raft_core::{LogEntry, LogIndex, NodeId, RaftNode, Term};

/// everything that can go wrong below the raft state machine
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// a compacted log prefix, opaque bytes plus the boundary it covers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub data: Vec<u8>,
}

/// durable persistence for raft hard state, log and snapshot
///
/// the contract mirrors the persistence actions raft-core emits: hard state
/// is saved before any message that depends on it is sent, and appends
/// replace whatever was previously stored at or after the first new index
/// (that is how conflicting suffixes die on disk too).
pub trait Storage {
    /// persist current_term and voted_for
    fn save_hard_state(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<(), StorageError>;

    /// load the persisted hard state; (0, None) for a fresh node
    fn load_hard_state(&self) -> Result<(Term, Option<NodeId>), StorageError>;

    /// persist entries, replacing anything at or after the first new index
    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError>;

    /// load every retained log entry, in index order
    fn load_log(&self) -> Result<Vec<LogEntry>, StorageError>;

    /// drop every persisted entry at or after `from`
    fn truncate_from(&mut self, from: LogIndex) -> Result<(), StorageError>;

    /// persist a snapshot and prune the log entries it covers
    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError>;

    /// load the persisted snapshot, if any
    fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError>;

    /// wipe all persisted state
    fn clear(&mut self) -> Result<(), StorageError>;
}

/// rebuild a node's durable state after a restart
///
/// order matters: the snapshot becomes the log prefix first, then retained
/// entries go back on top of it. volatile leader state is not restored; a
/// restarted node always comes back as a follower.
pub fn load_into<S: Storage>(storage: &S, node: &mut RaftNode) -> Result<(), StorageError> {
    let (term, voted_for) = storage.load_hard_state()?;
    node.current_term = term;
    node.voted_for = voted_for;

    if let Some(snapshot) = storage.load_snapshot()? {
        node.log.install_snapshot(
            snapshot.last_included_index,
            snapshot.last_included_term,
            snapshot.data,
        );
        node.commit_index = snapshot.last_included_index;
        node.last_applied = snapshot.last_included_index;
    }
    for entry in storage.load_log()? {
        if entry.index >= node.log.first_index() {
            node.log.append(entry);
        }
    }
    debug!(
        node = node.id,
        term = node.current_term,
        last_index = node.last_log_index(),
        "state restored"
    );
    Ok(())
}

// -- file storage --

/// file-backed storage: one directory per node
///
/// three json files (meta.json, log.json, snapshot.json), each replaced
/// atomically by writing a temp file, syncing it and renaming it over the
/// old one. a crash mid-write leaves the previous version intact.
pub struct FileStorage {
    dir: PathBuf,
}

#[derive(Serialize, Deserialize, Default)]
struct HardState {
    term: Term,
    voted_for: Option<NodeId>,
}

impl FileStorage {
    /// open (creating if needed) the storage directory
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join("meta.json")
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join("log.json")
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join("snapshot.json")
    }

    fn write_atomic(&self, target: &Path, value: &impl Serialize) -> Result<(), StorageError> {
        let json = serde_json::to_string(value)?;
        let temp = self.dir.join(".write.tmp");
        let mut file = File::create(&temp)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp, target)?;
        Ok(())
    }

    fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, StorageError> {
        if !path.exists() {
            return Ok(None);
        }
        let mut contents = String::new();
        File::open(path)?.read_to_string(&mut contents)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    fn store_log(&self, log: &[LogEntry]) -> Result<(), StorageError> {
        self.write_atomic(&self.log_path(), &log)
    }
}

impl Storage for FileStorage {
    fn save_hard_state(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<(), StorageError> {
        self.write_atomic(&self.meta_path(), &HardState { term, voted_for })
    }

    fn load_hard_state(&self) -> Result<(Term, Option<NodeId>), StorageError> {
        let meta: HardState = Self::read_json(&self.meta_path())?.unwrap_or_default();
        Ok((meta.term, meta.voted_for))
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        let mut log = self.load_log()?;
        log.retain(|e| e.index < first.index);
        log.extend(entries.iter().cloned());
        self.store_log(&log)
    }

    fn load_log(&self) -> Result<Vec<LogEntry>, StorageError> {
        Ok(Self::read_json(&self.log_path())?.unwrap_or_default())
    }

    fn truncate_from(&mut self, from: LogIndex) -> Result<(), StorageError> {
        let mut log = self.load_log()?;
        log.retain(|e| e.index < from);
        self.store_log(&log)
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError> {
        self.write_atomic(&self.snapshot_path(), snapshot)?;
        let mut log = self.load_log()?;
        log.retain(|e| e.index > snapshot.last_included_index);
        self.store_log(&log)
    }

    fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        Self::read_json(&self.snapshot_path())
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        for path in [self.meta_path(), self.log_path(), self.snapshot_path()] {
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

// -- in-memory storage --

/// in-memory storage: the same contract with no disk, for tests
#[derive(Default)]
pub struct InMemoryStorage {
    term: Term,
    voted_for: Option<NodeId>,
    log: Vec<LogEntry>,
    snapshot: Option<Snapshot>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for InMemoryStorage {
    fn save_hard_state(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<(), StorageError> {
        self.term = term;
        self.voted_for = voted_for;
        Ok(())
    }

    fn load_hard_state(&self) -> Result<(Term, Option<NodeId>), StorageError> {
        Ok((self.term, self.voted_for))
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        self.log.retain(|e| e.index < first.index);
        self.log.extend(entries.iter().cloned());
        Ok(())
    }

    fn load_log(&self) -> Result<Vec<LogEntry>, StorageError> {
        Ok(self.log.clone())
    }

    fn truncate_from(&mut self, from: LogIndex) -> Result<(), StorageError> {
        self.log.retain(|e| e.index < from);
        Ok(())
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError> {
        self.log.retain(|e| e.index > snapshot.last_included_index);
        self.snapshot = Some(snapshot.clone());
        Ok(())
    }

    fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        Ok(self.snapshot.clone())
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        *self = Self::default();
        Ok(())
    }
}
