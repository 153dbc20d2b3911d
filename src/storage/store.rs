use std::sync::Arc;

use parking_lot::RwLock;

use super::Snapshot;
use crate::diff::ChangeSet;
use crate::error::{ResyncRequired, StoreError};

/// A snapshot and the change set that produced it, as committed together.
#[derive(Debug, Clone)]
pub struct Committed {
    pub snapshot: Arc<Snapshot>,
    pub changes: Arc<ChangeSet>,
}

/// What a resuming client needs to catch up.
#[derive(Debug, Clone)]
pub enum Resume {
    /// The client already has the current sequence.
    UpToDate(u64),
    /// Cumulative changes from the client's sequence to the current one.
    Replay(Arc<ChangeSet>),
}

#[derive(Debug, Default)]
struct StoreState {
    current: Option<Committed>,
    previous: Option<Arc<Snapshot>>,
    next_sequence: u64,
}

/// Holds the current and previous snapshot and owns the sequence counter.
///
/// A commit replaces the whole state under one write lock, so readers see
/// either the old or the new snapshot, never a mix.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    state: RwLock<StoreState>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number the next commit must carry.
    pub fn next_sequence(&self) -> u64 {
        self.state.read().next_sequence
    }

    pub fn current(&self) -> Option<Arc<Snapshot>> {
        self.state.read().current.as_ref().map(|c| c.snapshot.clone())
    }

    pub fn current_sequence(&self) -> Option<u64> {
        self.state
            .read()
            .current
            .as_ref()
            .map(|c| c.snapshot.sequence())
    }

    pub fn previous(&self) -> Option<Arc<Snapshot>> {
        self.state.read().previous.clone()
    }

    /// The last commit, snapshot and change set read together.
    pub fn latest(&self) -> Option<Committed> {
        self.state.read().current.clone()
    }

    /// Atomically make `snapshot` current. The snapshot and its change set
    /// must both carry [`next_sequence`](Self::next_sequence).
    pub fn commit(&self, snapshot: Snapshot, changes: ChangeSet) -> Result<Committed, StoreError> {
        let mut state = self.state.write();
        let expected = state.next_sequence;

        for found in [snapshot.sequence(), changes.sequence] {
            if found != expected {
                return Err(StoreError::SequenceConflict { expected, found });
            }
        }

        let committed = Committed {
            snapshot: Arc::new(snapshot),
            changes: Arc::new(changes),
        };
        state.previous = state.current.take().map(|c| c.snapshot);
        state.current = Some(committed.clone());
        state.next_sequence = expected + 1;

        Ok(committed)
    }

    /// Changes a client that last saw `sequence` must apply to reach the
    /// current snapshot.
    pub fn changes_since(&self, sequence: u64) -> Result<Resume, ResyncRequired> {
        let state = self.state.read();
        let current = state.current.as_ref();
        let current_sequence = current.map(|c| c.snapshot.sequence());
        let previous_sequence = state.previous.as_ref().map(|p| p.sequence());

        match current {
            Some(c) if c.snapshot.sequence() == sequence => Ok(Resume::UpToDate(sequence)),
            Some(c) if previous_sequence == Some(sequence) => Ok(Resume::Replay(c.changes.clone())),
            _ => Err(ResyncRequired {
                requested: sequence,
                oldest_retained: previous_sequence.or(current_sequence),
                current: current_sequence,
            }),
        }
    }
}
