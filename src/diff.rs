//! Row-level diff between two snapshots.
//!
//! Rows are matched on their composite key through a hash index of the
//! previous snapshot, so a diff is linear in the number of rows.

use std::sync::Arc;

use ahash::AHashMap;
use serde::Serialize;

use crate::storage::Snapshot;
use crate::table::{Row, RowKey, SchemaViolation};

/// A row present in both snapshots whose fields differ.
#[derive(Debug, Clone, Serialize)]
pub struct RowModification {
    pub key: RowKey,
    pub old: Arc<Row>,
    pub new: Arc<Row>,
    pub changed_columns: Vec<String>,
}

/// Differences produced by one publish cycle.
///
/// `added`, `removed` and `modified` are sorted by key and their key sets are
/// pairwise disjoint.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeSet {
    pub sequence: u64,
    pub added: Vec<Arc<Row>>,
    pub removed: Vec<RowKey>,
    pub modified: Vec<RowModification>,
    pub schema_errors: Vec<SchemaViolation>,
}

impl ChangeSet {
    pub fn empty(sequence: u64) -> Self {
        Self {
            sequence,
            added: Vec::new(),
            removed: Vec::new(),
            modified: Vec::new(),
            schema_errors: Vec::new(),
        }
    }

    /// True when no row was added, removed or modified.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }

    /// Number of row-level changes.
    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.modified.len()
    }
}

pub struct DiffEngine;

impl DiffEngine {
    /// Diff `next` against `previous`. With no previous snapshot every row of
    /// `next` is reported as added. The change set carries `next`'s sequence.
    pub fn diff(previous: Option<&Snapshot>, next: &Snapshot) -> ChangeSet {
        let mut changes = ChangeSet::empty(next.sequence());

        let Some(previous) = previous else {
            changes.added = next.rows().to_vec();
            changes.added.sort_by(|a, b| a.key().cmp(b.key()));
            return changes;
        };

        let mut index: AHashMap<&RowKey, &Arc<Row>> = previous
            .rows()
            .iter()
            .map(|row| (row.key(), row))
            .collect();

        for row in next.rows() {
            match index.remove(row.key()) {
                None => changes.added.push(row.clone()),
                Some(old) if !old.same_as(row) => changes.modified.push(RowModification {
                    key: row.key().clone(),
                    changed_columns: old.changed_columns(row),
                    old: old.clone(),
                    new: row.clone(),
                }),
                Some(_) => {}
            }
        }

        changes.removed = index.keys().map(|key| (*key).clone()).collect();

        changes.added.sort_by(|a, b| a.key().cmp(b.key()));
        changes.removed.sort();
        changes.modified.sort_by(|a, b| a.key.cmp(&b.key));
        changes
    }
}
