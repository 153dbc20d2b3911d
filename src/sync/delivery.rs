use std::sync::Arc;

use serde::Serialize;

use crate::error::DeliveryError;
use crate::storage::{Committed, Snapshot};
use crate::table::SchemaViolation;

/// A publish cycle that ended without a commit.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CycleFailure {
    /// The table broke the column contract; the current snapshot is untouched.
    SchemaError {
        current_sequence: Option<u64>,
        errors: Vec<SchemaViolation>,
    },
    /// The file could not be read; retried on the next change notification.
    ReadError {
        current_sequence: Option<u64>,
        message: String,
    },
}

impl CycleFailure {
    pub fn current_sequence(&self) -> Option<u64> {
        match self {
            CycleFailure::SchemaError {
                current_sequence, ..
            }
            | CycleFailure::ReadError {
                current_sequence, ..
            } => *current_sequence,
        }
    }
}

/// Everything the publisher hands to its consumers, in sequence order.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    Committed(Committed),
    Failed(Arc<CycleFailure>),
}

impl FeedEvent {
    /// Sequence of the committed snapshot, if this event committed one.
    pub fn sequence(&self) -> Option<u64> {
        match self {
            FeedEvent::Committed(c) => Some(c.changes.sequence),
            FeedEvent::Failed(_) => None,
        }
    }
}

/// Something that receives feed events: an in-process callback or one of the
/// network broadcasters.
///
/// `deliver` must not block on I/O. Network targets enqueue and return.
pub trait DeliveryTarget: Send + Sync {
    fn name(&self) -> &str;

    fn deliver(&self, event: &FeedEvent) -> Result<(), DeliveryError>;

    /// Called when the target missed feed events; re-base on `snapshot`.
    fn resync(&self, _snapshot: Option<Arc<Snapshot>>) -> Result<(), DeliveryError> {
        Ok(())
    }
}
