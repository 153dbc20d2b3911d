pub mod snapshot;
pub mod store;

pub use snapshot::{DateRange, NumericSummary, Snapshot, SnapshotSummary};
pub use store::{Committed, Resume, SnapshotStore};
