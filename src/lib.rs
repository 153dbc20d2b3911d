//! # Tablecast - live inventory table streaming
//!
//! Watches a delimited inventory file, validates each new version against a
//! fixed column contract, diffs it row by row on the composite key
//! (Store ID, Product ID, Date) and publishes the result as a sequenced
//! change set.
//!
//! ## Pipeline
//!
//! - **Watcher**: notify events (plus an optional mtime poll) go through a
//!   resettable debounce window; each quiet period requests one cycle.
//! - **Publisher**: single-flight read → validate → diff → commit. Requests
//!   that arrive mid-cycle collapse into one follow-up cycle.
//! - **Store**: keeps the current and previous snapshot and hands out
//!   gap-free sequence numbers starting at 0.
//! - **Subscribers**: in-process callbacks run synchronously in
//!   subscription order, with panics and errors isolated per callback.
//! - **Broadcasters**: a raw WebSocket feed, a named-channel pub/sub feed and
//!   a pull/push HTTP service with resumable streaming. Each drains its own
//!   feed receiver and serves every client from a bounded drop-oldest outbox.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tablecast::{StreamConfig, TableStreamer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = StreamConfig::load("tablecast.toml")?;
//!     let _log_guard = tablecast::logging::init(&config.logging)?;
//!
//!     let streamer = TableStreamer::new(config)?;
//!     streamer.subscribe(|snapshot, changes| {
//!         println!(
//!             "#{}: {} rows, +{} -{} ~{}",
//!             changes.sequence,
//!             snapshot.row_count(),
//!             changes.added.len(),
//!             changes.removed.len(),
//!             changes.modified.len()
//!         );
//!         Ok(())
//!     });
//!
//!     let running = streamer.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     running.shutdown();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod diff;
pub mod error;
pub mod logging;
pub mod publisher;
pub mod server;
pub mod storage;
pub mod streamer;
pub mod sync;
pub mod table;
pub mod watcher;

#[cfg(test)]
pub(crate) mod test_util;

pub use config::{BroadcasterConfig, LoggingConfig, StreamConfig};
pub use diff::{ChangeSet, DiffEngine, RowModification};
pub use error::{ConfigError, ReadError, ResyncRequired, StoreError, SubscriberError};
pub use publisher::{CycleOutcome, Publisher, PublisherState};
pub use storage::{Snapshot, SnapshotStore, SnapshotSummary};
pub use streamer::{RunningStreamer, StreamerStatus, TableStreamer};
pub use sync::{CycleFailure, SubscriberRegistry, SubscriptionHandle};
pub use table::{CellValue, Row, RowKey, SchemaValidator, SchemaViolation};
pub use watcher::FileWatcher;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
