//! Single-flight publish cycle: read → validate → diff → commit → notify.
//!
//! At most one cycle runs at a time. Requests that arrive while a cycle is
//! running collapse into a single follow-up cycle instead of queueing.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::diff::DiffEngine;
use crate::error::{ReadError, StoreError};
use crate::storage::{Snapshot, SnapshotStore};
use crate::sync::{CycleFailure, DispatchReport, FeedEvent, SubscriberRegistry, UpdateFeed};
use crate::table::{read_table, Row, SchemaValidator, SchemaViolation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PublisherState {
    Idle,
    Cycling,
}

/// Result of one publish cycle.
#[derive(Debug, Clone)]
pub enum CycleOutcome {
    Committed {
        sequence: u64,
        added: usize,
        removed: usize,
        modified: usize,
        report: DispatchReport,
    },
    /// The file parsed to the rows already published; nothing was committed.
    Unchanged {
        sequence: u64,
    },
    SchemaRejected {
        errors: Vec<SchemaViolation>,
    },
    ReadFailed {
        error: String,
    },
    Conflict(StoreError),
}

impl CycleOutcome {
    pub fn sequence(&self) -> Option<u64> {
        match self {
            CycleOutcome::Committed { sequence, .. } => Some(*sequence),
            _ => None,
        }
    }
}

enum Loaded {
    Valid {
        columns: Vec<String>,
        rows: Vec<Row>,
        modified: Option<DateTime<Utc>>,
    },
    Rejected(Vec<SchemaViolation>),
}

struct CyclingGuard<'a>(&'a AtomicBool);

impl<'a> CyclingGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for CyclingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Publisher {
    source: PathBuf,
    delimiter: u8,
    validator: SchemaValidator,
    store: Arc<SnapshotStore>,
    registry: Arc<SubscriberRegistry>,
    feed: UpdateFeed,
    cycle_lock: Mutex<()>,
    cycling: AtomicBool,
    pending: AtomicBool,
    request: Notify,
    cycles: AtomicU64,
}

impl Publisher {
    pub fn new(
        source: impl Into<PathBuf>,
        delimiter: u8,
        store: Arc<SnapshotStore>,
        registry: Arc<SubscriberRegistry>,
        feed: UpdateFeed,
    ) -> Self {
        Self {
            source: source.into(),
            delimiter,
            validator: SchemaValidator::default(),
            store,
            registry,
            feed,
            cycle_lock: Mutex::new(()),
            cycling: AtomicBool::new(false),
            pending: AtomicBool::new(false),
            request: Notify::new(),
            cycles: AtomicU64::new(0),
        }
    }

    pub fn source(&self) -> &PathBuf {
        &self.source
    }

    pub fn state(&self) -> PublisherState {
        if self.cycling.load(Ordering::SeqCst) {
            PublisherState::Cycling
        } else {
            PublisherState::Idle
        }
    }

    /// Whether a follow-up cycle has been requested but not started.
    pub fn has_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    /// Number of cycles run so far, whatever their outcome.
    pub fn cycles_run(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Ask the worker for a cycle. Never blocks; repeated requests before the
    /// worker picks one up count as one.
    pub fn request_publish(&self) {
        self.pending.store(true, Ordering::SeqCst);
        self.request.notify_one();
    }

    /// Run requested cycles until the task is aborted.
    pub fn spawn_worker(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                this.request.notified().await;
                this.pending.store(false, Ordering::SeqCst);
                this.run_cycle().await;
            }
        })
    }

    /// Run one cycle now, waiting for any cycle in flight to finish first.
    pub async fn run_cycle(&self) -> CycleOutcome {
        let _serial = self.cycle_lock.lock().await;
        let _cycling = CyclingGuard::enter(&self.cycling);
        let started = Instant::now();

        let outcome = match self.load().await {
            Err(err) => {
                tracing::warn!(path = %self.source.display(), "read failed: {err}");
                let error = err.to_string();
                self.report_failure(CycleFailure::ReadError {
                    current_sequence: self.store.current_sequence(),
                    message: error.clone(),
                });
                CycleOutcome::ReadFailed { error }
            }
            Ok(Loaded::Rejected(errors)) => {
                tracing::warn!(
                    path = %self.source.display(),
                    violations = errors.len(),
                    "columns don't match the expected schema: {}",
                    errors.first().map(ToString::to_string).unwrap_or_default()
                );
                self.report_failure(CycleFailure::SchemaError {
                    current_sequence: self.store.current_sequence(),
                    errors: errors.clone(),
                });
                CycleOutcome::SchemaRejected { errors }
            }
            Ok(Loaded::Valid {
                columns,
                rows,
                modified,
            }) => self.commit(columns, rows, modified, started),
        };

        self.cycles.fetch_add(1, Ordering::Relaxed);
        outcome
    }

    async fn load(&self) -> Result<Loaded, ReadError> {
        let path = self.source.clone();
        let delimiter = self.delimiter;
        let validator = self.validator;

        let joined = tokio::task::spawn_blocking(move || -> Result<Loaded, ReadError> {
            let source = read_table(&path, delimiter)?;
            Ok(match validator.validate(&source.table) {
                Ok(rows) => Loaded::Valid {
                    columns: source.table.headers,
                    rows,
                    modified: source.modified,
                },
                Err(errors) => Loaded::Rejected(errors),
            })
        })
        .await;

        joined.unwrap_or_else(|join_err| {
            Err(ReadError::Io {
                path: self.source.clone(),
                source: std::io::Error::other(join_err.to_string()),
            })
        })
    }

    fn commit(
        &self,
        columns: Vec<String>,
        rows: Vec<Row>,
        modified: Option<DateTime<Utc>>,
        started: Instant,
    ) -> CycleOutcome {
        let sequence = self.store.next_sequence();
        let snapshot = Snapshot::new(sequence, columns, rows, modified);
        let previous = self.store.current();
        let changes = DiffEngine::diff(previous.as_deref(), &snapshot);

        if let Some(current) = previous.filter(|_| changes.is_empty()) {
            tracing::info!(
                sequence = current.sequence(),
                rows = current.row_count(),
                elapsed_us = started.elapsed().as_micros() as u64,
                "content unchanged"
            );
            return CycleOutcome::Unchanged {
                sequence: current.sequence(),
            };
        }

        let committed = match self.store.commit(snapshot, changes) {
            Ok(committed) => committed,
            Err(err) => {
                tracing::error!("commit rejected: {err}");
                return CycleOutcome::Conflict(err);
            }
        };

        let changes = committed.changes.clone();
        let row_count = committed.snapshot.row_count();
        let event = FeedEvent::Committed(committed);
        let report = self.registry.dispatch(&event);
        self.feed.publish(event);

        tracing::info!(
            sequence,
            rows = row_count,
            added = changes.added.len(),
            removed = changes.removed.len(),
            modified = changes.modified.len(),
            subscriber_failures = report.failures.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "processed update"
        );

        CycleOutcome::Committed {
            sequence,
            added: changes.added.len(),
            removed: changes.removed.len(),
            modified: changes.modified.len(),
            report,
        }
    }

    fn report_failure(&self, failure: CycleFailure) {
        let event = FeedEvent::Failed(Arc::new(failure));
        self.registry.dispatch(&event);
        self.feed.publish(event);
    }
}
