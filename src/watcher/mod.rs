//! File observation: a native notify watcher and an optional notify
//! [`PollWatcher`](notify::PollWatcher) feed one debounce window, whose
//! expiry asks the publisher for one cycle.

pub mod debounce;
pub mod detector;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use notify::{PollWatcher, RecommendedWatcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::publisher::Publisher;

pub use debounce::debounce;

const SIGNAL_QUEUE: usize = 64;

/// Watches one file and requests a publish cycle after each burst of changes.
#[derive(Debug, Clone)]
pub struct FileWatcher {
    path: PathBuf,
    debounce: Duration,
    poll_interval: Option<Duration>,
}

impl FileWatcher {
    pub fn new(path: impl Into<PathBuf>, debounce: Duration) -> Self {
        Self {
            path: path.into(),
            debounce,
            poll_interval: None,
        }
    }

    /// Also poll the file's modification time every `interval`.
    pub fn with_poll_interval(mut self, interval: Option<Duration>) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Start watching. Native watch failures are fatal unless polling is on,
    /// in which case polling alone drives the watcher.
    pub fn spawn(self, publisher: Arc<Publisher>) -> Result<WatchHandle> {
        let (tx, rx) = mpsc::channel(SIGNAL_QUEUE);
        let native = match detector::watch_file(&self.path, tx.clone()) {
            Ok(watcher) => Some(watcher),
            Err(err) if self.poll_interval.is_some() => {
                tracing::warn!(path = %self.path.display(), "native watch unavailable, polling only: {err:#}");
                None
            }
            Err(err) => return Err(err),
        };

        let poller = match self.poll_interval {
            Some(interval) => Some(detector::poll_file(&self.path, interval, tx)?),
            None => None,
        };

        let task = tokio::spawn(debounce(rx, self.debounce, move || {
            publisher.request_publish();
        }));

        tracing::info!(
            path = %self.path.display(),
            debounce_ms = self.debounce.as_millis() as u64,
            poll_ms = self.poll_interval.map(|d| d.as_millis() as u64),
            native = native.is_some(),
            "watching for changes"
        );

        Ok(WatchHandle {
            _native: native,
            _poller: poller,
            task,
        })
    }
}

/// Keeps the watch alive; dropping it stops watching.
pub struct WatchHandle {
    _native: Option<RecommendedWatcher>,
    _poller: Option<PollWatcher>,
    task: JoinHandle<()>,
}

impl WatchHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SnapshotStore;
    use crate::sync::{SubscriberRegistry, UpdateFeed};
    use crate::test_util::{inventory_csv, write_file};
    use tempfile::TempDir;

    #[tokio::test]
    async fn rewrite_burst_publishes_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("inventory.csv");
        write_file(&path, &inventory_csv(&[("A", 1, 1.0)]));

        let store = Arc::new(SnapshotStore::new());
        let publisher = Arc::new(Publisher::new(
            &path,
            b',',
            store.clone(),
            Arc::new(SubscriberRegistry::new()),
            UpdateFeed::new(8),
        ));
        let worker = publisher.spawn_worker();
        let handle = FileWatcher::new(&path, Duration::from_millis(300))
            .with_poll_interval(Some(Duration::from_millis(50)))
            .spawn(publisher.clone())
            .unwrap();
        assert!(handle.is_running());

        for units in 2..6 {
            write_file(&path, &inventory_csv(&[("A", units, 1.0)]));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let mut waited = Duration::ZERO;
        while store.current_sequence().is_none() && waited < Duration::from_secs(5) {
            tokio::time::sleep(Duration::from_millis(50)).await;
            waited += Duration::from_millis(50);
        }
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(publisher.cycles_run(), 1);
        assert_eq!(store.current_sequence(), Some(0));
        handle.stop();
        worker.abort();
    }
}
