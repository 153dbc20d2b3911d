use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::config::StreamConfig;
use crate::diff::ChangeSet;
use crate::error::ConfigError;
use crate::publisher::{CycleOutcome, Publisher, PublisherState};
use crate::server::{self, BroadcasterStatus, RunningBroadcaster, ServerContext};
use crate::storage::{Snapshot, SnapshotStore, SnapshotSummary};
use crate::sync::{CycleFailure, SubscriberRegistry, SubscriptionHandle, UpdateFeed};
use crate::watcher::{FileWatcher, WatchHandle};

/// The assembled pipeline: store, registry, feed and publisher for one
/// watched file. Library consumers subscribe here; [`start`](Self::start)
/// brings up the watcher and the enabled broadcasters.
pub struct TableStreamer {
    config: StreamConfig,
    store: Arc<SnapshotStore>,
    registry: Arc<SubscriberRegistry>,
    feed: UpdateFeed,
    publisher: Arc<Publisher>,
}

impl TableStreamer {
    pub fn new(config: StreamConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let delimiter = config.delimiter_byte()?;

        let store = Arc::new(SnapshotStore::new());
        let registry = Arc::new(SubscriberRegistry::new());
        let feed = UpdateFeed::new(config.feed_capacity);
        let publisher = Arc::new(Publisher::new(
            config.csv_path.clone(),
            delimiter,
            store.clone(),
            registry.clone(),
            feed.clone(),
        ));

        Ok(Self {
            config,
            store,
            registry,
            feed,
            publisher,
        })
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Call `callback` with the full snapshot and the change set after every
    /// commit.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(&Snapshot, &ChangeSet) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.registry.subscribe(callback)
    }

    /// Call `callback` for every cycle rejected by validation or that failed
    /// to read the file.
    pub fn subscribe_failures<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(&CycleFailure) + Send + Sync + 'static,
    {
        self.registry.subscribe_failures(callback)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.registry.unsubscribe(handle)
    }

    pub fn current_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.store.current()
    }

    pub fn summary(&self) -> Option<SnapshotSummary> {
        self.store.current().map(|s| s.summary())
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    pub fn publisher(&self) -> &Arc<Publisher> {
        &self.publisher
    }

    pub fn feed(&self) -> &UpdateFeed {
        &self.feed
    }

    /// Run one cycle immediately, bypassing the watcher.
    pub async fn publish_now(&self) -> CycleOutcome {
        self.publisher.run_cycle().await
    }

    /// Start the publish worker and the file watcher, load the file once,
    /// then start the enabled broadcasters.
    ///
    /// The watcher is live before the first read, so an edit made while the
    /// broadcasters bind still triggers a cycle. A missing or invalid file at
    /// startup is not fatal: the watcher picks it up once it appears or is
    /// fixed. Failing to bind an enabled broadcaster is.
    pub async fn start(&self) -> Result<RunningStreamer> {
        let mut running = RunningStreamer {
            store: self.store.clone(),
            publisher: self.publisher.clone(),
            broadcasters: Vec::new(),
            watch: None,
            worker: self.publisher.spawn_worker(),
        };
        running.watch = Some(
            FileWatcher::new(self.config.csv_path.clone(), self.config.debounce())
                .with_poll_interval(self.config.poll_interval())
                .spawn(self.publisher.clone())
                .context("failed to start file watcher")?,
        );

        match self.publisher.run_cycle().await {
            CycleOutcome::Committed { sequence, .. } => {
                tracing::info!(sequence, path = %self.config.csv_path.display(), "initial load complete");
            }
            CycleOutcome::Unchanged { sequence } => {
                tracing::info!(sequence, path = %self.config.csv_path.display(), "already loaded");
            }
            other => {
                tracing::warn!(path = %self.config.csv_path.display(), outcome = ?other, "initial load failed; waiting for changes");
            }
        }

        let ctx = ServerContext::new(self.store.clone(), self.feed.clone(), self.publisher.clone());
        if self.config.socket.enabled {
            running.broadcasters.push(server::socket::start(&self.config.socket, &ctx).await?);
        }
        if self.config.channels.enabled {
            running.broadcasters.push(server::channels::start(&self.config.channels, &ctx).await?);
        }
        if self.config.pull_push.enabled {
            running.broadcasters.push(server::pull_push::start(&self.config.pull_push, &ctx).await?);
        }

        Ok(running)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamerStatus {
    pub sequence: Option<u64>,
    pub publisher: PublisherState,
    pub watching: bool,
    pub broadcasters: Vec<BroadcasterStatus>,
}

/// Handle to a started streamer. Dropping it stops everything.
pub struct RunningStreamer {
    store: Arc<SnapshotStore>,
    publisher: Arc<Publisher>,
    broadcasters: Vec<RunningBroadcaster>,
    watch: Option<WatchHandle>,
    worker: JoinHandle<()>,
}

impl RunningStreamer {
    pub fn status(&self) -> StreamerStatus {
        StreamerStatus {
            sequence: self.store.current_sequence(),
            publisher: self.publisher.state(),
            watching: self.watch.as_ref().is_some_and(WatchHandle::is_running) && !self.worker.is_finished(),
            broadcasters: self.broadcasters.iter().map(RunningBroadcaster::status).collect(),
        }
    }

    /// Address a broadcaster actually bound, useful with port 0.
    pub fn local_addr(&self, broadcaster: &str) -> Option<SocketAddr> {
        self.broadcasters
            .iter()
            .find(|b| b.name() == broadcaster)
            .map(RunningBroadcaster::local_addr)
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.watch.take();
        self.worker.abort();
        self.broadcasters.clear();
    }
}

impl Drop for RunningStreamer {
    fn drop(&mut self) {
        self.stop();
    }
}
