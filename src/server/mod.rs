//! Network broadcasters. Each one owns its listener, its client set and a
//! pump task draining its own receiver of the update feed, so a stalled or
//! crashed broadcaster never touches the publisher or its siblings.

pub mod channels;
pub mod clients;
pub mod frames;
pub mod outbox;
pub mod pull_push;
pub mod socket;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use axum::Router;
use dashmap::DashMap;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::config::BroadcasterConfig;
use crate::error::{with_retry, DeliveryError, RetryPolicy};
use crate::publisher::Publisher;
use crate::storage::{Snapshot, SnapshotStore};
use crate::sync::{DeliveryTarget, UpdateFeed};
use clients::{ClientHandle, ConnectedClients};
use frames::SnapshotFrames;

pub use clients::ClientSet;

/// What every broadcaster needs from the publish pipeline.
#[derive(Clone)]
pub struct ServerContext {
    pub store: Arc<SnapshotStore>,
    pub feed: UpdateFeed,
    pub publisher: Arc<Publisher>,
    pub board: Arc<StatusBoard>,
    pub bind_retry: RetryPolicy,
}

impl ServerContext {
    pub fn new(store: Arc<SnapshotStore>, feed: UpdateFeed, publisher: Arc<Publisher>) -> Self {
        Self {
            store,
            feed,
            publisher,
            board: Arc::new(StatusBoard::default()),
            bind_retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BroadcasterStatus {
    pub name: &'static str,
    pub bind: SocketAddr,
    pub clients: usize,
    pub running: bool,
}

struct BoardEntry {
    bind: SocketAddr,
    clients: Arc<dyn ConnectedClients>,
}

/// Live client counts of every started broadcaster.
#[derive(Default)]
pub struct StatusBoard {
    entries: DashMap<&'static str, BoardEntry>,
}

impl StatusBoard {
    fn register(&self, name: &'static str, bind: SocketAddr, clients: Arc<dyn ConnectedClients>) {
        self.entries.insert(name, BoardEntry { bind, clients });
    }

    fn unregister(&self, name: &str) {
        self.entries.remove(name);
    }

    /// One entry per running broadcaster, sorted by name.
    pub fn statuses(&self) -> Vec<BroadcasterStatus> {
        let mut statuses: Vec<_> = self
            .entries
            .iter()
            .map(|entry| BroadcasterStatus {
                name: *entry.key(),
                bind: entry.bind,
                clients: entry.clients.connected(),
                running: true,
            })
            .collect();
        statuses.sort_by_key(|s| s.name);
        statuses
    }
}

/// A started broadcaster. Dropping it stops the listener and the pump.
pub struct RunningBroadcaster {
    name: &'static str,
    local_addr: SocketAddr,
    clients: Arc<dyn ConnectedClients>,
    board: Arc<StatusBoard>,
    server: JoinHandle<()>,
    pump: JoinHandle<()>,
}

impl RunningBroadcaster {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        !self.server.is_finished() && !self.pump.is_finished()
    }

    pub fn status(&self) -> BroadcasterStatus {
        BroadcasterStatus {
            name: self.name,
            bind: self.local_addr,
            clients: self.clients.connected(),
            running: self.is_running(),
        }
    }

    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for RunningBroadcaster {
    fn drop(&mut self) {
        self.server.abort();
        self.pump.abort();
        self.board.unregister(self.name);
        tracing::info!(broadcaster = self.name, "broadcaster stopped");
    }
}

/// Bind `config.bind`, serve `router` on it and start draining the feed into
/// `target`.
pub(crate) async fn launch(
    name: &'static str,
    config: &BroadcasterConfig,
    ctx: &ServerContext,
    router: Router,
    target: Arc<dyn DeliveryTarget>,
    clients: Arc<dyn ConnectedClients>,
) -> Result<RunningBroadcaster> {
    let bind = config.bind;
    let listener = with_retry(&ctx.bind_retry, &format!("binding {name} on {bind}"), || {
        TcpListener::bind(bind)
    })
    .await
    .with_context(|| format!("{name} broadcaster could not bind {bind}"))?;
    let local_addr = listener.local_addr().context("listener has no local address")?;

    let pump = ctx.feed.spawn_pump(ctx.store.clone(), target);

    let app = router.layer(TraceLayer::new_for_http());
    let server = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await {
            tracing::error!(broadcaster = name, "server error: {err}");
        }
    });

    ctx.board.register(name, local_addr, clients.clone());
    tracing::info!(broadcaster = name, addr = %local_addr, "broadcaster listening");

    Ok(RunningBroadcaster {
        name,
        local_addr,
        clients,
        board: ctx.board.clone(),
        server,
        pump,
    })
}

/// Queue the current snapshot for a new client; returns the sequence it
/// brings the client up to. Callers warm `frames` before taking the
/// client-set lock this runs under.
pub(crate) fn greet_with_snapshot<S>(
    frames: &SnapshotFrames,
    store: &SnapshotStore,
    client: &ClientHandle<S>,
) -> Option<u64> {
    let snapshot = store.current()?;
    match frames.frame(&snapshot) {
        Ok(frame) => {
            client.send(frame);
            Some(snapshot.sequence())
        }
        Err(err) => {
            tracing::error!(client = %client.id(), "could not encode snapshot: {err}");
            None
        }
    }
}

/// Re-base every client of `clients` on `snapshot` after the feed lagged.
pub(crate) fn resync_clients<S>(
    clients: &ClientSet<S>,
    frames: &SnapshotFrames,
    snapshot: Option<Arc<Snapshot>>,
) -> Result<(), DeliveryError> {
    if let Some(snapshot) = snapshot {
        let frame = frames.frame(&snapshot)?;
        clients.resync_all(snapshot.sequence(), frame);
    }
    Ok(())
}
