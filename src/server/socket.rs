//! Raw WebSocket broadcaster: the current snapshot on connect, then one
//! change-set document per commit. Inbound messages are ignored.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;

use super::clients::{serve_socket, ClientSet};
use super::frames::{SnapshotFrames, WireMessage};
use super::{greet_with_snapshot, launch, resync_clients, RunningBroadcaster, ServerContext};
use crate::config::BroadcasterConfig;
use crate::error::DeliveryError;
use crate::storage::{Snapshot, SnapshotStore};
use crate::sync::{DeliveryTarget, FeedEvent};

pub const NAME: &str = "socket";

struct SocketTarget {
    clients: Arc<ClientSet>,
    frames: Arc<SnapshotFrames>,
}

impl DeliveryTarget for SocketTarget {
    fn name(&self) -> &str {
        NAME
    }

    fn deliver(&self, event: &FeedEvent) -> Result<(), DeliveryError> {
        let (sequence, frame) = match event {
            FeedEvent::Committed(c) => (Some(c.changes.sequence), WireMessage::ChangeSet(&c.changes).encode()?),
            FeedEvent::Failed(failure) => (None, WireMessage::CycleError(failure).encode()?),
        };
        self.clients.broadcast(sequence, |_| Some(frame.clone()));
        Ok(())
    }

    fn resync(&self, snapshot: Option<Arc<Snapshot>>) -> Result<(), DeliveryError> {
        resync_clients(&self.clients, &self.frames, snapshot)
    }
}

#[derive(Clone)]
struct SocketState {
    clients: Arc<ClientSet>,
    store: Arc<SnapshotStore>,
    frames: Arc<SnapshotFrames>,
    send_timeout: Duration,
}

pub async fn start(config: &BroadcasterConfig, ctx: &ServerContext) -> Result<RunningBroadcaster> {
    let clients = Arc::new(ClientSet::new(NAME, config.client_buffer));
    let frames = Arc::new(SnapshotFrames::tagged());
    let state = SocketState {
        clients: clients.clone(),
        store: ctx.store.clone(),
        frames: frames.clone(),
        send_timeout: config.send_timeout(),
    };

    let router = Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .with_state(state);

    let target = Arc::new(SocketTarget {
        clients: clients.clone(),
        frames,
    });
    launch(NAME, config, ctx, router, target, clients).await
}

async fn ws_handler(
    State(state): State<SocketState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, addr, socket))
}

async fn handle_socket(state: SocketState, addr: SocketAddr, socket: WebSocket) {
    let (store, frames) = (state.store.clone(), state.frames.clone());
    frames.warm(&store);
    let client = state
        .clients
        .register(Some(addr), (), |client| greet_with_snapshot(&frames, &store, client));

    serve_socket(state.clients, client, socket, state.send_timeout, |client, text| {
        tracing::debug!(broadcaster = NAME, client = %client.id(), len = text.len(), "ignoring client message");
    })
    .await;
}
