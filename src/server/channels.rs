//! Pub/sub broadcaster: every document is wrapped in a channel envelope and
//! clients choose the channels they receive.
//!
//! Client commands:
//!
//! ```json
//! {"action": "subscribe", "channels": ["rows_added", "rows_removed"]}
//! {"action": "unsubscribe", "channels": ["data_update"]}
//! {"action": "snapshot"}
//! ```
//!
//! New clients start on `data_update` and `schema_error`, and get the
//! current snapshot on `snapshot` right away and again after each
//! `subscribe` or `snapshot` command.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashSet;
use anyhow::Result;
use axum::extract::ws::{Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::clients::{serve_socket, ClientHandle, ClientSet};
use super::frames::{Envelope, SnapshotFrames, WireMessage};
use super::{launch, RunningBroadcaster, ServerContext};
use crate::config::BroadcasterConfig;
use crate::error::DeliveryError;
use crate::storage::{Committed, Snapshot, SnapshotStore};
use crate::sync::{CycleFailure, DeliveryTarget, FeedEvent};

pub const NAME: &str = "channels";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Full table state
    Snapshot,
    /// Every change set, and read failures
    DataUpdate,
    RowsAdded,
    RowsRemoved,
    RowsModified,
    SchemaError,
}

impl Channel {
    pub const ALL: [Channel; 6] = [
        Channel::Snapshot,
        Channel::DataUpdate,
        Channel::RowsAdded,
        Channel::RowsRemoved,
        Channel::RowsModified,
        Channel::SchemaError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Snapshot => "snapshot",
            Channel::DataUpdate => "data_update",
            Channel::RowsAdded => "rows_added",
            Channel::RowsRemoved => "rows_removed",
            Channel::RowsModified => "rows_modified",
            Channel::SchemaError => "schema_error",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channels one client receives.
pub struct Subscriptions(RwLock<AHashSet<Channel>>);

impl Default for Subscriptions {
    fn default() -> Self {
        Self(RwLock::new([Channel::DataUpdate, Channel::SchemaError].into_iter().collect()))
    }
}

impl Subscriptions {
    pub fn contains(&self, channel: Channel) -> bool {
        self.0.read().contains(&channel)
    }

    fn add(&self, channels: &[Channel]) {
        self.0.write().extend(channels.iter().copied());
    }

    fn remove(&self, channels: &[Channel]) {
        let mut set = self.0.write();
        for channel in channels {
            set.remove(channel);
        }
    }

    pub fn list(&self) -> Vec<Channel> {
        let set = self.0.read();
        Channel::ALL.into_iter().filter(|c| set.contains(c)).collect()
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientRequest {
    Subscribe { channels: Vec<Channel> },
    Unsubscribe { channels: Vec<Channel> },
    Snapshot,
}

type ChannelClients = ClientSet<Subscriptions>;

fn snapshot_frame(snapshot: &Snapshot) -> Result<Utf8Bytes, DeliveryError> {
    Envelope::new(
        Channel::Snapshot.as_str(),
        Some(snapshot.sequence()),
        WireMessage::Snapshot(snapshot),
    )
    .encode()
}

/// Encoded documents for one commit, at most one per channel.
fn commit_frames(committed: &Committed) -> Result<Vec<(Channel, Utf8Bytes)>, DeliveryError> {
    let changes = &committed.changes;
    let seq = Some(changes.sequence);
    let mut frames = vec![(
        Channel::DataUpdate,
        Envelope::new(Channel::DataUpdate.as_str(), seq, WireMessage::ChangeSet(changes)).encode()?,
    )];

    if !changes.added.is_empty() {
        frames.push((
            Channel::RowsAdded,
            Envelope::new(Channel::RowsAdded.as_str(), seq, &changes.added).encode()?,
        ));
    }
    if !changes.removed.is_empty() {
        frames.push((
            Channel::RowsRemoved,
            Envelope::new(Channel::RowsRemoved.as_str(), seq, &changes.removed).encode()?,
        ));
    }
    if !changes.modified.is_empty() {
        frames.push((
            Channel::RowsModified,
            Envelope::new(Channel::RowsModified.as_str(), seq, &changes.modified).encode()?,
        ));
    }
    Ok(frames)
}

fn failure_frame(failure: &CycleFailure) -> Result<(Channel, Utf8Bytes), DeliveryError> {
    let channel = match failure {
        CycleFailure::SchemaError { .. } => Channel::SchemaError,
        CycleFailure::ReadError { .. } => Channel::DataUpdate,
    };
    let frame = Envelope::new(channel.as_str(), None, WireMessage::CycleError(failure)).encode()?;
    Ok((channel, frame))
}

struct ChannelTarget {
    clients: Arc<ChannelClients>,
    frames: Arc<SnapshotFrames>,
}

impl DeliveryTarget for ChannelTarget {
    fn name(&self) -> &str {
        NAME
    }

    fn deliver(&self, event: &FeedEvent) -> Result<(), DeliveryError> {
        let (sequence, frames) = match event {
            FeedEvent::Committed(c) => (Some(c.changes.sequence), commit_frames(c)?),
            FeedEvent::Failed(failure) => (None, vec![failure_frame(failure)?]),
        };

        self.clients.broadcast(sequence, |client| {
            frames
                .iter()
                .filter(|(channel, _)| client.state.contains(*channel))
                .map(|(_, frame)| frame.clone())
                .collect::<Vec<_>>()
        });
        Ok(())
    }

    fn resync(&self, snapshot: Option<Arc<Snapshot>>) -> Result<(), DeliveryError> {
        if let Some(snapshot) = snapshot {
            self.clients.resync_all(snapshot.sequence(), self.frames.frame(&snapshot)?);
        }
        Ok(())
    }
}

#[derive(Clone)]
struct ChannelState {
    clients: Arc<ChannelClients>,
    store: Arc<SnapshotStore>,
    frames: Arc<SnapshotFrames>,
    send_timeout: Duration,
}

pub async fn start(config: &BroadcasterConfig, ctx: &ServerContext) -> Result<RunningBroadcaster> {
    let clients = Arc::new(ChannelClients::new(NAME, config.client_buffer));
    let frames = Arc::new(SnapshotFrames::new(snapshot_frame));
    let state = ChannelState {
        clients: clients.clone(),
        store: ctx.store.clone(),
        frames: frames.clone(),
        send_timeout: config.send_timeout(),
    };

    let router = Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .with_state(state);

    let target = Arc::new(ChannelTarget {
        clients: clients.clone(),
        frames,
    });
    launch(NAME, config, ctx, router, target, clients).await
}

async fn ws_handler(
    State(state): State<ChannelState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, addr, socket))
}

fn send_snapshot(frames: &SnapshotFrames, store: &SnapshotStore, client: &ClientHandle<Subscriptions>) -> Option<u64> {
    let snapshot = store.current()?;
    match frames.frame(&snapshot) {
        Ok(frame) => {
            client.send(frame);
            Some(snapshot.sequence())
        }
        Err(err) => {
            tracing::error!(broadcaster = NAME, client = %client.id(), "could not encode snapshot: {err}");
            None
        }
    }
}

fn send_error(client: &ClientHandle<Subscriptions>, message: String) {
    let body = serde_json::json!({ "error": message });
    if let Ok(frame) = Envelope::new("error", None, body).encode() {
        client.send(frame);
    }
}

async fn handle_socket(state: ChannelState, addr: SocketAddr, socket: WebSocket) {
    let (store, frames) = (state.store.clone(), state.frames.clone());
    frames.warm(&store);
    let client = state
        .clients
        .register(Some(addr), Subscriptions::default(), |client| send_snapshot(&frames, &store, client));

    let clients = state.clients.clone();
    let resend = move |client: &ClientHandle<Subscriptions>| {
        frames.warm(&store);
        clients.regreet(client, |client| send_snapshot(&frames, &store, client));
    };
    serve_socket(state.clients, client, socket, state.send_timeout, move |client, text| {
        match serde_json::from_str::<ClientRequest>(text) {
            Ok(ClientRequest::Subscribe { channels }) => {
                client.state.add(&channels);
                tracing::debug!(broadcaster = NAME, client = %client.id(), ?channels, "subscribed");
                resend(client);
            }
            Ok(ClientRequest::Unsubscribe { channels }) => {
                client.state.remove(&channels);
                tracing::debug!(broadcaster = NAME, client = %client.id(), ?channels, "unsubscribed");
            }
            Ok(ClientRequest::Snapshot) => resend(client),
            Err(err) => {
                tracing::debug!(broadcaster = NAME, client = %client.id(), "bad request: {err}");
                send_error(client, format!("invalid request: {err}"));
            }
        }
    })
    .await;
}
