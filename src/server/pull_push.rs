//! Pull/push service: HTTP queries against the snapshot store plus a
//! resumable WebSocket stream of change sets.
//!
//! | Route | |
//! |---|---|
//! | `GET /data` | latest snapshot, `503` before the first commit |
//! | `GET /summary` | row count, date range and numeric column stats |
//! | `GET /status` | sequence, publisher state, broadcaster client counts |
//! | `GET /ws/data?resume_from=N` | change-set stream, resuming after `N` |
//!
//! Stream clients may send `{"ack": N}` after applying sequence `N`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::clients::{serve_socket, ClientHandle, ClientSet};
use super::frames::{SnapshotFrames, WireMessage};
use super::{greet_with_snapshot, launch, resync_clients, BroadcasterStatus, RunningBroadcaster, ServerContext, StatusBoard};
use crate::config::BroadcasterConfig;
use crate::diff::ChangeSet;
use crate::error::DeliveryError;
use crate::publisher::{Publisher, PublisherState};
use crate::storage::{Resume, Snapshot, SnapshotStore};
use crate::sync::{DeliveryTarget, FeedEvent};

pub const NAME: &str = "pull_push";

struct PushTarget {
    clients: Arc<ClientSet>,
    frames: Arc<SnapshotFrames>,
}

impl DeliveryTarget for PushTarget {
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
struct PullPushState {
    clients: Arc<ClientSet>,
    store: Arc<SnapshotStore>,
    frames: Arc<SnapshotFrames>,
    publisher: Arc<Publisher>,
    board: Arc<StatusBoard>,
    send_timeout: Duration,
}

pub async fn start(config: &BroadcasterConfig, ctx: &ServerContext) -> Result<RunningBroadcaster> {
    let clients = Arc::new(ClientSet::new(NAME, config.client_buffer));
    let frames = Arc::new(SnapshotFrames::tagged());
    let state = PullPushState {
        clients: clients.clone(),
        store: ctx.store.clone(),
        frames: frames.clone(),
        publisher: ctx.publisher.clone(),
        board: ctx.board.clone(),
        send_timeout: config.send_timeout(),
    };

    let target = Arc::new(PushTarget {
        clients: clients.clone(),
        frames,
    });
    launch(NAME, config, ctx, router(state), target, clients).await
}

fn router(state: PullPushState) -> Router {
    Router::new()
        .route("/", get(|| async { "tablecast pull/push service" }))
        .route("/data", get(get_data))
        .route("/summary", get(get_summary))
        .route("/status", get(get_status))
        .route("/ws/data", get(ws_handler))
        .with_state(state)
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response {
    match serde_json::to_vec(value) {
        Ok(body) => (status, [(header::CONTENT_TYPE, "application/json")], body).into_response(),
        Err(err) => {
            tracing::error!(broadcaster = NAME, "failed to encode response: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn no_data() -> Response {
    json(
        StatusCode::SERVICE_UNAVAILABLE,
        &serde_json::json!({ "error": "No data available" }),
    )
}

async fn get_data(State(state): State<PullPushState>) -> Response {
    let Some(snapshot) = state.store.current() else {
        return no_data();
    };
    match state.frames.frame(&snapshot) {
        Ok(frame) => (StatusCode::OK, [(header::CONTENT_TYPE, "application/json")], frame.as_str().to_owned()).into_response(),
        Err(err) => {
            tracing::error!(broadcaster = NAME, "failed to encode snapshot: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn get_summary(State(state): State<PullPushState>) -> Response {
    match state.store.current() {
        Some(snapshot) => json(StatusCode::OK, &snapshot.summary()),
        None => no_data(),
    }
}

#[derive(Debug, Serialize)]
struct StreamClient {
    id: Uuid,
    addr: Option<SocketAddr>,
    since: Option<u64>,
    last_ack: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ServiceStatus {
    source: String,
    sequence: Option<u64>,
    next_sequence: u64,
    publisher: PublisherState,
    pending_cycle: bool,
    cycles_run: u64,
    broadcasters: Vec<BroadcasterStatus>,
    stream_clients: Vec<StreamClient>,
}

async fn get_status(State(state): State<PullPushState>) -> Response {
    let status = ServiceStatus {
        source: state.publisher.source().display().to_string(),
        sequence: state.store.current_sequence(),
        next_sequence: state.store.next_sequence(),
        publisher: state.publisher.state(),
        pending_cycle: state.publisher.has_pending(),
        cycles_run: state.publisher.cycles_run(),
        broadcasters: state.board.statuses(),
        stream_clients: state
            .clients
            .handles()
            .iter()
            .map(|c| StreamClient {
                id: c.id(),
                addr: c.addr(),
                since: c.since(),
                last_ack: c.last_ack(),
            })
            .collect(),
    };
    json(StatusCode::OK, &status)
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    resume_from: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Ack {
    ack: u64,
}

async fn ws_handler(
    State(state): State<PullPushState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<StreamQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_stream(state, addr, query.resume_from, socket))
}

/// Queue what a client resuming after `sequence` needs and return the
/// sequence it is brought to.
fn greet_resuming(store: &SnapshotStore, client: &ClientHandle, sequence: u64) -> Option<u64> {
    let (frame, reached) = match store.changes_since(sequence) {
        Ok(Resume::UpToDate(current)) => (WireMessage::ChangeSet(&ChangeSet::empty(current)).encode(), Some(current)),
        Ok(Resume::Replay(changes)) => (WireMessage::ChangeSet(&changes).encode(), Some(changes.sequence)),
        Err(resync) => {
            tracing::info!(
                broadcaster = NAME,
                client = %client.id(),
                requested = resync.requested,
                current = ?resync.current,
                "resume point not retained; client must resync"
            );
            (WireMessage::ResyncRequired(&resync).encode(), resync.current)
        }
    };

    match frame {
        Ok(frame) => {
            client.send(frame);
            reached
        }
        Err(err) => {
            tracing::error!(broadcaster = NAME, client = %client.id(), "could not encode greeting: {err}");
            None
        }
    }
}

async fn handle_stream(state: PullPushState, addr: SocketAddr, resume_from: Option<u64>, socket: WebSocket) {
    let (store, frames) = (state.store.clone(), state.frames.clone());
    if resume_from.is_none() {
        frames.warm(&store);
    }
    let client = state.clients.register(Some(addr), (), |client| match resume_from {
        Some(sequence) => greet_resuming(&store, client, sequence),
        None => greet_with_snapshot(&frames, &store, client),
    });

    serve_socket(state.clients, client, socket, state.send_timeout, |client, text| {
        match serde_json::from_str::<Ack>(text) {
            Ok(Ack { ack }) => client.acknowledge(ack),
            Err(err) => tracing::debug!(broadcaster = NAME, client = %client.id(), "ignoring message: {err}"),
        }
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Committed;
    use crate::sync::{SubscriberRegistry, UpdateFeed};
    use serde_json::Value;

    fn state() -> PullPushState {
        let store = Arc::new(SnapshotStore::new());
        let publisher = Arc::new(Publisher::new(
            "inventory.csv",
            b',',
            store.clone(),
            Arc::new(SubscriberRegistry::new()),
            UpdateFeed::new(4),
        ));
        PullPushState {
            clients: Arc::new(ClientSet::new(NAME, 8)),
            store,
            frames: Arc::new(SnapshotFrames::tagged()),
            publisher,
            board: Arc::new(StatusBoard::default()),
            send_timeout: Duration::from_secs(1),
        }
    }

    fn commit_empty(store: &SnapshotStore) -> Committed {
        let seq = store.next_sequence();
        store
            .commit(Snapshot::new(seq, vec!["Date".into()], Vec::new(), None), ChangeSet::empty(seq))
            .unwrap()
    }

    async fn body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn data_is_unavailable_before_first_commit() {
        let state = state();
        let response = get_data(State(state.clone())).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body(response).await["error"], "No data available");

        commit_empty(&state.store);
        let response = get_data(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let doc = body(response).await;
        assert_eq!(doc["type"], "snapshot");
        assert_eq!(doc["sequence"], 0);
    }

    #[tokio::test]
    async fn status_reports_sequence_and_publisher() {
        let state = state();
        commit_empty(&state.store);
        commit_empty(&state.store);

        let doc = body(get_status(State(state)).await).await;
        assert_eq!(doc["sequence"], 1);
        assert_eq!(doc["next_sequence"], 2);
        assert_eq!(doc["publisher"], "idle");
        assert_eq!(doc["stream_clients"], Value::Array(Vec::new()));
    }

    #[test]
    fn resume_greetings() {
        let state = state();
        for _ in 0..3 {
            commit_empty(&state.store);
        }

        let current = state.clients.register(None, (), |c| greet_resuming(&state.store, c, 2));
        assert_eq!(current.since(), Some(2));

        let previous = state.clients.register(None, (), |c| greet_resuming(&state.store, c, 1));
        assert_eq!(previous.since(), Some(2));

        let stale = state.clients.register(None, (), |c| greet_resuming(&state.store, c, 0));
        assert_eq!(stale.since(), Some(2));
        assert_eq!(stale.queued(), 1);
    }
}
