use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use axum::extract::ws::{Message, Utf8Bytes, WebSocket};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::time::timeout;
use uuid::Uuid;

use super::outbox::Outbox;

const NO_SEQUENCE: u64 = u64::MAX;

fn load(cell: &AtomicU64) -> Option<u64> {
    match cell.load(Ordering::Acquire) {
        NO_SEQUENCE => None,
        n => Some(n),
    }
}

fn store(cell: &AtomicU64, value: Option<u64>) {
    cell.store(value.unwrap_or(NO_SEQUENCE), Ordering::Release);
}

/// One connected network client.
///
/// `S` is per-broadcaster client state, such as channel subscriptions.
pub struct ClientHandle<S = ()> {
    id: Uuid,
    addr: Option<SocketAddr>,
    outbox: Outbox<Utf8Bytes>,
    since: AtomicU64,
    last_ack: AtomicU64,
    pub state: S,
}

impl<S> ClientHandle<S> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    /// Sequence this client already holds; feed events at or below it are skipped.
    pub fn since(&self) -> Option<u64> {
        load(&self.since)
    }

    pub fn set_since(&self, sequence: Option<u64>) {
        store(&self.since, sequence);
    }

    /// Last sequence the client acknowledged, for transports that ack.
    pub fn last_ack(&self) -> Option<u64> {
        load(&self.last_ack)
    }

    pub fn acknowledge(&self, sequence: u64) {
        let _ = self
            .last_ack
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current == NO_SEQUENCE || sequence > current).then_some(sequence)
            });
    }

    pub fn send(&self, frame: Utf8Bytes) -> bool {
        self.outbox.push(frame)
    }

    pub fn dropped_frames(&self) -> u64 {
        self.outbox.dropped()
    }

    /// Frames waiting to be written.
    pub fn queued(&self) -> usize {
        self.outbox.len()
    }

    fn wants(&self, sequence: Option<u64>) -> bool {
        match (sequence, self.since()) {
            (Some(seq), Some(since)) => seq > since,
            _ => true,
        }
    }
}

/// Anything that can report how many clients it is serving.
pub trait ConnectedClients: Send + Sync {
    fn connected(&self) -> usize;
}

/// The clients of one broadcaster.
///
/// Registration takes the write lock and fan-out the read lock, so a client
/// greeted with sequence N never misses N+1 and never receives N twice.
pub struct ClientSet<S = ()> {
    broadcaster: &'static str,
    buffer: usize,
    clients: RwLock<AHashMap<Uuid, Arc<ClientHandle<S>>>>,
}

impl<S> ConnectedClients for ClientSet<S>
where
    S: Send + Sync,
{
    fn connected(&self) -> usize {
        self.len()
    }
}

impl<S> ClientSet<S> {
    pub fn new(broadcaster: &'static str, buffer: usize) -> Self {
        Self {
            broadcaster,
            buffer,
            clients: RwLock::new(AHashMap::new()),
        }
    }

    pub fn broadcaster(&self) -> &'static str {
        self.broadcaster
    }

    /// Add a client. `greet` runs before the client becomes visible to
    /// fan-out; it queues the opening frames and returns the sequence they
    /// bring the client up to.
    pub fn register<G>(&self, addr: Option<SocketAddr>, state: S, greet: G) -> Arc<ClientHandle<S>>
    where
        G: FnOnce(&ClientHandle<S>) -> Option<u64>,
    {
        let client = Arc::new(ClientHandle {
            id: Uuid::new_v4(),
            addr,
            outbox: Outbox::new(self.buffer),
            since: AtomicU64::new(NO_SEQUENCE),
            last_ack: AtomicU64::new(NO_SEQUENCE),
            state,
        });

        let mut clients = self.clients.write();
        client.set_since(greet(&client));
        clients.insert(client.id, client.clone());

        tracing::info!(
            broadcaster = self.broadcaster,
            client = %client.id,
            addr = ?addr,
            since = ?client.since(),
            total = clients.len(),
            "client connected"
        );
        client
    }

    pub fn remove(&self, id: Uuid) -> bool {
        let removed = self.clients.write().remove(&id);
        match removed {
            Some(client) => {
                client.outbox.close();
                tracing::info!(
                    broadcaster = self.broadcaster,
                    client = %id,
                    dropped_frames = client.dropped_frames(),
                    "client disconnected"
                );
                true
            }
            None => false,
        }
    }

    /// Queue frames for every client that does not already hold `sequence`.
    /// `frames` picks what each client gets, possibly nothing. Returns how
    /// many clients received at least one frame.
    pub fn broadcast<F, I>(&self, sequence: Option<u64>, mut frames: F) -> usize
    where
        F: FnMut(&ClientHandle<S>) -> I,
        I: IntoIterator<Item = Utf8Bytes>,
    {
        let clients = self.clients.read();
        let mut reached = 0;
        for client in clients.values() {
            if !client.wants(sequence) {
                continue;
            }
            let mut sent = false;
            for bytes in frames(client) {
                sent |= client.send(bytes);
            }
            if sent {
                reached += 1;
            }
            if let Some(seq) = sequence {
                client.set_since(Some(seq));
            }
        }
        reached
    }

    /// Re-run a greeting for an already registered client, e.g. when it
    /// asks for the snapshot again. Excludes concurrent fan-out like
    /// [`register`](Self::register) does.
    pub fn regreet<G>(&self, client: &ClientHandle<S>, greet: G)
    where
        G: FnOnce(&ClientHandle<S>) -> Option<u64>,
    {
        let _clients = self.clients.write();
        if let Some(sequence) = greet(client) {
            client.set_since(Some(sequence));
        }
    }

    /// Throw away every client's backlog and queue `frame` in its place.
    pub fn resync_all(&self, sequence: u64, frame: Utf8Bytes) {
        let clients = self.clients.read();
        for client in clients.values() {
            client.outbox.replace_all(frame.clone());
            client.set_since(Some(sequence));
        }
        tracing::info!(broadcaster = self.broadcaster, sequence, clients = clients.len(), "clients resynced");
    }

    /// Every connected client, in no particular order.
    pub fn handles(&self) -> Vec<Arc<ClientHandle<S>>> {
        self.clients.read().values().cloned().collect()
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<ClientHandle<S>>> {
        self.clients.read().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }
}

/// Pump `client`'s outbox into `socket` and hand inbound text to `on_text`
/// until either side stops. Each send is bounded by `send_timeout`; a client
/// that cannot take a frame in time is dropped.
pub async fn serve_socket<S, F>(
    set: Arc<ClientSet<S>>,
    client: Arc<ClientHandle<S>>,
    socket: WebSocket,
    send_timeout: Duration,
    mut on_text: F,
) where
    S: Send + Sync + 'static,
    F: FnMut(&ClientHandle<S>, &str) + Send + 'static,
{
    let (mut sender, mut receiver) = socket.split();
    let broadcaster = set.broadcaster();
    let id = client.id();

    let outgoing = client.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = outgoing.outbox.pop().await {
            match timeout(send_timeout, sender.send(Message::Text(frame))).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::debug!(broadcaster, client = %id, "send failed: {err}");
                    break;
                }
                Err(_) => {
                    tracing::warn!(
                        broadcaster,
                        client = %id,
                        timeout_ms = send_timeout.as_millis() as u64,
                        "send timed out; dropping slow client"
                    );
                    break;
                }
            }
        }
    });

    let incoming = client.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => on_text(&incoming, text.as_str()),
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    set.remove(id);
}
