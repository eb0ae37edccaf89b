/// Live-reload notifications over WebSocket.
///
/// Browsers connect to `/ws` and stay connected; every message received on
/// the broadcaster's inbound channel is written verbatim to each of them.
/// Inbound frames from clients carry no meaning and are only read to notice
/// disconnects.
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::future::join_all;
use futures::stream::SplitSink;
use futures::{SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The peer went away; expected on every normal disconnect.
    #[error("connection closed")]
    Closed,
    #[error("write timed out")]
    TimedOut,
    #[error("{0}")]
    Io(String),
}

/// Write side of a live-reload connection.
pub trait Client: Send + 'static {
    fn send(&mut self, text: String) -> impl Future<Output = Result<(), ClientError>> + Send;
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Longest a single client write may take before the client is dropped.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(2);

type Shared<C> = Arc<Mutex<C>>;

/// Registry of connected clients. Insertion, removal and the fan-out
/// snapshot all go through the same lock; writes happen with it released.
pub struct Broadcaster<C> {
    clients: Mutex<HashMap<u64, Shared<C>>>,
    next_id: AtomicU64,
}

impl<C: Client> Default for Broadcaster<C> {
    fn default() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<C: Client> Broadcaster<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `client` to the registry, then reads `incoming` until it ends or
    /// fails, at which point the client is removed and closed.
    pub async fn register<S, T, E>(&self, client: C, mut incoming: S)
    where
        S: Stream<Item = Result<T, E>> + Unpin,
        E: Display,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.clients
            .lock()
            .await
            .insert(id, Arc::new(Mutex::new(client)));
        tracing::debug!(
            "[livereload] Client {id} connected, {} registered",
            self.client_count().await
        );

        loop {
            match incoming.next().await {
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!("[livereload] Client {id} receive error: {e}");
                    break;
                }
                None => break,
            }
        }

        let removed = self.clients.lock().await.remove(&id);
        if let Some(client) = removed {
            client.lock().await.close().await;
        }
        tracing::debug!("[livereload] Client {id} disconnected");
    }

    /// Writes every message from `rx` to every registered client. Writes run
    /// concurrently, each bounded by [`SEND_TIMEOUT`]; a client whose write
    /// fails or times out is closed and dropped from the registry.
    pub async fn run(&self, mut rx: mpsc::UnboundedReceiver<String>) {
        while let Some(msg) = rx.recv().await {
            let targets: Vec<(u64, Shared<C>)> = self
                .clients
                .lock()
                .await
                .iter()
                .map(|(id, client)| (*id, Arc::clone(client)))
                .collect();

            let results = join_all(targets.into_iter().map(|(id, client)| {
                let msg = msg.clone();
                async move {
                    let mut client = client.lock().await;
                    let result = match timeout(SEND_TIMEOUT, client.send(msg)).await {
                        Ok(result) => result,
                        Err(_) => Err(ClientError::TimedOut),
                    };
                    (id, result)
                }
            }))
            .await;

            let mut failed = Vec::new();
            for (id, result) in results {
                if let Err(e) = result {
                    if !matches!(e, ClientError::Closed) {
                        tracing::warn!("[livereload] Error: {e}");
                    }
                    failed.push(id);
                }
            }
            if failed.is_empty() {
                continue;
            }

            let removed: Vec<Shared<C>> = {
                let mut clients = self.clients.lock().await;
                failed.iter().filter_map(|id| clients.remove(id)).collect()
            };
            for client in removed {
                client.lock().await.close().await;
            }
        }
    }

    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }
}

// ── WebSocket transport ───────────────────────────────────────────────────────

pub struct WsClient(SplitSink<WebSocket, Message>);

impl Client for WsClient {
    async fn send(&mut self, text: String) -> Result<(), ClientError> {
        self.0.send(Message::Text(text.into())).await.map_err(classify)
    }

    async fn close(&mut self) {
        let _ = self.0.close().await;
    }
}

/// Peer resets and broken pipes are ordinary disconnects.
fn classify(e: axum::Error) -> ClientError {
    use std::error::Error as _;
    use std::io::ErrorKind;

    let mut source = e.source();
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                ErrorKind::BrokenPipe
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::UnexpectedEof
            ) {
                return ClientError::Closed;
            }
        }
        source = err.source();
    }
    ClientError::Io(e.to_string())
}

pub type WsBroadcaster = Broadcaster<WsClient>;

/// Binds the live-reload endpoint. Done up front so a bad address fails
/// startup instead of a background task.
pub async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind live-reload endpoint {addr}"))
}

/// Serves `GET /ws` on `listener`, registering every upgraded socket with
/// `broadcaster`.
pub async fn serve(listener: TcpListener, broadcaster: Arc<WsBroadcaster>) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("[livereload] Listening on ws://{addr}/ws");
    }
    let app = Router::new()
        .route("/ws", get(upgrade))
        .with_state(broadcaster);
    axum::serve(listener, app)
        .await
        .context("Live-reload server failed")
}

async fn upgrade(
    ws: WebSocketUpgrade,
    State(broadcaster): State<Arc<WsBroadcaster>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        broadcaster.register(WsClient(sink), stream).await;
    })
}
