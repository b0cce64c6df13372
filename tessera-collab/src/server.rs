//! WebSocket relay with per-document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐  /document/<name>
//!             ├── DocumentRoom ── DocumentStore (authoritative)
//! Client B ──┘         │
//!                      └── BroadcastGroup ──► other connections
//!
//! Client A ──┐  /cursors/<name>
//!             ├── CursorRoom ── PresenceRegistry
//! Client B ──┘         │
//!                      └── BroadcastGroup ──► other connections
//! ```
//!
//! Every inbound message is applied and fanned out while holding the room
//! map's write lock, so all connections see changes in apply order.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tessera_core::{Document, DEFAULT_EDITOR_VERSION};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{self, Message};
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, ConnectionId, Frame};
use crate::presence::PresenceRegistry;
use crate::protocol::{Channel, CursorMessage, CursorUpdate, DocumentMessage, ProtocolError};
use crate::store::DocumentStore;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per connection before it lags
    pub broadcast_capacity: usize,
    /// Seconds between status reports; 0 disables them
    pub status_interval_secs: u64,
    /// Version stamped on newly created documents
    pub editor_version: String,
    /// Document served on `/document` and `/cursors` without a name
    pub default_document: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            broadcast_capacity: 256,
            status_interval_secs: 30,
            editor_version: DEFAULT_EDITOR_VERSION.to_string(),
            default_document: "default".to_string(),
        }
    }
}

impl ServerConfig {
    /// Read overrides from the process environment.
    ///
    /// `TESSERA_BIND_ADDR` wins over `PORT`; `PORT` binds all interfaces.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("TESSERA_BIND_ADDR").filter(|a| !a.trim().is_empty()) {
            config.bind_addr = addr;
        } else if let Some(port) = lookup("PORT") {
            match port.trim().parse::<u16>() {
                Ok(port) => config.bind_addr = format!("0.0.0.0:{port}"),
                Err(_) => log::warn!("Ignoring invalid PORT {port:?}"),
            }
        }

        if let Some(secs) = lookup("TESSERA_STATUS_INTERVAL") {
            match secs.trim().parse::<u64>() {
                Ok(secs) => config.status_interval_secs = secs,
                Err(_) => log::warn!("Ignoring invalid TESSERA_STATUS_INTERVAL {secs:?}"),
            }
        }

        if let Some(name) = lookup("TESSERA_DEFAULT_DOCUMENT").filter(|n| !n.trim().is_empty()) {
            config.default_document = name.trim().to_string();
        }

        config
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_handshakes: u64,
    pub total_messages: u64,
    pub malformed_messages: u64,
}

/// One line of the periodic status report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentStatus {
    pub name: String,
    pub blocks: usize,
    pub connections: usize,
    pub cursors: usize,
}

/// Document room: authoritative store + broadcast group.
struct DocumentRoom {
    store: DocumentStore,
    broadcast: BroadcastGroup,
}

impl DocumentRoom {
    fn new(config: &ServerConfig) -> Self {
        Self {
            store: DocumentStore::new(&config.editor_version),
            broadcast: BroadcastGroup::new(config.broadcast_capacity),
        }
    }
}

/// Cursor room: presence table + broadcast group.
struct CursorRoom {
    presence: PresenceRegistry,
    broadcast: BroadcastGroup,
}

impl CursorRoom {
    fn new(config: &ServerConfig) -> Self {
        Self {
            presence: PresenceRegistry::new(),
            broadcast: BroadcastGroup::new(config.broadcast_capacity),
        }
    }
}

/// State shared by every connection task.
#[derive(Clone)]
struct Shared {
    config: Arc<ServerConfig>,
    documents: Arc<RwLock<HashMap<String, DocumentRoom>>>,
    cursors: Arc<RwLock<HashMap<String, CursorRoom>>>,
    stats: Arc<RwLock<ServerStats>>,
}

impl Shared {
    fn new(config: ServerConfig) -> Self {
        Self {
            config: Arc::new(config),
            documents: Arc::new(RwLock::new(HashMap::new())),
            cursors: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    async fn join(&self, channel: &Channel, connection: ConnectionId) -> broadcast::Receiver<Arc<Frame>> {
        match channel {
            Channel::Document(name) => {
                let mut docs = self.documents.write().await;
                let room = docs.entry(name.clone()).or_insert_with(|| {
                    log::info!("Created document {name:?}");
                    DocumentRoom::new(&self.config)
                });
                room.broadcast.add_peer(connection)
            }
            Channel::Cursor(name) => {
                let mut rooms = self.cursors.write().await;
                let room = rooms
                    .entry(name.clone())
                    .or_insert_with(|| CursorRoom::new(&self.config));
                room.broadcast.add_peer(connection)
            }
        }
    }

    /// Detach a connection. Cursor rooms announce removal of every client the
    /// connection still owned.
    async fn leave(&self, channel: &Channel, connection: ConnectionId) {
        match channel {
            Channel::Document(name) => {
                let mut docs = self.documents.write().await;
                if let Some(room) = docs.get_mut(name) {
                    room.broadcast.remove_peer(&connection);
                }
            }
            Channel::Cursor(name) => {
                let mut rooms = self.cursors.write().await;
                let Some(room) = rooms.get_mut(name) else {
                    return;
                };
                room.broadcast.remove_peer(&connection);
                for client_id in room.presence.remove_connection(connection) {
                    log::info!("Cursor {client_id} left {name:?} (disconnected)");
                    match CursorMessage::remove(client_id).encode() {
                        Ok(text) => {
                            room.broadcast.broadcast(Some(connection), text);
                        }
                        Err(e) => log::error!("Failed to encode cursor removal: {e}"),
                    }
                }
            }
        }
    }

    /// Handle one text frame. Returns a reply for the sender, if any.
    async fn handle_text(&self, channel: &Channel, connection: ConnectionId, text: &str) -> Option<String> {
        self.stats.write().await.total_messages += 1;
        let handled = match channel {
            Channel::Document(name) => match DocumentMessage::decode(text) {
                Ok(msg) => Ok(self.handle_document_message(name, connection, msg).await),
                Err(e) => Err(e),
            },
            Channel::Cursor(name) => match CursorMessage::decode(text) {
                Ok(msg) => {
                    self.handle_cursor_message(name, connection, msg, text).await;
                    Ok(None)
                }
                Err(e) => Err(e),
            },
        };

        match handled {
            Ok(reply) => reply,
            Err(e) => {
                log::warn!("Malformed frame on {}: {e}", channel.path());
                self.stats.write().await.malformed_messages += 1;
                None
            }
        }
    }

    async fn handle_document_message(
        &self,
        name: &str,
        connection: ConnectionId,
        msg: DocumentMessage,
    ) -> Option<String> {
        log::trace!("{} on {name:?} from {connection}", msg.kind());
        match msg {
            DocumentMessage::GetDocument => {
                let docs = self.documents.read().await;
                let document = docs.get(name)?.store.get().clone();
                encode_or_log(&DocumentMessage::document_data(document))
            }
            DocumentMessage::DocumentChange { data, client_id } => {
                let mut docs = self.documents.write().await;
                let room = docs.get_mut(name)?;
                room.store.replace(data);
                let out = DocumentMessage::document_change(room.store.get().clone(), client_id);
                if let Some(text) = encode_or_log(&out) {
                    room.broadcast.broadcast(Some(connection), text);
                }
                None
            }
            DocumentMessage::BlockChange {
                change,
                timestamp,
                client_id,
            } => {
                let mut docs = self.documents.write().await;
                let room = docs.get_mut(name)?;
                if !room.store.apply_operation(&change) {
                    log::debug!(
                        "{} at {} left {name:?} unchanged ({} blocks)",
                        change.action(),
                        change.index(),
                        room.store.block_count()
                    );
                }
                let out = DocumentMessage::BlockChange {
                    change,
                    timestamp,
                    client_id,
                };
                if let Some(text) = encode_or_log(&out) {
                    room.broadcast.broadcast(Some(connection), text);
                }
                None
            }
            DocumentMessage::DocumentData { .. } => {
                log::debug!("Ignoring document_data sent by {connection}");
                None
            }
        }
    }

    async fn handle_cursor_message(&self, name: &str, connection: ConnectionId, msg: CursorMessage, raw: &str) {
        let mut rooms = self.cursors.write().await;
        let Some(room) = rooms.get_mut(name) else {
            return;
        };

        match msg.update() {
            Ok(CursorUpdate::Removed) => {
                if room.presence.remove(&msg.client_id).is_some() {
                    log::info!("Cursor {} left {name:?}", msg.client_id);
                }
            }
            Ok(CursorUpdate::Moved {
                position,
                client_info,
            }) => {
                let name_for_log = client_info.name.clone();
                if room.presence.upsert(msg.client_id.clone(), connection, position, client_info) {
                    log::info!("Cursor {} ({name_for_log}) joined {name:?}", msg.client_id);
                }
            }
            Err(e) => {
                log::warn!("Dropping cursor frame: {e}");
                return;
            }
        }

        room.broadcast.broadcast(Some(connection), raw.to_string());
    }

    async fn record_lag(&self, channel: &Channel, n: u64) {
        match channel {
            Channel::Document(name) => {
                if let Some(room) = self.documents.read().await.get(name) {
                    room.broadcast.record_dropped(n);
                }
            }
            Channel::Cursor(name) => {
                if let Some(room) = self.cursors.read().await.get(name) {
                    room.broadcast.record_dropped(n);
                }
            }
        }
    }

    async fn status(&self) -> Vec<DocumentStatus> {
        let docs = self.documents.read().await;
        let cursors = self.cursors.read().await;
        let names: BTreeSet<&String> = docs.keys().chain(cursors.keys()).collect();

        names
            .into_iter()
            .map(|name| {
                let room = docs.get(name);
                DocumentStatus {
                    name: name.clone(),
                    blocks: room.map_or(0, |r| r.store.block_count()),
                    connections: room.map_or(0, |r| r.broadcast.peer_count()),
                    cursors: cursors.get(name).map_or(0, |r| r.presence.len()),
                }
            })
            .collect()
    }
}

fn encode_or_log(msg: &DocumentMessage) -> Option<String> {
    match msg.encode() {
        Ok(text) => Some(text),
        Err(e) => {
            log::error!("Failed to encode {}: {e}", msg.kind());
            None
        }
    }
}

/// Aborts the status reporter when the accept loop exits.
struct Reporter(JoinHandle<()>);

impl Drop for Reporter {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// The relay server.
#[derive(Clone)]
pub struct RelayServer {
    shared: Shared,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            shared: Shared::new(config),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!("Relay server listening on {}", listener.local_addr()?);
        let _reporter = self.spawn_status_report();

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    fn spawn_status_report(&self) -> Option<Reporter> {
        let secs = self.shared.config.status_interval_secs;
        if secs == 0 {
            return None;
        }
        let shared = self.shared.clone();
        Some(Reporter(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(secs));
            interval.tick().await;
            loop {
                interval.tick().await;
                report_status(&shared).await;
            }
        })))
    }

    /// Current authoritative document, if it has been opened.
    pub async fn document(&self, name: &str) -> Option<Document> {
        self.shared
            .documents
            .read()
            .await
            .get(name)
            .map(|room| room.store.get().clone())
    }

    /// Number of cursors present in `name`'s cursor room.
    pub async fn cursor_count(&self, name: &str) -> usize {
        self.shared
            .cursors
            .read()
            .await
            .get(name)
            .map_or(0, |room| room.presence.len())
    }

    /// Per-document activity, ordered by name.
    pub async fn status(&self) -> Vec<DocumentStatus> {
        self.shared.status().await
    }

    pub async fn stats(&self) -> ServerStats {
        self.shared.stats.read().await.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }
}

async fn report_status(shared: &Shared) {
    let status = shared.status().await;
    let stats = shared.stats.read().await.clone();
    log::info!(
        "Status: {} document(s), {} active connection(s), {} message(s) handled",
        status.len(),
        stats.active_connections,
        stats.total_messages
    );
    for doc in status {
        log::info!(
            "  {:?}: {} block(s), {} editor(s), {} cursor(s)",
            doc.name,
            doc.blocks,
            doc.connections,
            doc.cursors
        );
    }
}

/// Upgrade one TCP connection and run it until it closes.
async fn handle_connection(stream: TcpStream, addr: SocketAddr, shared: Shared) -> Result<(), ServerError> {
    let mut channel = None;
    let default_document = shared.config.default_document.clone();
    let route = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        match Channel::from_path(req.uri().path(), &default_document) {
            Some(c) => {
                channel = Some(c);
                Ok(resp)
            }
            None => {
                let mut err = ErrorResponse::new(Some("Not Found".to_string()));
                *err.status_mut() = StatusCode::NOT_FOUND;
                Err(err)
            }
        }
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, route).await {
        Ok(ws) => ws,
        Err(tungstenite::Error::Http(resp)) => {
            log::info!("Rejected upgrade from {addr}: {}", resp.status());
            shared.stats.write().await.rejected_handshakes += 1;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    let channel = channel.ok_or_else(|| ProtocolError::UnknownChannel(addr.to_string()))?;

    let connection = Uuid::new_v4();
    log::info!("{addr} connected to {} as {connection}", channel.path());
    {
        let mut s = shared.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let rx = shared.join(&channel, connection).await;
    let result = session(ws, addr, connection, &channel, &shared, rx).await;
    shared.leave(&channel, connection).await;

    shared.stats.write().await.active_connections -= 1;
    log::info!("{addr} left {}", channel.path());
    result
}

async fn session(
    ws: tokio_tungstenite::WebSocketStream<TcpStream>,
    addr: SocketAddr,
    connection: ConnectionId,
    channel: &Channel,
    shared: &Shared,
    mut rx: broadcast::Receiver<Arc<Frame>>,
) -> Result<(), ServerError> {
    let (mut ws_sender, mut ws_receiver) = ws.split();

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = shared.handle_text(channel, connection, text.as_str()).await {
                            ws_sender.send(Message::Text(reply.into())).await?;
                        }
                    }

                    Some(Ok(Message::Binary(data))) => {
                        log::debug!("Dropping {}-byte binary frame from {addr}", data.len());
                    }

                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }

                    Some(Ok(Message::Close(_))) | None => {
                        log::debug!("Connection closed from {addr}");
                        break;
                    }

                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break;
                    }

                    Some(Ok(_)) => {}
                }
            }

            frame = rx.recv() => {
                match frame {
                    Ok(frame) => {
                        if frame.is_for(connection) {
                            ws_sender.send(Message::Text(frame.text.clone().into())).await?;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        log::warn!("Connection {connection} lagged by {n} frames");
                        shared.record_lag(channel, n).await;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    Ok(())
}
