//! WebSocket client connections for the document and cursor channels.
//!
//! Provides:
//! - Connection lifecycle published through a `watch` channel
//! - A writer task fed by a bounded queue; sends never wait
//! - A reader task that decodes frames into [`ConnectionEvent`]s
//!
//! Sends made while closed are skipped, not queued.

use std::marker::PhantomData;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

use crate::cursor::CursorTransport;
use crate::presence::{PresenceChange, RemotePresence};
use crate::protocol::{CursorMessage, DocumentMessage, ProtocolError, TransportError};
use crate::sync::{DocumentTransport, SyncHandle};

/// Frames buffered for the writer task.
pub const OUTGOING_CAPACITY: usize = 256;
/// Events buffered for the application.
pub const EVENT_CAPACITY: usize = 256;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent<M> {
    Connected,
    Message(M),
    Disconnected,
}

pub type DocumentEvent = ConnectionEvent<DocumentMessage>;
pub type CursorEvent = ConnectionEvent<CursorMessage>;

/// A JSON message type carried by one channel.
pub trait WireMessage: Sized + Send + 'static {
    fn encode(&self) -> Result<String, ProtocolError>;
    fn decode(text: &str) -> Result<Self, ProtocolError>;
}

impl WireMessage for DocumentMessage {
    fn encode(&self) -> Result<String, ProtocolError> {
        DocumentMessage::encode(self)
    }

    fn decode(text: &str) -> Result<Self, ProtocolError> {
        DocumentMessage::decode(text)
    }
}

impl WireMessage for CursorMessage {
    fn encode(&self) -> Result<String, ProtocolError> {
        CursorMessage::encode(self)
    }

    fn decode(text: &str) -> Result<Self, ProtocolError> {
        CursorMessage::decode(text)
    }
}

enum Outgoing {
    Frame(String),
    Close,
}

/// One open WebSocket carrying messages of type `M`.
pub struct Connection<M> {
    state: watch::Receiver<ConnectionState>,
    outgoing: mpsc::Sender<Outgoing>,
    _message: PhantomData<fn(M) -> M>,
}

pub type DocumentConnection = Connection<DocumentMessage>;
pub type CursorConnection = Connection<CursorMessage>;

impl<M: WireMessage> Connection<M> {
    /// Connect to `url` and spawn the reader and writer tasks.
    ///
    /// `hello` is queued before anything else the caller sends.
    async fn open(url: &str, hello: Option<M>) -> Result<(Self, mpsc::Receiver<ConnectionEvent<M>>), ProtocolError> {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (ws_stream, _) = tokio_tungstenite::connect_async(url).await.map_err(|e| {
            state_tx.send_replace(ConnectionState::Disconnected);
            ProtocolError::ConnectFailed(e.to_string())
        })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Outgoing>(OUTGOING_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);

        if let Some(hello) = hello {
            let _ = out_tx.try_send(Outgoing::Frame(hello.encode()?));
        }

        state_tx.send_replace(ConnectionState::Connected);
        let _ = event_tx.send(ConnectionEvent::Connected).await;
        log::info!("Connected to {url}");

        // Writer task: forward outgoing queue to the socket
        let writer_state = state_tx.clone();
        tokio::spawn(async move {
            while let Some(out) = out_rx.recv().await {
                let result = match out {
                    Outgoing::Frame(text) => ws_writer.send(Message::Text(text.into())).await,
                    Outgoing::Close => {
                        let _ = ws_writer.send(Message::Close(None)).await;
                        break;
                    }
                };
                if let Err(e) = result {
                    log::debug!("Write failed: {e}");
                    break;
                }
            }
            writer_state.send_replace(ConnectionState::Disconnected);
        });

        // Reader task: decode incoming frames
        let url = url.to_string();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match M::decode(text.as_str()) {
                        Ok(msg) => {
                            if event_tx.send(ConnectionEvent::Message(msg)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Malformed frame from {url}: {e}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        log::debug!("Read from {url} failed: {e}");
                        break;
                    }
                    _ => {}
                }
            }

            state_tx.send_replace(ConnectionState::Disconnected);
            let _ = event_tx.send(ConnectionEvent::Disconnected).await;
            log::info!("Disconnected from {url}");
        });

        Ok((
            Self {
                state: state_rx,
                outgoing: out_tx,
                _message: PhantomData,
            },
            event_rx,
        ))
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Queue `msg` without waiting.
    pub fn send_message(&self, msg: &M) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        let text = msg.encode().map_err(|e| {
            log::error!("Dropping unencodable frame: {e}");
            TransportError::Closed
        })?;
        self.outgoing.try_send(Outgoing::Frame(text)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    /// Send a close frame after anything already queued.
    pub fn close(&self) {
        let _ = self.outgoing.try_send(Outgoing::Close);
    }
}

impl DocumentConnection {
    /// Open the document channel and request the current document.
    pub async fn connect(url: &str) -> Result<(Self, mpsc::Receiver<DocumentEvent>), ProtocolError> {
        Self::open(url, Some(DocumentMessage::GetDocument)).await
    }
}

impl CursorConnection {
    pub async fn connect(url: &str) -> Result<(Self, mpsc::Receiver<CursorEvent>), ProtocolError> {
        Self::open(url, None).await
    }
}

impl DocumentTransport for DocumentConnection {
    fn is_open(&self) -> bool {
        Connection::is_open(self)
    }

    fn send(&self, msg: DocumentMessage) -> Result<(), TransportError> {
        self.send_message(&msg)
    }
}

impl CursorTransport for CursorConnection {
    fn is_open(&self) -> bool {
        Connection::is_open(self)
    }

    fn send(&self, msg: CursorMessage) -> Result<(), TransportError> {
        self.send_message(&msg)
    }
}

impl SyncHandle {
    /// Feed document channel events into the sync client until the
    /// connection ends. The shadow is dropped on connect and on disconnect.
    pub async fn follow(&self, mut events: mpsc::Receiver<DocumentEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::Connected => self.reset(),
                ConnectionEvent::Message(msg) => self.handle_message(msg),
                ConnectionEvent::Disconnected => {
                    self.reset();
                    break;
                }
            }
        }
    }
}

impl RemotePresence {
    /// Fold a cursor channel event into the table. Peers are forgotten on disconnect.
    pub fn handle_event(&mut self, event: &CursorEvent) -> PresenceChange {
        match event {
            ConnectionEvent::Message(msg) => self.handle_message(msg),
            ConnectionEvent::Connected => PresenceChange::Ignored,
            ConnectionEvent::Disconnected => {
                self.clear();
                PresenceChange::Ignored
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{ClientId, ClientInfo, CursorPosition};

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = DocumentConnection::connect(&format!("ws://{addr}/document")).await;
        assert!(matches!(result, Err(ProtocolError::ConnectFailed(_))));
    }

    #[test]
    fn test_presence_cleared_on_disconnect() {
        let mut presence = RemotePresence::new(ClientId::new("me"));
        let msg = CursorMessage::position(
            ClientId::new("peer"),
            CursorPosition::new(0, 0),
            ClientInfo::new("Peer", "#fff"),
        );
        assert_eq!(
            presence.handle_event(&ConnectionEvent::Message(msg)),
            PresenceChange::Joined(ClientId::new("peer"))
        );
        presence.handle_event(&ConnectionEvent::Disconnected);
        assert_eq!(presence.peer_count(), 0);
    }
}
